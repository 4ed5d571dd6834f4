// Process bookkeeping: state directory and PID file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::global_dir;

const PID_FILE_NAME: &str = "conclaved.pid";

/// Resolved paths for daemon runtime files.
pub struct DaemonPaths {
    pub base_dir: PathBuf,
    pub pid_path: PathBuf,
}

impl DaemonPaths {
    /// Resolve paths under `~/.conclave/`, creating the directory.
    pub fn resolve() -> Result<Self> {
        let base_dir = global_dir().context("could not determine home directory")?;
        Self::under(base_dir)
    }

    /// Resolve paths under an explicit base directory, creating it.
    pub fn under(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create `{}`", base_dir.display()))?;
        set_mode(&base_dir, 0o700)?;
        Ok(Self { pid_path: base_dir.join(PID_FILE_NAME), base_dir })
    }

    /// Record this process in the PID file. A PID left by an earlier run is
    /// reported and replaced.
    pub fn claim_pid_file(&self) -> Result<PidFile> {
        let pid = std::process::id();
        if let Some(previous) = recorded_pid(&self.pid_path).filter(|previous| *previous != pid) {
            warn!(previous, path = %self.pid_path.display(), "replacing PID file from an earlier run");
        }

        // Write beside the target and rename so readers never see a partial PID.
        let staging = self.pid_path.with_extension("pid.tmp");
        let mut file = fs::File::create(&staging)
            .with_context(|| format!("failed to create `{}`", staging.display()))?;
        set_mode(&staging, 0o600)?;
        write!(file, "{pid}").context("failed to write PID")?;
        file.sync_all().context("failed to flush PID file")?;
        fs::rename(&staging, &self.pid_path)
            .with_context(|| format!("failed to install `{}`", self.pid_path.display()))?;

        info!(pid, path = %self.pid_path.display(), "claimed PID file");
        Ok(PidFile { path: self.pid_path.clone(), pid })
    }
}

/// Held for the daemon's lifetime. Dropping it removes the PID file unless
/// another process has claimed it since.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match recorded_pid(&self.path) {
            Some(owner) if owner == self.pid => {
                if let Err(error) = fs::remove_file(&self.path) {
                    warn!(%error, path = %self.path.display(), "failed to remove PID file");
                }
            }
            Some(owner) => {
                info!(owner, path = %self.path.display(), "PID file now belongs to another daemon; leaving it");
            }
            None => {}
        }
    }
}

/// PID recorded in `path`, if the file exists and parses.
pub fn recorded_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to restrict `{}` to {mode:o}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }

    Ok(())
}
