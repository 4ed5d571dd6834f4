// Bounded worker pool for blocking provider work, plus the providers that
// run on it.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{GenerateRequest, ProviderClient, ProviderError};

/// Runs blocking closures on tokio's blocking threads, at most `workers`
/// at a time. Callers beyond that wait asynchronously for a slot.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BlockingPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self { permits: Arc::new(Semaphore::new(workers)), workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ProviderError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Worker("blocking pool closed".into()))
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|error| ProviderError::Worker(error.to_string()))
    }
}

type BlockingFn = dyn Fn(&GenerateRequest) -> Result<String, ProviderError> + Send + Sync;

/// Adapts a synchronous provider function onto the pool.
pub struct BlockingProvider {
    name: String,
    pool: BlockingPool,
    generate: Arc<BlockingFn>,
}

impl BlockingProvider {
    pub fn new<F>(name: impl Into<String>, pool: BlockingPool, generate: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self { name: name.into(), pool, generate: Arc::new(generate) }
    }
}

#[async_trait]
impl ProviderClient for BlockingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let generate = Arc::clone(&self.generate);
        let request = request.clone();
        match tokio::time::timeout(timeout, self.pool.run(move || generate(&request))).await {
            Ok(result) => result?,
            // The worker thread finishes on its own; only the caller gives up.
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }
}

/// Pipes the prompt into a local command and returns its stdout. The child
/// is killed and its pool slot freed as soon as the call is dropped.
pub struct CommandProvider {
    name: String,
    program: String,
    args: Vec<String>,
    pool: BlockingPool,
}

impl CommandProvider {
    /// Split `command_line` on whitespace into program + arguments. No shell
    /// is involved.
    pub fn parse(
        name: impl Into<String>,
        command_line: &str,
        pool: BlockingPool,
    ) -> Result<Self, ProviderError> {
        let mut parts = command_line.split_whitespace().map(ToOwned::to_owned);
        let program = parts
            .next()
            .ok_or_else(|| ProviderError::Request("provider command is empty".into()))?;
        Ok(Self { name: name.into(), program, args: parts.collect(), pool })
    }

    async fn run_command(&self, prompt: &str) -> Result<String, ProviderError> {
        let program = self.program.as_str();
        let mut child = Command::new(program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                ProviderError::Request(format!("failed to spawn `{program}`: {error}"))
            })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(error) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(program, %error, "provider command closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|error| ProviderError::Worker(error.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Request(format!(
                "`{program}` exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProviderClient for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let _permit = self.pool.acquire().await?;
        debug!(program = %self.program, tool = %request.tool, "running provider command");
        match tokio::time::timeout(timeout, self.run_command(&request.prompt)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }
}
