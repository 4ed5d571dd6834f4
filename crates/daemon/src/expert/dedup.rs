// Dedup keys for expert analysis submissions.

use sha2::{Digest, Sha256};

/// CRLF becomes LF, trailing whitespace is trimmed per line, and the whole
/// text is trimmed.
pub fn normalize_content(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// `sha256(tool ‖ 0x00 ‖ normalized content)`, hex-encoded.
pub fn dedup_key(tool: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_content(content).as_bytes());
    format!("{:x}", hasher.finalize())
}
