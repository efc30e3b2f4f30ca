//! Well-known names and socket paths.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// Environment variable that tells clients where the active pool listens.
pub const SERVER_ENV: &str = "PREWARM_SERVER";

/// Prefix of every pool socket file name.
pub const SOCKET_PREFIX: &str = "prewarm_";

/// Generate a fresh, unpredictable socket path in the temp directory.
///
/// The name is `prewarm_` followed by 32 hex characters, e.g.
/// `/tmp/prewarm_9f0c5e2b7d3a41c8b6e1f0a2d4c6e8b0`.
pub fn new_socket_path() -> PathBuf {
    new_socket_path_in(&std::env::temp_dir())
}

/// Same as [`new_socket_path`], rooted at `dir`.
pub fn new_socket_path_in(dir: &Path) -> PathBuf {
    let token = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!("{}{}", SOCKET_PREFIX, token))
}

/// Socket path of the registered pool, if any.
///
/// An empty value counts as unset.
pub fn registered_server() -> Option<PathBuf> {
    std::env::var_os(SERVER_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Whether `path` exists and is a Unix socket.
pub fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}
