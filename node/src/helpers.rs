//! Small helpers shared across the node.

use std::path::{Path, PathBuf};

/// Expands a bare `:port` listen address to a bindable `0.0.0.0:port` form.
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Storage root for a node: `<db-dir>/files` when a metadata database path
/// is configured outside the working directory, otherwise a per-port
/// `node_<port>_data` directory.
pub fn storage_root_for(listen_addr: &str, db_path: Option<&Path>) -> PathBuf {
    if let Some(db) = db_path {
        let dir = db.parent().unwrap_or_else(|| Path::new(""));
        if !dir.as_os_str().is_empty() && dir != Path::new(".") {
            return dir.join("files");
        }
    }

    let port = listen_addr.rsplit(':').next().unwrap_or(listen_addr);
    PathBuf::from(format!("node_{}_data", port))
}

/// Formats a Unix timestamp for tabular CLI output; `None` renders "never".
pub fn format_ts(secs: Option<i64>) -> String {
    match secs.and_then(|s| chrono::DateTime::from_timestamp(s, 0)) {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "never".to_string(),
    }
}
