//! Diagnostics output.
//!
//! The analysis tool shows anything written to stderr as a capture failure,
//! so diagnostics stay silent unless a debug file is configured (or
//! `RUST_LOG` asks for them explicitly).

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::{CaptureError, Result};

/// Install the global subscriber.
///
/// With `debug_file`, every event at `DEBUG` or above is appended to it
/// without colours. Otherwise events go to stderr, filtered by `RUST_LOG`
/// and off by default.
pub fn init(debug_file: Option<&Path>) -> Result<()> {
    let installed = match debug_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                CaptureError::config_error(format!(
                    "cannot create debug file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            tracing_subscriber::fmt()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_max_level(Level::DEBUG)
                .with_thread_names(true)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")),
            )
            .try_init(),
    };
    installed.map_err(|e| CaptureError::config_error(format!("cannot install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritable_debug_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("debug.log");
        let err = init(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("debug.log"));
    }
}
