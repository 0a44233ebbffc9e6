//! Platform-property configuration.
//!
//! The signaling endpoint can be set through a platform property; property
//! reads may block (they go through platform IPC on device), so the read
//! happens on a short-lived thread with a hard budget. On expiry or when
//! the property is unset, the client falls back to localhost.

use std::time::Duration;

use tracing::{debug, info, warn};

pub const WEBSOCKET_URI_PROPERTY: &str = "debug.mirage.websocket_uri";
pub const DEFAULT_WEBSOCKET_URI: &str = "ws://127.0.0.1:8080/ws";
pub const PROPERTY_READ_TIMEOUT: Duration = Duration::from_millis(5000);

/// Platform property access; the device implementation wraps the system
/// property store, desktop hosts read environment variables.
pub trait PropertyReader: Send + 'static {
    fn read(&self, name: &str) -> Option<String>;
}

/// Reads `debug.mirage.websocket_uri` as `DEBUG_MIRAGE_WEBSOCKET_URI`.
pub struct EnvPropertyReader;

impl PropertyReader for EnvPropertyReader {
    fn read(&self, name: &str) -> Option<String> {
        let key = name.to_ascii_uppercase().replace('.', "_");
        std::env::var(key).ok().filter(|value| !value.is_empty())
    }
}

/// Resolve the signaling endpoint within `timeout`.
pub fn read_websocket_uri(reader: impl PropertyReader, timeout: Duration) -> String {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(reader.read(WEBSOCKET_URI_PROPERTY));
    });

    match rx.recv_timeout(timeout) {
        Ok(Some(uri)) => {
            info!(%uri, "using configured signaling endpoint");
            uri
        }
        Ok(None) => {
            debug!("{WEBSOCKET_URI_PROPERTY} not set");
            DEFAULT_WEBSOCKET_URI.to_owned()
        }
        Err(_) => {
            warn!(
                "timed out after {} ms reading {}",
                timeout.as_millis(),
                WEBSOCKET_URI_PROPERTY
            );
            DEFAULT_WEBSOCKET_URI.to_owned()
        }
    }
}
