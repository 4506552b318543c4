//! Server configuration
//!
//! Port is read from a `port.info` file in the working directory, one
//! plain-text integer, falling back to the default port if the file is
//! missing or unparseable. `ServerConfig::load` follows the same
//! load-with-fallback shape as the launcher's `Config::load`, but the
//! wire protocol's own `port.info` predates a structured TOML config
//! layer, so there's a single field and no serde derive.

use std::path::Path;

use tracing::warn;

/// Port used when `port.info` is absent or malformed.
pub const DEFAULT_PORT: u16 = 1256;

/// Server listen configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
}

impl ServerConfig {
    /// Load the listening port from `port.info`, or fall back to
    /// [`DEFAULT_PORT`] when the file is missing or unparseable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let port = match std::fs::read_to_string(path) {
            Ok(contents) => match contents.trim().parse() {
                Ok(port) => port,
                Err(err) => {
                    warn!(%err, path = %path.display(), "port.info did not contain a valid port, using default");
                    DEFAULT_PORT
                }
            },
            Err(err) => {
                warn!(%err, path = %path.display(), "could not read port.info, using default");
                DEFAULT_PORT
            }
        };
        Self { port }
    }
}
