//! Trellis Configuration
//!
//! INI-style settings for the proxy: ordered sections of `key = value`
//! pairs with `#`/`;` comments. The same model backs the config file, the
//! `/admin/config` dump/update endpoints and the `-C` dry-run check.
//!
//! ```ini
//! [global]
//! listen_port = 8080
//! threads = 4
//! strategy = weighted
//!
//! [backends]
//! server1 = 10.0.0.1:9000 weight=3
//! ```

mod error;
mod loader;
pub mod validation;

pub use error::{ConfigError, Result};
pub use loader::Settings;
pub use validation::validate;

use serde::{Deserialize, Serialize};

// ============================================================================
// Admin update payloads
// ============================================================================

/// One `set` operation from `/admin/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub section: String,
    pub key: String,
    pub value: String,
}

/// One `delete` operation from `/admin/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDelete {
    pub section: String,
    pub key: String,
}

/// JSON body accepted by `POST /admin/config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdateRequest {
    #[serde(default)]
    pub updates: Vec<ConfigUpdate>,
    #[serde(default)]
    pub deletes: Vec<ConfigDelete>,
    /// 1 = persist the merged settings back to the config file.
    #[serde(default)]
    pub save: u8,
}
