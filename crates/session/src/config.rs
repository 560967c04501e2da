//! Session catalog configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the session catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Sessions unused for this long, with no open transaction, are reaped
    pub idle_session_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            idle_session_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl CatalogConfig {
    pub fn for_testing() -> Self {
        Self {
            idle_session_timeout: Duration::from_millis(100),
        }
    }

    pub fn with_idle_session_timeout(mut self, timeout: Duration) -> Self {
        self.idle_session_timeout = timeout;
        self
    }
}
