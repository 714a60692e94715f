//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default bound on nested notification depth.
pub const DEFAULT_MAX_NOTIFY_DEPTH: usize = 64;

/// Tunables applied to every cell a store declares. Child scopes inherit
/// their parent's config.
///
/// ```rust
/// use lattice_state::StoreConfig;
///
/// let config = StoreConfig::from_json(r#"{ "max_notify_depth": 16 }"#).unwrap();
/// assert_eq!(config.max_notify_depth, 16);
/// assert!(config.dedupe_notifications);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// How deeply writes may recurse through subscribers before failing.
    pub max_notify_depth: usize,

    /// Deliver each `(cell, version)` transition at most once per observer,
    /// even when the observer is registered through several scopes.
    pub dedupe_notifications: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_notify_depth: DEFAULT_MAX_NOTIFY_DEPTH,
            dedupe_notifications: true,
        }
    }
}

impl StoreConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    pub fn with_max_notify_depth(mut self, depth: usize) -> Self {
        self.max_notify_depth = depth;
        self.normalized()
    }

    pub fn with_dedupe_notifications(mut self, dedupe: bool) -> Self {
        self.dedupe_notifications = dedupe;
        self
    }

    fn normalized(mut self) -> Self {
        self.max_notify_depth = self.max_notify_depth.max(1);
        self
    }
}
