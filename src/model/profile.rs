//! Profiles (§3 "Profile").

use serde::{Deserialize, Serialize};

/// A named load-order-and-groups-and-app-version container. At any time
/// one profile is active per application; switching updates every
/// deployer. Per-profile load orders and conflict groups live on the
/// deployer records themselves (§3 "Deployer"), keyed by profile name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub app_version: Option<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app_version: None,
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new("Default")
    }
}
