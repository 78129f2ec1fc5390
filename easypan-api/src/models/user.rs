use serde::{Deserialize, Serialize};

/// Storage space usage of the current user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseSpace {
    /// Used space in bytes
    #[serde(default)]
    pub use_space: u64,
    /// Total quota in bytes
    #[serde(default)]
    pub total_space: u64,
}

impl UseSpace {
    /// Used space as a percentage of the quota, clamped to 0-100
    pub fn percent(&self) -> f64 {
        if self.total_space == 0 {
            return 0.0;
        }
        (self.use_space as f64 / self.total_space as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Bytes left before the quota is reached
    pub fn remaining(&self) -> u64 {
        self.total_space.saturating_sub(self.use_space)
    }
}
