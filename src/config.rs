use thiserror::Error;

use crate::ErrorKind;

pub const DEFAULT_STORAGE_KEY_PREFIX: &str = "plant_system_state";
pub const DEFAULT_HISTORY_CAP: usize = 100;
pub const DEFAULT_GROWTH_HISTORY_CAP: usize = 50;
pub const DEFAULT_LOG_CAP: usize = 200;
pub const DEFAULT_PROFILE_NAME: &str = "My Garden";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    Zero { field: &'static str },

    #[error("history_prune_steps must be strictly decreasing, got {0:?}")]
    PruneStepsNotDecreasing(Vec<usize>),

    #[error("history prune step {step} must be below history_cap {cap}")]
    PruneStepAboveCap { step: usize, cap: usize },

    #[error("storage_key_prefix is invalid: {0}")]
    InvalidKeyPrefix(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub storage_key_prefix: String,
    /// Canonical bound on `history`; oldest records beyond it are dropped.
    pub history_cap: usize,
    pub growth_history_cap: usize,
    pub log_cap: usize,
    /// History sizes tried, in order, after the visual cache has been cleared.
    pub history_prune_steps: Vec<usize>,
    /// Re-read every write and compare signatures.
    pub verify_writes: bool,
    pub default_profile_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_key_prefix: DEFAULT_STORAGE_KEY_PREFIX.to_string(),
            history_cap: DEFAULT_HISTORY_CAP,
            growth_history_cap: DEFAULT_GROWTH_HISTORY_CAP,
            log_cap: DEFAULT_LOG_CAP,
            history_prune_steps: vec![10, 2],
            verify_writes: true,
            default_profile_name: DEFAULT_PROFILE_NAME.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_cap == 0 {
            return Err(ConfigError::Zero {
                field: "history_cap",
            });
        }
        if self.growth_history_cap == 0 {
            return Err(ConfigError::Zero {
                field: "growth_history_cap",
            });
        }
        if self.log_cap == 0 {
            return Err(ConfigError::Zero { field: "log_cap" });
        }
        if self.history_prune_steps.iter().any(|&s| s == 0) {
            return Err(ConfigError::Zero {
                field: "history_prune_steps",
            });
        }
        if self
            .history_prune_steps
            .windows(2)
            .any(|pair| pair[1] >= pair[0])
        {
            return Err(ConfigError::PruneStepsNotDecreasing(
                self.history_prune_steps.clone(),
            ));
        }
        if let Some(&step) = self.history_prune_steps.first() {
            if step >= self.history_cap {
                return Err(ConfigError::PruneStepAboveCap {
                    step,
                    cap: self.history_cap,
                });
            }
        }

        let prefix = &self.storage_key_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidKeyPrefix(prefix.clone()));
        }
        Ok(())
    }
}
