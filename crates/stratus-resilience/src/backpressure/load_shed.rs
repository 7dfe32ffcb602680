//! Priority-aware load shedding.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResilienceError;

/// Priority of a request (higher is more important).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work, shed first.
    Low,
    /// Regular work.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
    /// Never shed.
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// How the shedder decides once load passes `max_load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShedMode {
    /// Fixed overload tiers per priority.
    #[default]
    Deterministic,
    /// Rejection probability grows with overload, scaled by priority.
    Probabilistic,
}

/// Load shedding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadShedConfig {
    /// Load fraction (0.0-1.0) above which shedding starts.
    pub max_load: f64,
    /// Decision mode.
    pub mode: ShedMode,
}

impl Default for LoadShedConfig {
    fn default() -> Self {
        Self { max_load: 0.8, mode: ShedMode::Deterministic }
    }
}

/// Rejects lower-priority requests when the system is overloaded.
#[derive(Debug, Clone)]
pub struct LoadShedder {
    config: LoadShedConfig,
}

impl LoadShedder {
    /// Create a new load shedder.
    pub fn new(config: LoadShedConfig) -> Self {
        Self { config }
    }

    /// How far past `max_load` the system is, scaled to 0.0-1.0 of the remaining headroom.
    fn overload(&self, load: f64) -> f64 {
        if load <= self.config.max_load {
            return 0.0;
        }
        let headroom = 1.0 - self.config.max_load;
        if headroom <= f64::EPSILON {
            return 1.0;
        }
        ((load - self.config.max_load) / headroom).clamp(0.0, 1.0)
    }

    /// Checks whether a request of `priority` may run at `load`.
    pub fn check(&self, load: f64, priority: Priority) -> Result<(), ResilienceError> {
        let overload = self.overload(load);
        if overload <= 0.0 || priority == Priority::Critical {
            return Ok(());
        }

        let shed = match self.config.mode {
            ShedMode::Deterministic => match priority {
                Priority::Low => true,
                Priority::Normal => overload >= 1.0 / 3.0,
                Priority::High => overload >= 2.0 / 3.0,
                Priority::Critical => false,
            },
            ShedMode::Probabilistic => {
                let weight = match priority {
                    Priority::Low => 1.0,
                    Priority::Normal => 2.0 / 3.0,
                    Priority::High => 1.0 / 3.0,
                    Priority::Critical => 0.0,
                };
                rand::thread_rng().r#gen::<f64>() < overload * weight
            }
        };

        if shed {
            debug!(priority = %priority, load = load, overload = overload, "Shedding request");
            return Err(ResilienceError::LoadShed { priority: priority.to_string(), load });
        }
        Ok(())
    }
}

impl Default for LoadShedder {
    fn default() -> Self {
        Self::new(LoadShedConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shedder(mode: ShedMode) -> LoadShedder {
        LoadShedder::new(LoadShedConfig { max_load: 0.7, mode })
    }

    #[test]
    fn test_nothing_shed_below_max_load() {
        let shedder = shedder(ShedMode::Deterministic);
        assert!(shedder.check(0.7, Priority::Low).is_ok());
        assert!(shedder.check(0.1, Priority::Normal).is_ok());
    }

    #[test]
    fn test_deterministic_tiers() {
        let shedder = shedder(ShedMode::Deterministic);

        // Slightly overloaded: only low priority is shed.
        assert!(shedder.check(0.75, Priority::Low).is_err());
        assert!(shedder.check(0.75, Priority::Normal).is_ok());

        // Heavily overloaded: everything but critical is shed.
        assert!(shedder.check(0.99, Priority::Normal).is_err());
        assert!(shedder.check(0.99, Priority::High).is_err());
        assert!(shedder.check(1.5, Priority::Critical).is_ok());
    }

    #[test]
    fn test_probabilistic_full_overload_sheds_low() {
        let shedder = shedder(ShedMode::Probabilistic);
        for _ in 0..50 {
            assert!(shedder.check(1.0, Priority::Low).is_err());
            assert!(shedder.check(1.0, Priority::Critical).is_ok());
        }
    }
}
