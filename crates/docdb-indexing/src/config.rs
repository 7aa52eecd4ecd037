//! Executor configuration.

use serde::{Deserialize, Serialize};

use docdb_types::Settings;

/// Configuration for the indexing executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on indexes handled concurrently. 1 forces sequential passes.
    #[serde(default = "default_max_parallel_index_tasks")]
    pub max_number_of_parallel_index_tasks: usize,
}

fn default_max_parallel_index_tasks() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_number_of_parallel_index_tasks: default_max_parallel_index_tasks(),
        }
    }
}

impl ExecutorConfig {
    /// Set the parallelism cap. Values below 1 are raised to 1.
    pub fn with_max_parallel_index_tasks(mut self, max: usize) -> Self {
        self.max_number_of_parallel_index_tasks = max.max(1);
        self
    }
}

impl From<&Settings> for ExecutorConfig {
    fn from(settings: &Settings) -> Self {
        Self::default().with_max_parallel_index_tasks(settings.max_number_of_parallel_index_tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExecutorConfig::default();
        assert!(config.max_number_of_parallel_index_tasks >= 1);
    }

    #[test]
    fn test_zero_is_clamped() {
        let config = ExecutorConfig::default().with_max_parallel_index_tasks(0);
        assert_eq!(config.max_number_of_parallel_index_tasks, 1);
    }

    #[test]
    fn test_from_settings() {
        let settings = Settings {
            max_number_of_parallel_index_tasks: 6,
            ..Default::default()
        };
        let config = ExecutorConfig::from(&settings);
        assert_eq!(config.max_number_of_parallel_index_tasks, 6);
    }

    #[test]
    fn test_serde_defaults() {
        let config: ExecutorConfig = serde_json::from_str("{}").unwrap();
        assert!(config.max_number_of_parallel_index_tasks >= 1);
    }
}
