//! Run configuration.

use serde::{Deserialize, Serialize};

use crate::error::MapReduceError;

/// Capacity used for both queues unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 1;

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

/// Sizing for one map-reduce run.
///
/// Options can be built in code or deserialized from a config file:
///
/// ```
/// let options: mrflow::Options = serde_json::from_str(r#"{ "workers": 8 }"#).unwrap();
/// assert_eq!(options.source_capacity, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Number of mapper workers.
    pub workers: usize,
    /// Capacity of the queue between the generator and the mappers.
    #[serde(default = "default_capacity")]
    pub source_capacity: usize,
    /// Capacity of the queue between the mappers and the reducer.
    #[serde(default = "default_capacity")]
    pub intermediate_capacity: usize,
}

impl Default for Options {
    /// No workers; a run with default options fails until a worker count is set.
    fn default() -> Self {
        Self {
            workers: 0,
            source_capacity: DEFAULT_CAPACITY,
            intermediate_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Options {
    /// Options with `workers` mappers and default queue capacities.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Check the worker count and queue capacities.
    pub fn validate(&self) -> Result<(), MapReduceError> {
        if self.workers < 1 {
            return Err(MapReduceError::InvalidWorkers(self.workers));
        }
        if self.source_capacity < 1 {
            return Err(MapReduceError::InvalidCapacity {
                queue: "source",
                capacity: self.source_capacity,
            });
        }
        if self.intermediate_capacity < 1 {
            return Err(MapReduceError::InvalidCapacity {
                queue: "intermediate",
                capacity: self.intermediate_capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_workers() {
        let options = Options::default();
        assert!(matches!(
            options.validate(),
            Err(MapReduceError::InvalidWorkers(0))
        ));
    }

    #[test]
    fn test_new_is_valid() {
        let options = Options::new(4);
        assert_eq!(options.workers, 4);
        assert_eq!(options.intermediate_capacity, DEFAULT_CAPACITY);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let options = Options {
            intermediate_capacity: 0,
            ..Options::new(2)
        };
        assert!(matches!(
            options.validate(),
            Err(MapReduceError::InvalidCapacity {
                queue: "intermediate",
                capacity: 0
            })
        ));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let options: Options =
            serde_json::from_str(r#"{ "workers": 3, "source_capacity": 16 }"#).unwrap();
        assert_eq!(options.workers, 3);
        assert_eq!(options.source_capacity, 16);
        assert_eq!(options.intermediate_capacity, 1);
    }

    #[test]
    fn test_deserialize_requires_workers() {
        let result = serde_json::from_str::<Options>(r#"{ "source_capacity": 16 }"#);
        assert!(result.is_err());
    }
}
