use crate::error::{Error, Result};
use bitflags::bitflags;
use std::time::Duration;

bitflags! {
    /// Optional scheduler behaviors.
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SchedulerFeatures: u32 {
        /// Submissions, presents and flushes go through a worker thread.
        const ASYNC_COMMAND_QUEUE = 0b0001;
        /// Finished command buffers are reset and garbage is collected on the worker thread.
        const ASYNC_CLEANUP = 0b0010;
        /// Every task takes a few extra milliseconds on the worker thread, to shake out
        /// ordering bugs in tests.
        const SLOW_ASYNC_COMMAND_QUEUE_FOR_TESTING = 0b0100;
    }
}

/// Scheduler tunables.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum number of submitted batches whose fence hasn't been observed signaled yet.
    pub in_flight_commands_limit: usize,
    /// Maximum number of batches (in flight or finished) that haven't been released yet.
    pub finished_commands_limit: usize,
    /// Capacity of the worker thread task queue.
    pub task_queue_capacity: usize,
    /// Timeout of fence waits that are expected to complete.
    pub max_fence_wait_time: Duration,
    /// Amount of pending suballocation garbage (in bytes) above which submissions wait for
    /// older batches to finish.
    pub max_suballocation_garbage_size: u64,
    /// Batches left in flight when waiting for garbage to be freed.
    pub min_in_flight_batches_to_keep: usize,
    pub features: SchedulerFeatures,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            in_flight_commands_limit: 50,
            finished_commands_limit: 64,
            task_queue_capacity: 16,
            max_fence_wait_time: Duration::from_secs(120),
            max_suballocation_garbage_size: 64 * 1024 * 1024,
            min_in_flight_batches_to_keep: 1,
            features: SchedulerFeatures::ASYNC_COMMAND_QUEUE | SchedulerFeatures::ASYNC_CLEANUP,
        }
    }
}

impl SchedulerConfig {
    /// Configuration with everything running on the calling thread.
    pub fn synchronous() -> SchedulerConfig {
        SchedulerConfig {
            features: SchedulerFeatures::empty(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_flight_commands_limit == 0 {
            return Err(Error::InvalidConfig("in_flight_commands_limit must not be zero"));
        }
        if self.finished_commands_limit <= self.in_flight_commands_limit {
            return Err(Error::InvalidConfig(
                "finished_commands_limit must be greater than in_flight_commands_limit",
            ));
        }
        if self.task_queue_capacity == 0 {
            return Err(Error::InvalidConfig("task_queue_capacity must not be zero"));
        }
        Ok(())
    }

    pub fn max_fence_wait_time_ns(&self) -> u64 {
        self.max_fence_wait_time.as_nanos().min(u64::MAX as u128) as u64
    }

    pub fn is_async(&self) -> bool {
        self.features.contains(SchedulerFeatures::ASYNC_COMMAND_QUEUE)
    }

    pub fn is_async_cleanup(&self) -> bool {
        self.features.contains(SchedulerFeatures::ASYNC_CLEANUP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = SchedulerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_fence_wait_time_ns(), 120_000_000_000);
        assert!(config.is_async());
    }

    #[test]
    fn in_flight_limit_must_leave_room_in_finished_ring() {
        let config = SchedulerConfig {
            in_flight_commands_limit: 64,
            finished_commands_limit: 64,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
