use crate::error::QueueError;

///Tuning knobs of the command queue and its worker threads.
///
/// The defaults match a desktop driver. Use [with](QueueConfig::with) to change single values:
/// ```
/// # use marpii_queue::QueueConfig;
/// let config = QueueConfig::default().with(|c| c.async_command_processing = true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    ///Capacity of the ring of submitted, not yet completed batches.
    pub in_flight_commands_limit: usize,
    ///Capacity of the ring of completed, not yet released batches. Must be at least `in_flight_commands_limit`.
    pub finished_commands_limit: usize,
    ///Upper bound for internal waits (backpressure, device loss, worker side finish).
    pub max_fence_wait_time_ns: u64,
    pub max_recycled_fences: usize,
    pub max_recycled_events: usize,
    ///If set, the clean-up thread resets released command buffers right away instead of deferring the reset to the
    /// next allocation.
    pub async_command_buffer_reset: bool,
    ///Run release and garbage collection on the clean-up thread.
    pub async_garbage_cleanup: bool,
    ///Follow every submission with an external fence by an empty submission that signals an owned fence.
    pub enable_extra_submit_fence: bool,
    ///Route submissions and presents through the command processor thread.
    pub async_command_processing: bool,
    pub command_processor_task_limit: usize,
    ///Pending garbage in bytes after which [post_submit_check](crate::CommandQueue::post_submit_check) starts
    /// waiting for old submissions.
    pub max_garbage_size: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            in_flight_commands_limit: 50,
            finished_commands_limit: 64,
            max_fence_wait_time_ns: 120_000_000_000,
            max_recycled_fences: 64,
            max_recycled_events: 64,
            async_command_buffer_reset: true,
            async_garbage_cleanup: false,
            enable_extra_submit_fence: false,
            async_command_processing: false,
            command_processor_task_limit: 16,
            max_garbage_size: 64 * 1024 * 1024,
        }
    }
}

impl QueueConfig {
    ///Maps `self` through `f`.
    pub fn with(mut self, mut f: impl FnMut(&mut Self)) -> Self {
        f(&mut self);
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.in_flight_commands_limit == 0 {
            return Err(QueueError::InvalidConfig(
                "in_flight_commands_limit must not be 0".to_owned(),
            ));
        }
        if self.finished_commands_limit < self.in_flight_commands_limit {
            return Err(QueueError::InvalidConfig(format!(
                "finished_commands_limit ({}) must be >= in_flight_commands_limit ({})",
                self.finished_commands_limit, self.in_flight_commands_limit
            )));
        }
        if self.command_processor_task_limit == 0 {
            return Err(QueueError::InvalidConfig(
                "command_processor_task_limit must not be 0".to_owned(),
            ));
        }
        Ok(())
    }
}
