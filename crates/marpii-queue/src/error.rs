use std::collections::VecDeque;
use std::sync::Mutex;

use ash::vk;
use thiserror::Error;

use crate::{queue_family::ProtectionType, serial::QueueSerial, util::lock};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("Timed out after {timeout_ns}ns")]
    Timeout { timeout_ns: u64 },
    #[error("Queue serial {0:?} was never submitted")]
    NotSubmitted(QueueSerial),
    #[error("Queue serial {0:?} is unassigned or its index is out of range")]
    InvalidQueueSerial(QueueSerial),
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),
    #[error("Command pool for {0:?} was not initialized")]
    PoolNotInitialized(ProtectionType),
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
    #[error("Worker thread exited")]
    WorkerExited,
}

impl QueueError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, QueueError::VkError(vk::Result::ERROR_DEVICE_LOST))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            QueueError::Timeout { .. } | QueueError::VkError(vk::Result::TIMEOUT)
        )
    }

    ///Translates the error of a fence wait with `timeout_ns`. `TIMEOUT` becomes [QueueError::Timeout].
    pub fn from_wait(result: vk::Result, timeout_ns: u64) -> Self {
        if result == vk::Result::TIMEOUT {
            QueueError::Timeout { timeout_ns }
        } else {
            QueueError::VkError(result)
        }
    }
}

///Outcome of a bounded wait that is allowed to time out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Finished,
    Timeout,
}

///Errors that occurred on a worker thread. There is no caller to report to there, so they are collected until the
/// next synchronous call picks them up.
#[derive(Debug, Default)]
pub struct ErrorQueue {
    errors: Mutex<VecDeque<QueueError>>,
}

impl ErrorQueue {
    pub fn push(&self, error: QueueError) {
        #[cfg(feature = "logging")]
        log::error!("Worker error: {}", error);

        lock(&self.errors).push_back(error);
    }

    pub fn has_pending_error(&self) -> bool {
        !lock(&self.errors).is_empty()
    }

    ///Returns the oldest pending error. All newer errors are dropped.
    pub fn check_and_pop_pending_error(&self) -> Result<(), QueueError> {
        let mut errors = lock(&self.errors);
        let Some(first) = errors.pop_front() else {
            return Ok(());
        };

        #[cfg(feature = "logging")]
        for discarded in errors.iter() {
            log::warn!("Discarding worker error: {}", discarded);
        }
        errors.clear();
        Err(first)
    }
}
