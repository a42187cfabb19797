//! # MarpII Queue
//!
//! Command submission and GPU progress tracking for Vulkan queues.
//!
//! # Usage
//!
//! Every stream of submissions (usually one per rendering context) allocates a [SerialIndex] and generates a
//! monotonically increasing [QueueSerial] per submission. Resources remember the serials they were used with in a
//! [ResourceUse]. The [CommandQueue] submits batches, tracks their fences and publishes which serials completed, so
//! asking whether a resource is still in use is a cheap atomic comparison.
//!
//! Most users go through the [Renderer], which owns the queue, allocates serial indices and, if configured, moves
//! submissions onto a [CommandProcessor] thread and release/garbage work onto a [CleanUpThread].
//!
//! All Vulkan calls go through the [Driver] trait. [Device] implements it on top of `ash`.
//!
//! Command buffers, fences and events are recycled. A command buffer is never reset or reused before the fence of the
//! submission that executed it signaled.

pub use ash;

///Submission batches and their fences.
pub mod batch;

///Background thread for releasing finished batches and destroying garbage.
pub mod cleanup_thread;

///Persistent command pools and primary/secondary command buffer handling.
pub mod command_pool;

///Externally synchronised access to the command pools and the per priority command accumulators.
pub mod command_pool_access;

pub mod command_processor;

pub mod command_queue;

mod config;
pub use config::QueueConfig;

///Vulkan device wrapper implementing [Driver].
pub mod device;

pub mod driver;

mod error;
pub use error::{ErrorQueue, QueueError, WaitStatus};

///Deferred destruction of objects that might still be in use by the GPU.
pub mod garbage;

///Queue family selection and the mapping of priorities to hardware queues.
pub mod queue_family;

mod renderer;
pub use renderer::Renderer;

mod resource_use;
pub use resource_use::ResourceUse;

///Fixed capacity FIFO.
pub mod ring;

///Serials, serial indices and their atomic bookkeeping.
pub mod serial;

///Fences, events and their recyclers.
pub mod sync;

mod util;

#[cfg(test)]
mod mock;

pub use cleanup_thread::CleanUpThread;
pub use command_processor::CommandProcessor;
pub use command_queue::CommandQueue;
pub use device::Device;
pub use driver::Driver;
pub use queue_family::{Priority, ProtectionType, QueueFamily};
pub use serial::{QueueSerial, Serial, SerialIndex};
