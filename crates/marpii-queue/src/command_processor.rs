//! # Command processor
//!
//! Moves submissions and presents off the application thread. Tasks are executed strictly in the order they were
//! enqueued. When the bounded task queue is full, the enqueuing thread executes the oldest task itself instead of
//! waiting for the worker.
//!
//! Three locks are involved, always taken in this order: the enqueue lock (serialises producers and guards the
//! *work available* condition), the dequeue lock (held while a task executes, so at most one task runs at any time),
//! and the task queue itself, which is only held for single push/pop operations.

use std::sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;

use ahash::AHashMap;
use ash::vk;

use crate::{
    command_pool_access::{OutsideRenderPassCommands, RenderPassCommands},
    command_queue::CommandQueue,
    driver::{ForeignImageBarrier, PresentInfo, is_non_fatal_present_result},
    error::{ErrorQueue, QueueError},
    queue_family::{Priority, ProtectionType},
    resource_use::ResourceUse,
    ring::FixedQueue,
    serial::QueueSerial,
    sync::SharedExternalFence,
    util::lock,
};

///Commands recorded by the frontend that are replayed into the primary command buffer on the worker.
pub enum RecordedCommands {
    OutsideRenderPass(Box<dyn OutsideRenderPassCommands + Send>),
    RenderPass {
        commands: Box<dyn RenderPassCommands + Send>,
        render_pass: vk::RenderPass,
        framebuffer_override: vk::Framebuffer,
    },
}

pub enum CommandProcessorTask {
    ProcessCommands {
        protection: ProtectionType,
        priority: Priority,
        commands: RecordedCommands,
    },
    ///Wait semaphores for the next submission of (`protection`, `priority`) that is processed after this task.
    FlushWaitSemaphores {
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    },
    FlushAndQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        foreign_barriers: Vec<ForeignImageBarrier>,
        queue_serial: QueueSerial,
    },
    OneOffQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        queue_serial: QueueSerial,
    },
    FinishToSerial {
        queue_serial: QueueSerial,
    },
    Present {
        priority: Priority,
        present: PresentInfo,
    },
    CheckCompletedCommands,
    Exit,
}

impl CommandProcessorTask {
    pub fn name(&self) -> &'static str {
        match self {
            CommandProcessorTask::ProcessCommands { .. } => "ProcessCommands",
            CommandProcessorTask::FlushWaitSemaphores { .. } => "FlushWaitSemaphores",
            CommandProcessorTask::FlushAndQueueSubmit { .. } => "FlushAndQueueSubmit",
            CommandProcessorTask::OneOffQueueSubmit { .. } => "OneOffQueueSubmit",
            CommandProcessorTask::FinishToSerial { .. } => "FinishToSerial",
            CommandProcessorTask::Present { .. } => "Present",
            CommandProcessorTask::CheckCompletedCommands => "CheckCompletedCommands",
            CommandProcessorTask::Exit => "Exit",
        }
    }
}

impl std::fmt::Debug for CommandProcessorTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug)]
struct PresentStatus {
    ///Presents on this swapchain that were enqueued but did not execute yet.
    queued: usize,
    result: vk::Result,
}

struct Shared {
    queue: Arc<CommandQueue>,
    enqueue_lock: Mutex<()>,
    work_available: Condvar,
    dequeue_lock: Mutex<()>,
    tasks: Mutex<FixedQueue<CommandProcessorTask>>,
    should_exit: AtomicBool,
    errors: ErrorQueue,
    present_status: Mutex<AHashMap<vk::SwapchainKHR, PresentStatus>>,
    present_done: Condvar,
}

impl Shared {
    fn process_task(&self, task: CommandProcessorTask) -> Result<(), QueueError> {
        #[cfg(feature = "logging")]
        log::trace!("Processing {:?}", task);

        match task {
            CommandProcessorTask::ProcessCommands {
                protection,
                priority,
                commands,
            } => match commands {
                RecordedCommands::OutsideRenderPass(mut commands) => self
                    .queue
                    .flush_outside_render_pass_commands(protection, priority, commands.as_mut()),
                RecordedCommands::RenderPass {
                    mut commands,
                    render_pass,
                    framebuffer_override,
                } => self.queue.flush_render_pass_commands(
                    protection,
                    priority,
                    render_pass,
                    framebuffer_override,
                    commands.as_mut(),
                ),
            },
            CommandProcessorTask::FlushWaitSemaphores {
                protection,
                priority,
                semaphores,
                stage_masks,
            } => {
                self.queue
                    .flush_wait_semaphores(protection, priority, semaphores, stage_masks);
                Ok(())
            }
            CommandProcessorTask::FlushAndQueueSubmit {
                protection,
                priority,
                signal_semaphore,
                external_fence,
                foreign_barriers,
                queue_serial,
            } => {
                self.queue.submit_commands(
                    protection,
                    priority,
                    signal_semaphore,
                    external_fence,
                    &foreign_barriers,
                    queue_serial,
                )?;
                self.queue.post_submit_check()
            }
            CommandProcessorTask::OneOffQueueSubmit {
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                queue_serial,
            } => {
                self.queue.queue_submit_one_off(
                    protection,
                    priority,
                    command_buffer,
                    wait_semaphore,
                    queue_serial,
                )?;
                self.queue.post_submit_check()
            }
            CommandProcessorTask::FinishToSerial { queue_serial } => self
                .queue
                .finish_queue_serial(queue_serial, self.queue.config().max_fence_wait_time_ns),
            CommandProcessorTask::Present { priority, present } => {
                let result = self.queue.queue_present(priority, &present);
                self.present_executed(present.swapchain, result);

                if is_non_fatal_present_result(result) {
                    Ok(())
                } else {
                    Err(QueueError::VkError(result))
                }
            }
            CommandProcessorTask::CheckCompletedCommands => {
                self.queue.check_and_cleanup_completed_commands()
            }
            CommandProcessorTask::Exit => {
                self.should_exit.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    ///Runs `task` on the calling thread. Errors go straight back to the caller.
    fn process_task_inline(&self, task: CommandProcessorTask) -> Result<(), QueueError> {
        self.process_task(task).inspect_err(|e| {
            if e.is_device_lost() {
                self.queue.handle_device_lost();
            }
        })
    }

    fn handle_worker_error(&self, error: QueueError) {
        if error.is_device_lost() {
            self.queue.handle_device_lost();
        }
        self.errors.push(error);
    }

    ///Records the result of a present that left the task queue.
    fn present_executed(&self, swapchain: vk::SwapchainKHR, result: vk::Result) {
        let mut status = lock(&self.present_status);
        let entry = status.entry(swapchain).or_insert(PresentStatus {
            queued: 0,
            result: vk::Result::SUCCESS,
        });
        debug_assert!(entry.queued > 0, "present on {swapchain:?} was never enqueued");
        entry.queued = entry.queued.saturating_sub(1);
        entry.result = result;
        self.present_done.notify_all();
    }

    fn has_work_or_exit(&self) -> bool {
        !lock(&self.tasks).is_empty() || self.should_exit.load(Ordering::Acquire)
    }
}

fn run(shared: &Shared) {
    #[cfg(feature = "logging")]
    log::trace!("{} started", CommandProcessor::THREAD_NAME);

    loop {
        {
            let enqueue = lock(&shared.enqueue_lock);
            let _enqueue = shared
                .work_available
                .wait_while(enqueue, |_| !shared.has_work_or_exit())
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if lock(&shared.tasks).is_empty() && shared.should_exit.load(Ordering::Acquire) {
                break;
            }
        }

        //enqueue lock is released, producers can keep pushing while the task runs
        let _dequeue = lock(&shared.dequeue_lock);
        let task = lock(&shared.tasks).pop();
        if let Some(task) = task {
            if let Err(e) = shared.process_task(task) {
                //still under the dequeue lock, so waiters that take it see the error
                shared.handle_worker_error(e);
            }
        }
    }

    #[cfg(feature = "logging")]
    log::trace!("{} exited", CommandProcessor::THREAD_NAME);
}

///Worker thread that executes [CommandProcessorTask]s in FIFO order.
pub struct CommandProcessor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandProcessor {
    pub const THREAD_NAME: &'static str = "marpii-queue-processor";

    pub fn spawn(queue: Arc<CommandQueue>) -> Result<Self, QueueError> {
        let limit = queue.config().command_processor_task_limit;
        let shared = Arc::new(Shared {
            queue,
            enqueue_lock: Mutex::new(()),
            work_available: Condvar::new(),
            dequeue_lock: Mutex::new(()),
            tasks: Mutex::new(FixedQueue::new(limit)),
            should_exit: AtomicBool::new(false),
            errors: ErrorQueue::default(),
            present_status: Mutex::new(AHashMap::default()),
            present_done: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(Self::THREAD_NAME.to_owned())
                .spawn(move || run(&shared))?
        };

        Ok(CommandProcessor {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.shared.queue
    }

    ///Enqueues `task`. Never waits for the worker. If the task queue is full, the oldest task is executed on the
    /// calling thread first, errors of that task are returned directly and `task` is not enqueued.
    pub fn queue_command(&self, task: CommandProcessorTask) -> Result<(), QueueError> {
        if self.shared.should_exit.load(Ordering::Acquire) {
            return Err(QueueError::WorkerExited);
        }

        let _enqueue = lock(&self.shared.enqueue_lock);
        let is_full = lock(&self.shared.tasks).is_full();
        if is_full {
            let _dequeue = lock(&self.shared.dequeue_lock);
            //the worker may have drained the queue while we waited for the dequeue lock
            let front = {
                let mut tasks = lock(&self.shared.tasks);
                if tasks.is_full() { tasks.pop() } else { None }
            };
            if let Some(front) = front {
                self.shared.process_task_inline(front)?;
            }
        }

        lock(&self.shared.tasks).push(task);
        self.shared.work_available.notify_one();
        Ok(())
    }

    ///Enqueues a present. Its result is available through [get_last_present_result](Self::get_last_present_result).
    pub fn enqueue_present(&self, priority: Priority, present: PresentInfo) -> Result<(), QueueError> {
        let swapchain = present.swapchain;
        lock(&self.shared.present_status)
            .entry(swapchain)
            .or_insert(PresentStatus {
                queued: 0,
                result: vk::Result::SUCCESS,
            })
            .queued += 1;

        let result = self.queue_command(CommandProcessorTask::Present { priority, present });
        if result.is_err() {
            //the present never entered the queue, don't leave waiters hanging
            if let Some(status) = lock(&self.shared.present_status).get_mut(&swapchain) {
                status.queued = status.queued.saturating_sub(1);
            }
            self.shared.present_done.notify_all();
        }
        result
    }

    ///Result of the last present on `swapchain`. Waits until every present enqueued on it so far was executed.
    pub fn get_last_present_result(&self, swapchain: vk::SwapchainKHR) -> vk::Result {
        let status = self
            .shared
            .present_done
            .wait_while(lock(&self.shared.present_status), |status| {
                status.get(&swapchain).map(|s| s.queued > 0).unwrap_or(false)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        status
            .get(&swapchain)
            .map(|s| s.result)
            .unwrap_or(vk::Result::SUCCESS)
    }

    pub fn has_pending_error(&self) -> bool {
        self.shared.errors.has_pending_error()
    }

    ///Keeps the worker from starting its next task until the guard is dropped.
    #[cfg(test)]
    pub(crate) fn pause_worker(&self) -> std::sync::MutexGuard<'_, ()> {
        lock(&self.shared.dequeue_lock)
    }

    pub fn check_and_pop_pending_error(&self) -> Result<(), QueueError> {
        self.shared.errors.check_and_pop_pending_error()
    }

    ///Blocks until every enqueued task was executed. Remaining tasks are executed on the calling thread, which is
    /// possible since holding the dequeue lock means the worker is not in the middle of a task.
    pub fn wait_for_work_complete(&self) -> Result<(), QueueError> {
        let _enqueue = lock(&self.shared.enqueue_lock);
        let _dequeue = lock(&self.shared.dequeue_lock);
        self.shared.errors.check_and_pop_pending_error()?;

        loop {
            let task = lock(&self.shared.tasks).pop();
            let Some(task) = task else {
                return Ok(());
            };
            self.shared.process_task_inline(task)?;
        }
    }

    ///Blocks until `use_` was submitted to the [CommandQueue]. Only executes as many queued tasks as needed.
    pub fn wait_for_resource_use_to_be_submitted(
        &self,
        use_: &ResourceUse,
    ) -> Result<(), QueueError> {
        if self.shared.queue.has_resource_use_submitted(use_) {
            return self.shared.errors.check_and_pop_pending_error();
        }

        //no enqueue lock, other threads may keep enqueueing behind us
        let _dequeue = lock(&self.shared.dequeue_lock);
        self.shared.errors.check_and_pop_pending_error()?;

        let max_tasks = lock(&self.shared.tasks).len();
        for _ in 0..max_tasks {
            if self.shared.queue.has_resource_use_submitted(use_) {
                break;
            }
            let task = lock(&self.shared.tasks).pop();
            let Some(task) = task else {
                break;
            };
            self.shared.process_task_inline(task)?;
        }
        Ok(())
    }

    pub fn wait_for_queue_serial_to_be_submitted(
        &self,
        queue_serial: QueueSerial,
    ) -> Result<(), QueueError> {
        self.wait_for_resource_use_to_be_submitted(&ResourceUse::from(queue_serial))
    }

    ///Executes everything that is still queued, then stops the worker.
    pub fn shutdown(&self) -> Result<(), QueueError> {
        let Some(worker) = lock(&self.worker).take() else {
            return Ok(());
        };

        let result = self.wait_for_work_complete();
        if let Err(_e) = self.queue_command(CommandProcessorTask::Exit) {
            #[cfg(feature = "logging")]
            log::warn!("Could not enqueue exit task: {}", _e);
            self.shared.should_exit.store(true, Ordering::Release);
            let _enqueue = lock(&self.shared.enqueue_lock);
            self.shared.work_available.notify_one();
        }

        if worker.join().is_err() {
            #[cfg(feature = "logging")]
            log::error!("{} panicked", Self::THREAD_NAME);
            return Err(QueueError::WorkerExited);
        }
        result?;
        self.shared.errors.check_and_pop_pending_error()
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        if let Err(_e) = self.shutdown() {
            #[cfg(feature = "logging")]
            log::error!("Shutting down {} failed: {}", Self::THREAD_NAME, _e);
        }
    }
}
