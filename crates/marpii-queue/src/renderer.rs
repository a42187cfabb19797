use std::sync::Arc;

use ash::vk;

use crate::{
    cleanup_thread::CleanUpThread,
    command_pool_access::{OutsideRenderPassCommands, RenderPassCommands},
    command_processor::{CommandProcessor, CommandProcessorTask, RecordedCommands},
    command_queue::{CommandQueue, check_submit_serial},
    config::QueueConfig,
    driver::{Driver, ForeignImageBarrier, PresentInfo, is_non_fatal_present_result},
    error::{QueueError, WaitStatus},
    garbage::{GarbageCollector, GarbageObject, SharedGarbageList},
    queue_family::{Priority, ProtectionType, QueueFamily},
    resource_use::ResourceUse,
    serial::{QueueSerial, QueueSerialIndexAllocator, SerialIndex},
    sync::{EventRecycler, SharedExternalFence},
};

///Entry point for a frontend. Owns the [CommandQueue] and everything around it: serial index allocation, garbage,
/// recycled events and, depending on the [QueueConfig], the clean-up thread and the command processor.
///
/// Every synchronous call first reports errors that happened on one of the worker threads. A device lost result of
/// any call force-completes all submissions before it is returned.
pub struct Renderer {
    driver: Arc<dyn Driver>,
    queue: Arc<CommandQueue>,
    serial_indices: QueueSerialIndexAllocator,
    garbage: Arc<SharedGarbageList>,
    event_recycler: Arc<EventRecycler>,
    clean_up: Option<CleanUpThread>,
    processor: Option<CommandProcessor>,
    is_destroyed: bool,
}

impl Renderer {
    pub fn new(
        driver: Arc<dyn Driver>,
        config: QueueConfig,
        family: &QueueFamily,
        protected: bool,
        queue_count: u32,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let event_recycler = Arc::new(EventRecycler::new(config.max_recycled_events));
        let garbage = Arc::new(
            SharedGarbageList::new(driver.clone()).with_event_recycler(event_recycler.clone()),
        );
        let queue = Arc::new(CommandQueue::new(
            driver.clone(),
            config.clone(),
            family,
            protected,
            queue_count,
            garbage.clone(),
        )?);

        let clean_up = if config.async_garbage_cleanup {
            Some(CleanUpThread::spawn(queue.clone())?)
        } else {
            None
        };
        let processor = if config.async_command_processing {
            Some(CommandProcessor::spawn(queue.clone())?)
        } else {
            None
        };

        #[cfg(feature = "logging")]
        log::info!(
            "Created renderer on queue family {} (async processing: {}, async clean-up: {})",
            family.index,
            processor.is_some(),
            clean_up.is_some()
        );

        Ok(Renderer {
            driver,
            queue,
            serial_indices: QueueSerialIndexAllocator::new(),
            garbage,
            event_recycler,
            clean_up,
            processor,
            is_destroyed: false,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn command_queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn config(&self) -> &QueueConfig {
        self.queue.config()
    }

    pub fn garbage(&self) -> &Arc<SharedGarbageList> {
        &self.garbage
    }

    pub fn event_recycler(&self) -> &Arc<EventRecycler> {
        &self.event_recycler
    }

    pub fn is_async_command_processing(&self) -> bool {
        self.processor.is_some()
    }

    ///Returns `None` if all indices are in use.
    pub fn allocate_queue_serial_index(&self) -> Option<SerialIndex> {
        self.serial_indices.allocate()
    }

    pub fn release_queue_serial_index(&self, index: SerialIndex) {
        self.serial_indices.release(index);
    }

    pub fn generate_queue_serial(&self, index: SerialIndex) -> QueueSerial {
        self.serial_indices.generate(index)
    }

    pub fn largest_queue_serial_index_ever_allocated(&self) -> SerialIndex {
        self.serial_indices.largest_index_ever_allocated()
    }

    ///Errors of the command processor first, then those of the clean-up thread.
    pub fn check_and_pop_pending_error(&self) -> Result<(), QueueError> {
        if let Some(processor) = &self.processor {
            processor.check_and_pop_pending_error()?;
        }
        if let Some(clean_up) = &self.clean_up {
            clean_up.check_and_pop_pending_error()?;
        }
        Ok(())
    }

    ///Force-completes everything after the device was lost.
    pub fn handle_device_lost(&self) {
        self.queue.handle_device_lost();
    }

    fn handle_result<T>(&self, result: Result<T, QueueError>) -> Result<T, QueueError> {
        if let Err(e) = &result {
            if e.is_device_lost() {
                self.handle_device_lost();
            }
        }
        result
    }

    fn enqueue(&self, processor: &CommandProcessor, task: CommandProcessorTask) -> Result<(), QueueError> {
        let result = processor.queue_command(task);
        self.handle_result(result)
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        mut commands: Box<dyn OutsideRenderPassCommands + Send>,
    ) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        match &self.processor {
            Some(processor) => self.enqueue(
                processor,
                CommandProcessorTask::ProcessCommands {
                    protection,
                    priority,
                    commands: RecordedCommands::OutsideRenderPass(commands),
                },
            ),
            None => self.handle_result(self.queue.flush_outside_render_pass_commands(
                protection,
                priority,
                commands.as_mut(),
            )),
        }
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        render_pass: vk::RenderPass,
        framebuffer_override: vk::Framebuffer,
        mut commands: Box<dyn RenderPassCommands + Send>,
    ) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        match &self.processor {
            Some(processor) => self.enqueue(
                processor,
                CommandProcessorTask::ProcessCommands {
                    protection,
                    priority,
                    commands: RecordedCommands::RenderPass {
                        commands,
                        render_pass,
                        framebuffer_override,
                    },
                },
            ),
            None => self.handle_result(self.queue.flush_render_pass_commands(
                protection,
                priority,
                render_pass,
                framebuffer_override,
                commands.as_mut(),
            )),
        }
    }

    ///Wait semaphores are attached to the first submission of (`protection`, `priority`) that is requested after this
    /// call. With the command processor they are queued like any other command, so submissions that are still queued
    /// don't pick them up.
    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        match &self.processor {
            Some(processor) => self.enqueue(
                processor,
                CommandProcessorTask::FlushWaitSemaphores {
                    protection,
                    priority,
                    semaphores,
                    stage_masks,
                },
            ),
            None => {
                self.queue
                    .flush_wait_semaphores(protection, priority, semaphores, stage_masks);
                Ok(())
            }
        }
    }

    pub fn submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        foreign_barriers: Vec<ForeignImageBarrier>,
        queue_serial: QueueSerial,
    ) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        //rejected here, a queued task would only report it through the worker
        check_submit_serial(queue_serial)?;
        match &self.processor {
            Some(processor) => self.enqueue(
                processor,
                CommandProcessorTask::FlushAndQueueSubmit {
                    protection,
                    priority,
                    signal_semaphore,
                    external_fence,
                    foreign_barriers,
                    queue_serial,
                },
            ),
            None => {
                let result = self
                    .queue
                    .submit_commands(
                        protection,
                        priority,
                        signal_semaphore,
                        external_fence,
                        &foreign_barriers,
                        queue_serial,
                    )
                    .and_then(|_| self.queue.post_submit_check());
                self.handle_result(result)
            }
        }
    }

    pub fn queue_submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        queue_serial: QueueSerial,
    ) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        check_submit_serial(queue_serial)?;
        match &self.processor {
            Some(processor) => self.enqueue(
                processor,
                CommandProcessorTask::OneOffQueueSubmit {
                    protection,
                    priority,
                    command_buffer,
                    wait_semaphore,
                    queue_serial,
                },
            ),
            None => {
                let result = self
                    .queue
                    .queue_submit_one_off(
                        protection,
                        priority,
                        command_buffer,
                        wait_semaphore,
                        queue_serial,
                    )
                    .and_then(|_| self.queue.post_submit_check());
                self.handle_result(result)
            }
        }
    }

    ///Presents `present`. Non-fatal results (suboptimal, out of date, ...) are returned as `Ok`. With the command
    /// processor the present is only queued and `SUCCESS` is returned, the actual result can be read with
    /// [get_last_present_result](Self::get_last_present_result).
    pub fn queue_present(
        &self,
        priority: Priority,
        present: PresentInfo,
    ) -> Result<vk::Result, QueueError> {
        self.check_and_pop_pending_error()?;
        if let Some(processor) = &self.processor {
            let result = processor.enqueue_present(priority, present);
            return self.handle_result(result).map(|_| vk::Result::SUCCESS);
        }

        let result = self.queue.queue_present(priority, &present);
        if is_non_fatal_present_result(result) {
            Ok(result)
        } else {
            self.handle_result(Err(QueueError::VkError(result)))
        }
    }

    pub fn get_last_present_result(&self, swapchain: vk::SwapchainKHR) -> vk::Result {
        match &self.processor {
            Some(processor) => processor.get_last_present_result(swapchain),
            None => vk::Result::SUCCESS,
        }
    }

    ///Makes sure `use_` reached the [CommandQueue] if submissions are still queued on the command processor.
    fn wait_for_resource_use_to_be_submitted(&self, use_: &ResourceUse) -> Result<(), QueueError> {
        match &self.processor {
            Some(processor) => {
                let result = processor.wait_for_resource_use_to_be_submitted(use_);
                self.handle_result(result)
            }
            None => Ok(()),
        }
    }

    pub fn finish_resource_use(&self, use_: &ResourceUse) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        self.wait_for_resource_use_to_be_submitted(use_)?;
        self.handle_result(
            self.queue
                .finish_resource_use(use_, self.config().max_fence_wait_time_ns),
        )
    }

    pub fn finish_queue_serial(&self, queue_serial: QueueSerial) -> Result<(), QueueError> {
        self.finish_resource_use(&ResourceUse::from(queue_serial))
    }

    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> Result<WaitStatus, QueueError> {
        self.check_and_pop_pending_error()?;
        self.wait_for_resource_use_to_be_submitted(use_)?;
        self.handle_result(
            self.queue
                .wait_for_resource_use_to_finish_with_user_timeout(use_, timeout_ns),
        )
    }

    ///Waits until every submission, including queued ones, finished.
    pub fn wait_idle(&self) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        if let Some(processor) = &self.processor {
            let result = processor.wait_for_work_complete();
            self.handle_result(result)?;
        }
        self.handle_result(self.queue.wait_idle(self.config().max_fence_wait_time_ns))
    }

    pub fn check_completed_commands_and_cleanup(&self) -> Result<(), QueueError> {
        self.check_and_pop_pending_error()?;
        match &self.processor {
            Some(processor) => self.enqueue(processor, CommandProcessorTask::CheckCompletedCommands),
            None => self.handle_result(self.queue.check_and_cleanup_completed_commands()),
        }
    }

    ///Fire and forget clean-up. Runs inline if there is no clean-up thread.
    pub fn request_async_commands_and_garbage_cleanup(&self) -> Result<(), QueueError> {
        match &self.clean_up {
            Some(clean_up) => {
                clean_up.request_clean_up();
                Ok(())
            }
            None => self.check_completed_commands_and_cleanup(),
        }
    }

    pub fn collect_garbage(&self, use_: ResourceUse, objects: Vec<GarbageObject>) {
        self.garbage.collect_garbage(use_, objects);
    }

    ///Destroys garbage whose use finished. Returns true if anything was destroyed.
    pub fn cleanup_garbage(&self) -> bool {
        self.garbage
            .cleanup_garbage(self.queue.last_completed_serials())
    }

    pub fn has_resource_use_finished(&self, use_: &ResourceUse) -> bool {
        self.queue.has_resource_use_finished(use_)
    }

    pub fn has_resource_use_submitted(&self, use_: &ResourceUse) -> bool {
        self.queue.has_resource_use_submitted(use_)
    }

    pub fn has_queue_serial_finished(&self, queue_serial: &QueueSerial) -> bool {
        self.queue.has_queue_serial_finished(queue_serial)
    }

    pub fn has_queue_serial_submitted(&self, queue_serial: &QueueSerial) -> bool {
        self.queue.has_queue_serial_submitted(queue_serial)
    }

    pub fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }

    ///Shuts down the command processor, then the clean-up thread, then waits for the device and destroys the queue,
    /// all garbage and the recyclers. The first error is returned, but teardown always runs to the end.
    pub fn destroy(&mut self) -> Result<(), QueueError> {
        if self.is_destroyed {
            return Ok(());
        }
        self.is_destroyed = true;

        let mut result = Ok(());
        if let Some(processor) = self.processor.take() {
            result = result.and(processor.shutdown());
        }
        if let Some(clean_up) = self.clean_up.take() {
            result = result.and(clean_up.destroy());
        }

        self.queue.destroy();
        self.garbage.destroy();
        self.event_recycler.destroy(self.driver.as_ref());

        #[cfg(feature = "logging")]
        log::info!("Destroyed renderer");

        result
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(_e) = self.destroy() {
            #[cfg(feature = "logging")]
            log::error!("Renderer teardown failed: {}", _e);
        }
    }
}
