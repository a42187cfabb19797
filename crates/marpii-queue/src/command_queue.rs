//! # Command queue
//!
//! Owns the hardware queues of one queue family and tracks every submission until it finished on the GPU.
//!
//! Submitted batches live in the *in-flight* ring until their fence signaled, then move to the *finished* ring until
//! their command buffers and fences are handed back. Completion of each serial index is published through
//! [AtomicQueueSerialArray]s so most queries don't need any lock.
//!
//! ## Locking
//!
//! Locks are always taken in this order:
//!
//! 1. submit lock (also guards the [PerfCounters])
//! 2. complete lock
//! 3. release lock
//! 4. in-flight ring, then finished ring. Those are leaf locks that are never held across a driver wait.
//! 5. the pool lock of [CommandPoolAccess]
//!
//! Blocking fence waits only ever happen with the complete lock *released*. The fence is cloned out of the batch
//! beforehand, so the batch may complete and be recycled by another thread in the meantime.

use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock,
    atomic::{AtomicUsize, Ordering},
};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    batch::{BatchFence, CommandBatch},
    cleanup_thread::CleanUpSignal,
    command_pool::WhenToReset,
    command_pool_access::{CommandPoolAccess, OutsideRenderPassCommands, RenderPassCommands},
    config::QueueConfig,
    driver::{Driver, ForeignImageBarrier, PresentInfo, Submission, present_result_code},
    error::{QueueError, WaitStatus},
    garbage::GarbageCollector,
    queue_family::{DeviceQueueMap, Priority, ProtectionType, QueueFamily},
    resource_use::ResourceUse,
    ring::FixedQueue,
    serial::{AtomicQueueSerialArray, QueueSerial, Serial, SerialIndex},
    sync::{FenceRecycler, SharedExternalFence},
    util::lock,
};

///Submissions need an assigned serial whose index the serial arrays have a slot for.
pub(crate) fn check_submit_serial(queue_serial: QueueSerial) -> Result<(), QueueError> {
    if queue_serial.valid() {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueSerial(queue_serial))
    }
}

///Submission statistics. Per frame values are cleared by
/// [reset_per_frame_perf_counters](CommandQueue::reset_per_frame_perf_counters).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfCounters {
    pub command_queue_submit_calls_total: u64,
    pub command_queue_submit_calls_per_frame: u64,
    pub vk_queue_submit_calls_total: u64,
    pub vk_queue_submit_calls_per_frame: u64,
    pub command_queue_wait_semaphores_total: u64,
}

impl PerfCounters {
    fn count_vk_submit(&mut self) {
        self.vk_queue_submit_calls_total += 1;
        self.vk_queue_submit_calls_per_frame += 1;
    }
}

///Holds the submit lock while the application uses the raw queues itself (for instance for interop with another
/// API). No submission or present of the [CommandQueue] can happen until this is dropped.
pub struct ExternalQueueAccess<'a> {
    queue: &'a CommandQueue,
    _submit: MutexGuard<'a, PerfCounters>,
}

impl ExternalQueueAccess<'_> {
    pub fn queue(&self, priority: Priority) -> vk::Queue {
        self.queue.queue_map.get_queue(priority)
    }
}

pub struct CommandQueue {
    driver: Arc<dyn Driver>,
    config: QueueConfig,
    queue_map: DeviceQueueMap,
    pool_access: Arc<CommandPoolAccess>,

    submit_lock: Mutex<PerfCounters>,
    complete_lock: Mutex<()>,
    release_lock: Mutex<()>,

    in_flight: Mutex<FixedQueue<CommandBatch>>,
    finished: Mutex<FixedQueue<CommandBatch>>,
    ///Batches in both rings. Incremented before a push to in-flight, decremented once a batch left the finished ring.
    num_all_commands: AtomicUsize,

    last_submitted: AtomicQueueSerialArray,
    last_completed: AtomicQueueSerialArray,
    ///Largest serial index that was ever submitted on.
    largest_serial_index: AtomicUsize,

    fence_recycler: Arc<FenceRecycler>,
    garbage: Arc<dyn GarbageCollector>,
    clean_up: OnceLock<Arc<CleanUpSignal>>,
}

impl CommandQueue {
    ///Fetches the queues of `family` (up to one per [Priority]) and creates the command pools. A protected pool is only
    /// created if `protected` is set.
    pub fn new(
        driver: Arc<dyn Driver>,
        config: QueueConfig,
        family: &QueueFamily,
        protected: bool,
        queue_count: u32,
        garbage: Arc<dyn GarbageCollector>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        if queue_count == 0 || queue_count > family.queue_count() {
            return Err(QueueError::InvalidConfig(format!(
                "can't use {} queue(s) of family {} which has {}",
                queue_count,
                family.index,
                family.queue_count()
            )));
        }
        if protected && !family.supports_protected() {
            return Err(QueueError::InvalidConfig(format!(
                "queue family {} has no protected queues",
                family.index
            )));
        }

        let queue_map = DeviceQueueMap::initialize(
            driver.as_ref(),
            family,
            protected,
            0,
            queue_count.min(Priority::COUNT as u32),
        );

        let pool_access = Arc::new(CommandPoolAccess::new(driver.clone()));
        pool_access.init_command_pool(ProtectionType::Unprotected, family.index)?;
        if protected {
            pool_access.init_command_pool(ProtectionType::Protected, family.index)?;
        }

        Ok(CommandQueue {
            fence_recycler: Arc::new(FenceRecycler::new(config.max_recycled_fences)),
            in_flight: Mutex::new(FixedQueue::new(config.in_flight_commands_limit)),
            finished: Mutex::new(FixedQueue::new(config.finished_commands_limit)),
            driver,
            config,
            queue_map,
            pool_access,
            submit_lock: Mutex::new(PerfCounters::default()),
            complete_lock: Mutex::new(()),
            release_lock: Mutex::new(()),
            num_all_commands: AtomicUsize::new(0),
            last_submitted: AtomicQueueSerialArray::default(),
            last_completed: AtomicQueueSerialArray::default(),
            largest_serial_index: AtomicUsize::new(0),
            garbage,
            clean_up: OnceLock::new(),
        })
    }

    ///Routes [release_finished_commands_and_cleanup_garbage](Self::release_finished_commands_and_cleanup_garbage) to a
    /// clean-up thread if `async_garbage_cleanup` is set. Can only be set once.
    pub fn set_clean_up_signal(&self, signal: Arc<CleanUpSignal>) {
        if self.clean_up.set(signal).is_err() {
            #[cfg(feature = "logging")]
            log::warn!("Clean-up signal was already set");
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn garbage(&self) -> &Arc<dyn GarbageCollector> {
        &self.garbage
    }

    pub fn pool_access(&self) -> &Arc<CommandPoolAccess> {
        &self.pool_access
    }

    pub fn get_queue(&self, priority: Priority) -> vk::Queue {
        self.queue_map.get_queue(priority)
    }

    pub fn get_driver_priority(&self, priority: Priority) -> Priority {
        self.queue_map.get_device_priority(priority)
    }

    pub fn get_device_queue_index(&self, priority: Priority) -> u32 {
        self.queue_map.get_device_queue_index(priority)
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_map.family_index()
    }

    pub fn is_protected(&self) -> bool {
        self.queue_map.is_protected()
    }

    pub fn lock_queue_for_external_access(&self) -> ExternalQueueAccess<'_> {
        ExternalQueueAccess {
            queue: self,
            _submit: lock(&self.submit_lock),
        }
    }

    pub fn get_perf_counters(&self) -> PerfCounters {
        *lock(&self.submit_lock)
    }

    pub fn reset_per_frame_perf_counters(&self) {
        let mut counters = lock(&self.submit_lock);
        counters.command_queue_submit_calls_per_frame = 0;
        counters.vk_queue_submit_calls_per_frame = 0;
    }

    pub fn get_last_submitted_serial(&self, index: SerialIndex) -> Serial {
        self.last_submitted.get(index)
    }

    pub fn get_last_completed_serial(&self, index: SerialIndex) -> Serial {
        self.last_completed.get(index)
    }

    pub fn last_completed_serials(&self) -> &AtomicQueueSerialArray {
        &self.last_completed
    }

    pub fn has_resource_use_finished(&self, use_: &ResourceUse) -> bool {
        use_.is_contained_in(&self.last_completed)
    }

    pub fn has_resource_use_submitted(&self, use_: &ResourceUse) -> bool {
        use_.is_contained_in(&self.last_submitted)
    }

    pub fn has_queue_serial_finished(&self, queue_serial: &QueueSerial) -> bool {
        self.last_completed.contains(queue_serial)
    }

    pub fn has_queue_serial_submitted(&self, queue_serial: &QueueSerial) -> bool {
        self.last_submitted.contains(queue_serial)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn finished_count(&self) -> usize {
        lock(&self.finished).len()
    }

    pub fn has_finished_commands(&self) -> bool {
        !lock(&self.finished).is_empty()
    }

    ///Batches in both rings.
    pub fn num_all_commands(&self) -> usize {
        self.num_all_commands.load(Ordering::Acquire)
    }

    ///True if any serial index has submissions that did not complete yet (as far as the queue knows, this does not poll
    /// fences).
    pub fn is_busy(&self) -> bool {
        let largest = self.largest_serial_index.load(Ordering::Acquire);
        (0..=largest).any(|index| self.last_submitted.get(index) > self.last_completed.get(index))
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: &mut dyn OutsideRenderPassCommands,
    ) -> Result<(), QueueError> {
        self.pool_access
            .flush_outside_render_pass_commands(protection, priority, commands)
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        render_pass: vk::RenderPass,
        framebuffer_override: vk::Framebuffer,
        commands: &mut dyn RenderPassCommands,
    ) -> Result<(), QueueError> {
        self.pool_access.flush_render_pass_commands(
            protection,
            priority,
            render_pass,
            framebuffer_override,
            commands,
        )
    }

    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) {
        self.pool_access
            .flush_wait_semaphores(protection, priority, semaphores, stage_masks)
    }

    ///Submits everything that was flushed for (`protection`, `priority`) as the batch of `queue_serial`.
    ///
    /// If there is nothing to execute, wait on or signal, no driver submission happens. The serial is tracked anyways
    /// and counts as finished with the next completion check.
    pub fn submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        foreign_barriers: &[ForeignImageBarrier],
        queue_serial: QueueSerial,
    ) -> Result<(), QueueError> {
        check_submit_serial(queue_serial)?;
        let mut counters = lock(&self.submit_lock);
        counters.command_queue_submit_calls_total += 1;
        counters.command_queue_submit_calls_per_frame += 1;

        let sealed =
            self.pool_access
                .get_commands_and_wait_semaphores(protection, priority, foreign_barriers)?;
        counters.command_queue_wait_semaphores_total += sealed.wait_semaphores.len() as u64;

        let mut batch = CommandBatch::new();
        batch.set_queue_serial(queue_serial);
        batch.set_protection_type(protection);
        batch.set_primary_commands(sealed.primary, self.pool_access.clone());
        batch.set_secondary_commands(sealed.secondary);

        let primary: SmallVec<[vk::CommandBuffer; 1]> =
            batch.primary_commands().into_iter().collect();
        let signal: SmallVec<[vk::Semaphore; 1]> = signal_semaphore.into_iter().collect();

        let needs_queue_submit = !primary.is_empty()
            || !signal.is_empty()
            || external_fence.is_some()
            || !sealed.wait_semaphores.is_empty();

        if needs_queue_submit {
            if self.config.enable_extra_submit_fence || external_fence.is_none() {
                batch.init_fence(self.driver.clone(), self.fence_recycler.clone())?;
            }
            if let Some(fence) = external_fence {
                batch.set_external_fence(fence);
            }
        }

        let submission = Submission {
            command_buffers: &primary,
            wait_semaphores: &sealed.wait_semaphores,
            wait_dst_stage_masks: &sealed.wait_stage_masks,
            signal_semaphores: &signal,
            //Protected submissions without command buffers are not allowed
            protected: protection.is_protected() && !primary.is_empty(),
        };

        self.queue_submit_locked(
            &mut counters,
            priority,
            needs_queue_submit.then_some(&submission),
            batch,
        )
    }

    ///Submits a single command buffer that was recorded outside of the per priority accumulators. `command_buffer` may
    /// be null to only wait on `wait_semaphore`.
    pub fn queue_submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        queue_serial: QueueSerial,
    ) -> Result<(), QueueError> {
        check_submit_serial(queue_serial)?;
        let mut counters = lock(&self.submit_lock);
        counters.command_queue_submit_calls_total += 1;
        counters.command_queue_submit_calls_per_frame += 1;

        let mut batch = CommandBatch::new();
        batch.set_queue_serial(queue_serial);
        batch.set_protection_type(protection);
        batch.init_fence(self.driver.clone(), self.fence_recycler.clone())?;

        let command_buffers: SmallVec<[vk::CommandBuffer; 1]> =
            Some(command_buffer).filter(|cb| *cb != vk::CommandBuffer::null()).into_iter().collect();
        let (wait_semaphores, wait_masks): (SmallVec<[vk::Semaphore; 1]>, SmallVec<[vk::PipelineStageFlags; 1]>) =
            wait_semaphore.into_iter().unzip();

        let submission = Submission {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_dst_stage_masks: &wait_masks,
            signal_semaphores: &[],
            protected: protection.is_protected(),
        };
        self.queue_submit_locked(&mut counters, priority, Some(&submission), batch)
    }

    ///Makes room in both rings, submits and enqueues `batch`. Needs the submit lock.
    fn queue_submit_locked(
        &self,
        counters: &mut PerfCounters,
        priority: Priority,
        submission: Option<&Submission<'_>>,
        mut batch: CommandBatch,
    ) -> Result<(), QueueError> {
        let in_flight_full = lock(&self.in_flight).is_full();
        if in_flight_full {
            let complete = lock(&self.complete_lock);
            //someone may have completed batches while we waited for the lock
            let still_full = lock(&self.in_flight).is_full();
            if still_full {
                #[cfg(feature = "logging")]
                log::trace!("In-flight ring full, waiting for the oldest batch");
                let _complete =
                    self.finish_one_command_batch(complete, self.config.max_fence_wait_time_ns)?;
            }
        }

        if self.num_all_commands.load(Ordering::Acquire) >= self.config.finished_commands_limit {
            let _release = lock(&self.release_lock);
            self.release_finished_commands_locked(WhenToReset::Now)?;
        }

        if let Some(submission) = submission {
            let queue = self.queue_map.get_queue(priority);
            match batch.external_fence().map(|f| f.inner()) {
                Some(external) => {
                    self.driver.queue_submit(queue, submission, external)?;
                    counters.count_vk_submit();
                    if self.config.enable_extra_submit_fence {
                        let extra = self.driver.queue_submit(
                            queue,
                            &Submission::default(),
                            batch.fence_handle(),
                        );
                        if let Err(e) = extra {
                            //The commands are executing already, keep tracking them through the external fence.
                            batch.discard_fence();
                            self.push_in_flight(priority, batch);
                            return Err(e.into());
                        }
                        counters.count_vk_submit();
                    }
                }
                None => {
                    self.driver
                        .queue_submit(queue, submission, batch.fence_handle())?;
                    counters.count_vk_submit();
                }
            }
        }

        self.push_in_flight(priority, batch);
        Ok(())
    }

    ///Enqueues a submitted `batch` and publishes its serial. Room in both rings has to be made beforehand.
    fn push_in_flight(&self, _priority: Priority, batch: CommandBatch) {
        let queue_serial = batch.queue_serial();
        #[cfg(feature = "logging")]
        log::trace!(
            "Submitted {:?} on {:?} (fence {:?})",
            queue_serial,
            _priority,
            batch.fence_handle()
        );

        self.largest_serial_index
            .fetch_max(queue_serial.index(), Ordering::AcqRel);
        self.num_all_commands.fetch_add(1, Ordering::AcqRel);
        let mut in_flight = lock(&self.in_flight);
        debug_assert!(!in_flight.is_full());
        in_flight.push(batch);
        //Published while the batch is visible in the ring and before anyone can complete it
        self.last_submitted.set_queue_serial(&queue_serial);
    }

    pub fn queue_present(&self, priority: Priority, present: &PresentInfo) -> vk::Result {
        let _submit = lock(&self.submit_lock);
        let queue = self.queue_map.get_queue(priority);
        present_result_code(self.driver.queue_present(queue, present))
    }

    ///Moves the oldest in-flight batch to the finished ring if its fence signaled (or it has none). Returns false if
    /// it is still pending or the ring is empty. Needs the complete lock.
    fn check_one_command_batch_locked(&self) -> Result<bool, QueueError> {
        let finished = {
            let in_flight = lock(&self.in_flight);
            match in_flight.front() {
                None => return Ok(false),
                Some(batch) if !batch.has_fence() => true,
                Some(batch) => batch.fence_status()?,
            }
        };
        if finished {
            self.on_command_batch_finished_locked();
        }
        Ok(finished)
    }

    ///Marks the oldest in-flight batch as completed and moves it to the finished ring. Needs the complete lock.
    fn on_command_batch_finished_locked(&self) {
        let mut in_flight = lock(&self.in_flight);
        let Some(batch) = in_flight.pop() else {
            return;
        };
        self.last_completed.set_queue_serial(&batch.queue_serial());

        #[cfg(feature = "logging")]
        log::trace!("Completed {:?}", batch.queue_serial());

        let mut finished = lock(&self.finished);
        debug_assert!(!finished.is_full(), "finished ring overflow");
        finished.push(batch);
    }

    ///Waits for the fence of the oldest in-flight batch with the complete lock released, then moves the batch to the
    /// finished ring if nobody else did in the meantime.
    fn finish_one_command_batch<'a>(
        &'a self,
        complete: MutexGuard<'a, ()>,
        timeout_ns: u64,
    ) -> Result<MutexGuard<'a, ()>, QueueError> {
        let front = {
            let in_flight = lock(&self.in_flight);
            in_flight.front().map(|b| (b.queue_serial(), b.fence_ref()))
        };
        let Some((serial, fence)) = front else {
            return Ok(complete);
        };

        let complete = match fence {
            Some(fence) => self.wait_fence_unlocked(complete, &fence, timeout_ns)?,
            None => complete,
        };

        if !self.last_completed.contains(&serial) {
            self.on_command_batch_finished_locked();
        }
        Ok(complete)
    }

    fn wait_fence_unlocked<'a>(
        &'a self,
        complete: MutexGuard<'a, ()>,
        fence: &BatchFence,
        timeout_ns: u64,
    ) -> Result<MutexGuard<'a, ()>, QueueError> {
        drop(complete);
        let result = fence.wait(timeout_ns);
        let complete = lock(&self.complete_lock);
        result.map_err(|e| QueueError::from_wait(e, timeout_ns))?;
        Ok(complete)
    }

    fn check_completed_commands_locked(&self) -> Result<(), QueueError> {
        while self.check_one_command_batch_locked()? {}
        Ok(())
    }

    ///Polls the in-flight fences in submission order and stops at the first one that did not signal yet.
    pub fn check_completed_commands(&self) -> Result<(), QueueError> {
        let _complete = lock(&self.complete_lock);
        self.check_completed_commands_locked()
    }

    pub fn check_and_cleanup_completed_commands(&self) -> Result<(), QueueError> {
        self.check_completed_commands()?;
        if self.has_finished_commands() {
            self.release_finished_commands_and_cleanup_garbage()?;
        }
        Ok(())
    }

    ///Hands the command buffers and fences of all finished batches back.
    pub fn release_finished_commands(&self, when: WhenToReset) -> Result<(), QueueError> {
        let _release = lock(&self.release_lock);
        self.release_finished_commands_locked(when)
    }

    fn release_finished_commands_locked(&self, when: WhenToReset) -> Result<(), QueueError> {
        loop {
            let Some(batch) = lock(&self.finished).pop() else {
                return Ok(());
            };
            debug_assert!(self.has_queue_serial_finished(&batch.queue_serial()));
            let result = batch.release(when);
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
            result?;
        }
    }

    ///Releases finished batches and destroys garbage whose use completed. Only requests it from the clean-up thread if
    /// `async_garbage_cleanup` is set.
    pub fn release_finished_commands_and_cleanup_garbage(&self) -> Result<(), QueueError> {
        if self.config.async_garbage_cleanup {
            if let Some(signal) = self.clean_up.get() {
                signal.request_clean_up();
                return Ok(());
            }
        }
        self.release_finished_commands(WhenToReset::Now)?;
        self.garbage.cleanup_garbage(&self.last_completed);
        Ok(())
    }

    ///Called after each submission. Throttles the CPU if too much garbage piled up by waiting for old submissions until
    /// enough of it could be destroyed.
    pub fn post_submit_check(&self) -> Result<(), QueueError> {
        self.check_and_cleanup_completed_commands()?;

        while self.garbage.garbage_size() > self.config.max_garbage_size {
            #[cfg(feature = "logging")]
            log::trace!(
                "Garbage size {} exceeds {}, waiting for GPU",
                self.garbage.garbage_size(),
                self.config.max_garbage_size
            );
            if !self.cleanup_some_garbage(1)? {
                break;
            }
        }
        Ok(())
    }

    ///Destroys finished garbage. If there is none, waits for in-flight batches one by one until something could be
    /// destroyed or only `min_in_flight_to_keep` batches are left. Returns true if anything was destroyed.
    pub fn cleanup_some_garbage(&self, min_in_flight_to_keep: usize) -> Result<bool, QueueError> {
        let mut any_cleaned = self.garbage.cleanup_garbage(&self.last_completed);
        while !any_cleaned {
            {
                let complete = lock(&self.complete_lock);
                if lock(&self.in_flight).len() <= min_in_flight_to_keep {
                    break;
                }
                let _complete =
                    self.finish_one_command_batch(complete, self.config.max_fence_wait_time_ns)?;
            }
            any_cleaned = self.garbage.cleanup_garbage(&self.last_completed);
        }
        Ok(any_cleaned)
    }

    ///Blocks until `use_` finished. Each fence wait is bounded by `timeout_ns`.
    ///
    /// Fails with [QueueError::Timeout] if a wait timed out and with [QueueError::NotSubmitted] if part of the use was
    /// never submitted.
    pub fn finish_resource_use(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> Result<(), QueueError> {
        {
            let mut complete = lock(&self.complete_lock);
            while !lock(&self.in_flight).is_empty() && !self.has_resource_use_finished(use_) {
                if !self.check_one_command_batch_locked()? {
                    complete = self.wait_front_unlocked(complete, timeout_ns)?;
                }
            }
            //drain what's already done so it can be released below
            self.check_completed_commands_locked()?;
        }

        if !self.has_resource_use_finished(use_) {
            return Err(QueueError::NotSubmitted(self.first_unfinished(use_)));
        }

        if self.has_finished_commands() {
            self.release_finished_commands_and_cleanup_garbage()?;
        }
        Ok(())
    }

    pub fn finish_queue_serial(
        &self,
        queue_serial: QueueSerial,
        timeout_ns: u64,
    ) -> Result<(), QueueError> {
        self.finish_resource_use(&ResourceUse::from(queue_serial), timeout_ns)
    }

    ///Waits for everything that was submitted before this call.
    pub fn wait_idle(&self, timeout_ns: u64) -> Result<(), QueueError> {
        let last = {
            let _submit = lock(&self.submit_lock);
            lock(&self.in_flight).back().map(|b| b.queue_serial())
        };
        match last {
            Some(serial) => self.finish_queue_serial(serial, timeout_ns),
            None => Ok(()),
        }
    }

    ///Like [finish_resource_use](Self::finish_resource_use), but a timeout is a regular outcome. Waiting on a use that
    /// was not submitted yet reports a timeout as well.
    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> Result<WaitStatus, QueueError> {
        if !self.has_resource_use_submitted(use_) {
            #[cfg(feature = "logging")]
            log::warn!("Waiting on an unsubmitted use {:?}, reporting timeout", use_);
            return Ok(WaitStatus::Timeout);
        }

        {
            let mut complete = lock(&self.complete_lock);
            while !lock(&self.in_flight).is_empty() && !self.has_resource_use_finished(use_) {
                if self.check_one_command_batch_locked()? {
                    continue;
                }
                match self.wait_front_unlocked(complete, timeout_ns) {
                    Ok(guard) => complete = guard,
                    Err(e) if e.is_timeout() => break,
                    Err(e) => return Err(e),
                }
            }
        }

        if self.has_resource_use_finished(use_) {
            Ok(WaitStatus::Finished)
        } else {
            Ok(WaitStatus::Timeout)
        }
    }

    ///Waits on the oldest in-flight batch without moving it. The caller rechecks afterwards.
    fn wait_front_unlocked<'a>(
        &'a self,
        complete: MutexGuard<'a, ()>,
        timeout_ns: u64,
    ) -> Result<MutexGuard<'a, ()>, QueueError> {
        let fence = lock(&self.in_flight).front().and_then(|b| b.fence_ref());
        match fence {
            Some(fence) => self.wait_fence_unlocked(complete, &fence, timeout_ns),
            None => Ok(complete),
        }
    }

    fn first_unfinished(&self, use_: &ResourceUse) -> QueueSerial {
        use_.serials()
            .iter()
            .enumerate()
            .find(|(index, serial)| **serial > self.last_completed.get(*index))
            .map(|(index, serial)| QueueSerial::new(index, *serial))
            .unwrap_or_default()
    }

    ///Force-completes every submission after the device was lost. Waits (bounded) on each in-flight fence, destroys
    /// the batches without recycling anything and marks every serial of every index as completed, so no waiter can
    /// hang on work that will never finish.
    pub fn handle_device_lost(&self) {
        #[cfg(feature = "logging")]
        log::warn!("Device lost, force-completing all submissions");

        let _submit = lock(&self.submit_lock);
        let _complete = lock(&self.complete_lock);
        let _release = lock(&self.release_lock);

        self.queue_map.wait_all_queues_idle(self.driver.as_ref());

        loop {
            let Some(batch) = lock(&self.in_flight).pop() else {
                break;
            };
            if batch.has_fence() {
                if let Err(_e) = batch.wait_fence(self.config.max_fence_wait_time_ns) {
                    #[cfg(feature = "logging")]
                    log::warn!(
                        "Waiting for {:?} after device loss failed: {}",
                        batch.queue_serial(),
                        _e
                    );
                }
            }
            self.last_completed.set_queue_serial(&batch.queue_serial());
            batch.destroy();
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
        }

        self.last_completed.fill(Serial::INFINITE);
    }

    ///Waits for the queues to idle and destroys all batches, pools and recycled fences. The queue must not be used
    /// afterwards.
    pub fn destroy(&self) {
        let _submit = lock(&self.submit_lock);
        let _complete = lock(&self.complete_lock);
        let _release = lock(&self.release_lock);

        self.queue_map.destroy(self.driver.as_ref());
        self.last_completed.fill(Serial::INFINITE);

        let in_flight: Vec<CommandBatch> = {
            let mut ring = lock(&self.in_flight);
            std::iter::from_fn(|| ring.pop()).collect()
        };
        let finished: Vec<CommandBatch> = {
            let mut ring = lock(&self.finished);
            std::iter::from_fn(|| ring.pop()).collect()
        };
        for batch in in_flight.into_iter().chain(finished) {
            batch.destroy();
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
        }

        self.pool_access.destroy();
        self.fence_recycler.destroy(self.driver.as_ref());

        #[cfg(feature = "logging")]
        log::trace!("Destroyed command queue");
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("queue_map", &self.queue_map)
            .field("in_flight", &self.in_flight_count())
            .field("finished", &self.finished_count())
            .field("last_submitted", &self.last_submitted)
            .field("last_completed", &self.last_completed)
            .finish()
    }
}
