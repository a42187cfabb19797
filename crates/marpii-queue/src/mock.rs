//! In-memory [Driver] used by the unit tests.
//!
//! Handles are plain counters. Fences are signaled according to a [SignalMode], always in submission order. Every
//! call that matters for the tests is appended to a call log, and reusing a command buffer whose last submission's
//! fence is still pending is recorded as a violation.

use std::sync::{Condvar, Mutex, Once};
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use crate::{
    command_pool_access::{CommandsState, OutsideRenderPassCommands},
    driver::{Driver, ForeignImageBarrier, PresentInfo, Submission},
    error::QueueError,
    util::lock,
};

///Longest real wait the mock performs, so a broken test can't hang forever.
const MAX_MOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SignalMode {
    ///Fences signal as soon as they are submitted.
    OnSubmit,
    ///Submitted fences signal once somebody waits on them (or a later one).
    OnWait,
    ///Fences only signal through [MockDriver::signal_fence] / [MockDriver::signal_all].
    Never,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum DriverCall {
    Submit {
        queue: vk::Queue,
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: usize,
        signal_semaphores: usize,
        protected: bool,
        fence: vk::Fence,
    },
    Present {
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
    WaitIdle {
        queue: vk::Queue,
    },
    CreateCommandPool {
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    },
    DestroyCommandPool(vk::CommandPool),
    ExecuteCommands {
        primary: vk::CommandBuffer,
        count: usize,
    },
    ForeignBarrier {
        command_buffer: vk::CommandBuffer,
        count: usize,
    },
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

struct State {
    next_handle: u64,
    mode: SignalMode,
    lost: bool,
    fences: AHashMap<vk::Fence, FenceState>,
    ///Pending fences in submission order.
    submitted: Vec<vk::Fence>,
    created_fences: usize,
    events: AHashSet<vk::Event>,
    queues: AHashMap<(u32, u32, bool), vk::Queue>,
    begins: AHashMap<vk::CommandBuffer, usize>,
    resets: AHashMap<vk::CommandBuffer, usize>,
    recording: AHashSet<vk::CommandBuffer>,
    ended: AHashSet<vk::CommandBuffer>,
    last_fence: AHashMap<vk::CommandBuffer, vk::Fence>,
    violations: Vec<String>,
    calls: Vec<DriverCall>,
    ///Number of submits that still succeed, and the error of the one after.
    fail_submit: Option<(usize, vk::Result)>,
    present_result: VkResult<bool>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    ///Signals `fence` and every fence submitted before it.
    fn signal_up_to(&mut self, fence: vk::Fence) {
        let Some(position) = self.submitted.iter().position(|f| *f == fence) else {
            if let Some(state) = self.fences.get_mut(&fence) {
                state.signaled = true;
            }
            return;
        };
        for f in self.submitted.drain(..=position) {
            if let Some(state) = self.fences.get_mut(&f) {
                state.signaled = true;
                state.pending = false;
            }
        }
    }

    fn signal_all(&mut self) {
        if let Some(last) = self.submitted.last().copied() {
            self.signal_up_to(last);
        }
    }

    fn check_reuse(&mut self, command_buffer: vk::CommandBuffer, what: &str) {
        if let Some(fence) = self.last_fence.get(&command_buffer) {
            let pending = self
                .fences
                .get(fence)
                .map(|f| !f.signaled)
                .unwrap_or(false);
            if pending {
                self.violations.push(format!(
                    "{what} of {command_buffer:?} while fence {fence:?} is pending"
                ));
            }
        }
    }

    fn forget_fence(&mut self, fence: vk::Fence) {
        self.last_fence.retain(|_, f| *f != fence);
        self.submitted.retain(|f| *f != fence);
    }
}

pub(crate) struct MockDriver {
    state: Mutex<State>,
    signaled: Condvar,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self::with_mode(SignalMode::OnSubmit)
    }

    pub(crate) fn with_mode(mode: SignalMode) -> Self {
        init_logger();
        MockDriver {
            state: Mutex::new(State {
                next_handle: 0,
                mode,
                lost: false,
                fences: AHashMap::new(),
                submitted: Vec::new(),
                created_fences: 0,
                events: AHashSet::new(),
                queues: AHashMap::new(),
                begins: AHashMap::new(),
                resets: AHashMap::new(),
                recording: AHashSet::new(),
                ended: AHashSet::new(),
                last_fence: AHashMap::new(),
                violations: Vec::new(),
                calls: Vec::new(),
                fail_submit: None,
                present_result: Ok(false),
            }),
            signaled: Condvar::new(),
        }
    }

    pub(crate) fn set_signal_mode(&self, mode: SignalMode) {
        lock(&self.state).mode = mode;
    }

    pub(crate) fn signal_fence(&self, fence: vk::Fence) {
        lock(&self.state).signal_up_to(fence);
        self.signaled.notify_all();
    }

    pub(crate) fn signal_all(&self) {
        lock(&self.state).signal_all();
        self.signaled.notify_all();
    }

    pub(crate) fn set_device_lost(&self) {
        lock(&self.state).lost = true;
        self.signaled.notify_all();
    }

    pub(crate) fn fail_next_submit(&self, result: vk::Result) {
        self.fail_submit_after(0, result);
    }

    ///Lets `successful` submits through, then fails one with `result`.
    pub(crate) fn fail_submit_after(&self, successful: usize, result: vk::Result) {
        lock(&self.state).fail_submit = Some((successful, result));
    }

    pub(crate) fn set_present_result(&self, result: VkResult<bool>) {
        lock(&self.state).present_result = result;
    }

    pub(crate) fn calls(&self) -> Vec<DriverCall> {
        lock(&self.state).calls.clone()
    }

    pub(crate) fn submissions(&self) -> Vec<DriverCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, DriverCall::Submit { .. }))
            .collect()
    }

    pub(crate) fn violations(&self) -> Vec<String> {
        lock(&self.state).violations.clone()
    }

    pub(crate) fn created_fence_count(&self) -> usize {
        lock(&self.state).created_fences
    }

    pub(crate) fn is_fence_alive(&self, fence: vk::Fence) -> bool {
        lock(&self.state).fences.contains_key(&fence)
    }

    pub(crate) fn fence_signaled(&self, fence: vk::Fence) -> bool {
        lock(&self.state)
            .fences
            .get(&fence)
            .map(|f| f.signaled)
            .unwrap_or(false)
    }

    pub(crate) fn pending_fence_count(&self) -> usize {
        lock(&self.state).submitted.len()
    }

    pub(crate) fn reset_count(&self, command_buffer: vk::CommandBuffer) -> usize {
        lock(&self.state)
            .resets
            .get(&command_buffer)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn begin_count(&self, command_buffer: vk::CommandBuffer) -> usize {
        lock(&self.state)
            .begins
            .get(&command_buffer)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn is_ended(&self, command_buffer: vk::CommandBuffer) -> bool {
        lock(&self.state).ended.contains(&command_buffer)
    }
}

impl Driver for MockDriver {
    fn get_device_queue(&self, family: u32, index: u32, protected: bool) -> vk::Queue {
        let mut state = lock(&self.state);
        if let Some(queue) = state.queues.get(&(family, index, protected)) {
            return *queue;
        }
        let queue = vk::Queue::from_raw(state.handle());
        state.queues.insert((family, index, protected), queue);
        queue
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = lock(&self.state);
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match state.fail_submit {
            Some((0, err)) => {
                state.fail_submit = None;
                return Err(err);
            }
            Some((successful, err)) => state.fail_submit = Some((successful - 1, err)),
            None => {}
        }

        for cb in submission.command_buffers {
            if !state.ended.contains(cb) {
                state
                    .violations
                    .push(format!("submitted {cb:?} which was not ended"));
            }
            if fence != vk::Fence::null() {
                state.last_fence.insert(*cb, fence);
            }
        }
        state.calls.push(DriverCall::Submit {
            queue,
            command_buffers: submission.command_buffers.to_vec(),
            wait_semaphores: submission.wait_semaphores.len(),
            signal_semaphores: submission.signal_semaphores.len(),
            protected: submission.protected,
            fence,
        });

        if fence != vk::Fence::null() {
            match state.fences.get(&fence).map(|f| f.pending || f.signaled) {
                Some(false) => {}
                Some(true) => state
                    .violations
                    .push(format!("submitted fence {fence:?} that was not reset")),
                None => state
                    .violations
                    .push(format!("submitted unknown fence {fence:?}")),
            }
            if let Some(f) = state.fences.get_mut(&fence) {
                f.pending = true;
            }
            state.submitted.push(fence);
            if state.mode == SignalMode::OnSubmit {
                state.signal_up_to(fence);
                drop(state);
                self.signaled.notify_all();
            }
        }
        Ok(())
    }

    fn queue_present(&self, queue: vk::Queue, present: &PresentInfo) -> VkResult<bool> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::Present {
            queue,
            swapchain: present.swapchain,
            image_index: present.image_index,
        });
        state.present_result
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::WaitIdle { queue });
        if state.mode != SignalMode::Never && !state.lost {
            state.signal_all();
            drop(state);
            self.signaled.notify_all();
        }
        Ok(())
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let mut state = lock(&self.state);
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, FenceState::default());
        state.created_fences += 1;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = lock(&self.state);
        if state.fences.remove(&fence).is_none() {
            state
                .violations
                .push(format!("destroyed unknown fence {fence:?}"));
        }
        state.forget_fence(fence);
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = lock(&self.state);
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let pending = match state.fences.get_mut(&fence) {
            Some(f) => {
                let pending = f.pending && !f.signaled;
                f.signaled = false;
                f.pending = false;
                pending
            }
            None => return Err(vk::Result::ERROR_UNKNOWN),
        };
        if pending {
            state
                .violations
                .push(format!("reset fence {fence:?} while pending"));
        }
        state.forget_fence(fence);
        Ok(())
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = lock(&self.state);
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(state.fences.get(&fence).map(|f| f.signaled).unwrap_or(false))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let deadline = Instant::now() + Duration::from_nanos(timeout_ns).min(MAX_MOCK_WAIT);
        let mut state = lock(&self.state);
        if state.mode == SignalMode::OnWait && state.submitted.contains(&fence) {
            state.signal_up_to(fence);
            self.signaled.notify_all();
        }

        loop {
            if state.lost {
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
            if state.fences.get(&fence).map(|f| f.signaled).unwrap_or(false) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(vk::Result::TIMEOUT);
            }
            state = self
                .signaled
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        let mut state = lock(&self.state);
        let event = vk::Event::from_raw(state.handle());
        state.events.insert(event);
        Ok(event)
    }

    fn destroy_event(&self, event: vk::Event) {
        lock(&self.state).events.remove(&event);
    }

    fn reset_event(&self, event: vk::Event) -> VkResult<()> {
        if lock(&self.state).events.contains(&event) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {}

    fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(DriverCall::CreateCommandPool { family, flags });
        Ok(vk::CommandPool::from_raw(state.handle()))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        lock(&self.state)
            .calls
            .push(DriverCall::DestroyCommandPool(pool));
    }

    fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = lock(&self.state);
        Ok(vk::CommandBuffer::from_raw(state.handle()))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = lock(&self.state);
        state.check_reuse(command_buffer, "free");
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = lock(&self.state);
        state.check_reuse(command_buffer, "reset");
        *state.resets.entry(command_buffer).or_insert(0) += 1;
        state.ended.remove(&command_buffer);
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = lock(&self.state);
        state.check_reuse(command_buffer, "begin");
        *state.begins.entry(command_buffer).or_insert(0) += 1;
        state.ended.remove(&command_buffer);
        state.recording.insert(command_buffer);
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = lock(&self.state);
        if !state.recording.remove(&command_buffer) {
            state
                .violations
                .push(format!("ended {command_buffer:?} which was not recording"));
        }
        state.ended.insert(command_buffer);
        Ok(())
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        lock(&self.state).calls.push(DriverCall::ExecuteCommands {
            primary,
            count: secondaries.len(),
        });
    }

    fn cmd_transition_to_foreign(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[ForeignImageBarrier],
    ) {
        lock(&self.state).calls.push(DriverCall::ForeignBarrier {
            command_buffer,
            count: barriers.len(),
        });
    }
}

///Recorder that executes a single (fake) secondary buffer.
pub(crate) struct TestCommands;

impl OutsideRenderPassCommands for TestCommands {
    fn flush_to_primary(
        &mut self,
        driver: &dyn Driver,
        state: &mut CommandsState,
    ) -> Result<(), QueueError> {
        driver.cmd_execute_commands(state.primary(), &[vk::CommandBuffer::null()]);
        Ok(())
    }
}

pub(crate) fn dummy_foreign_barrier() -> ForeignImageBarrier {
    ForeignImageBarrier {
        image: vk::Image::null(),
        subresource_range: vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1),
        src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        new_layout: vk::ImageLayout::GENERAL,
        src_queue_family_index: 0,
    }
}

fn init_logger() {
    static LOGGER: Once = Once::new();
    LOGGER.call_once(|| {
        //Only shows up with `--nocapture`. Fails if another logger is already set, which is fine.
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .init();
    });
}
