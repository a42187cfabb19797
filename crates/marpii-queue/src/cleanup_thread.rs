use std::sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;

use crate::{
    command_pool::WhenToReset,
    command_queue::CommandQueue,
    error::{ErrorQueue, QueueError},
    util::lock,
};

///Wakes the clean-up thread. Shared with the [CommandQueue] so it can hand work off without knowing the thread.
#[derive(Debug, Default)]
pub struct CleanUpSignal {
    ///Set once the thread should exit.
    should_exit: Mutex<bool>,
    wake: Condvar,
    need_clean_up: AtomicBool,
}

impl CleanUpSignal {
    pub fn new() -> Self {
        Self::default()
    }

    ///Requests a clean-up pass. Requests that arrive before the thread woke up collapse into one pass.
    pub fn request_clean_up(&self) {
        if !self.need_clean_up.swap(true, Ordering::AcqRel) {
            //notify under the lock, otherwise the worker could miss it between its check and its wait
            let _exit = lock(&self.should_exit);
            self.wake.notify_one();
        }
    }

    pub fn is_clean_up_requested(&self) -> bool {
        self.need_clean_up.load(Ordering::Acquire)
    }

    ///Blocks until a pass was requested or the thread should exit. Returns false in the latter case. Clears the request
    /// before returning, so a request that arrives during the pass triggers another one.
    fn wait_for_request(&self) -> bool {
        let exit = self
            .wake
            .wait_while(lock(&self.should_exit), |exit| {
                !*exit && !self.need_clean_up.load(Ordering::Acquire)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *exit {
            return false;
        }
        self.need_clean_up.store(false, Ordering::Release);
        true
    }

    fn request_exit(&self) {
        let mut exit = lock(&self.should_exit);
        *exit = true;
        self.need_clean_up.store(false, Ordering::Release);
        self.wake.notify_one();
    }
}

///Background thread that polls for completed submissions, releases finished batches and destroys garbage.
///
/// Errors can't be returned to anyone from there. They are queued and picked up through
/// [check_and_pop_pending_error](CleanUpThread::check_and_pop_pending_error).
pub struct CleanUpThread {
    signal: Arc<CleanUpSignal>,
    queue: Arc<CommandQueue>,
    errors: Arc<ErrorQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CleanUpThread {
    pub const THREAD_NAME: &'static str = "marpii-gc";

    ///Starts the thread and registers its signal on `queue`.
    pub fn spawn(queue: Arc<CommandQueue>) -> Result<Self, QueueError> {
        let signal = Arc::new(CleanUpSignal::new());
        let errors = Arc::new(ErrorQueue::default());

        let worker = {
            let signal = signal.clone();
            let queue = queue.clone();
            let errors = errors.clone();
            std::thread::Builder::new()
                .name(Self::THREAD_NAME.to_owned())
                .spawn(move || run(&signal, &queue, &errors))?
        };
        queue.set_clean_up_signal(signal.clone());

        Ok(CleanUpThread {
            signal,
            queue,
            errors,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn signal(&self) -> &Arc<CleanUpSignal> {
        &self.signal
    }

    pub fn request_clean_up(&self) {
        self.signal.request_clean_up();
    }

    pub fn has_pending_error(&self) -> bool {
        self.errors.has_pending_error()
    }

    pub fn check_and_pop_pending_error(&self) -> Result<(), QueueError> {
        self.errors.check_and_pop_pending_error()
    }

    ///Stops the thread and does one last synchronous pass, so nothing requested right before is leaked.
    pub fn destroy(&self) -> Result<(), QueueError> {
        let Some(worker) = lock(&self.worker).take() else {
            return Ok(());
        };
        self.signal.request_exit();
        if worker.join().is_err() {
            #[cfg(feature = "logging")]
            log::error!("{} panicked", Self::THREAD_NAME);
            return Err(QueueError::WorkerExited);
        }

        clean_up_pass(&self.queue, WhenToReset::Now)?;
        self.errors.check_and_pop_pending_error()
    }
}

impl Drop for CleanUpThread {
    fn drop(&mut self) {
        if let Err(_e) = self.destroy() {
            #[cfg(feature = "logging")]
            log::error!("Shutting down {} failed: {}", Self::THREAD_NAME, _e);
        }
    }
}

fn clean_up_pass(queue: &CommandQueue, when: WhenToReset) -> Result<(), QueueError> {
    queue.check_completed_commands()?;
    if queue.has_finished_commands() {
        queue.release_finished_commands(when)?;
    }
    queue.garbage().cleanup_garbage(queue.last_completed_serials());
    Ok(())
}

fn run(signal: &CleanUpSignal, queue: &CommandQueue, errors: &ErrorQueue) {
    #[cfg(feature = "logging")]
    log::trace!("{} started", CleanUpThread::THREAD_NAME);

    let when = if queue.config().async_command_buffer_reset {
        WhenToReset::Now
    } else {
        WhenToReset::Defer
    };

    while signal.wait_for_request() {
        if let Err(e) = clean_up_pass(queue, when) {
            if e.is_device_lost() {
                queue.handle_device_lost();
            }
            errors.push(e);
        }
    }

    #[cfg(feature = "logging")]
    log::trace!("{} exited", CleanUpThread::THREAD_NAME);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::QueueConfig,
        garbage::{GarbageCollector, GarbageObject, SharedGarbageList},
        mock::{MockDriver, SignalMode, TestCommands},
        queue_family::{Priority, ProtectionType, QueueFamily},
        resource_use::ResourceUse,
        serial::{QueueSerial, Serial},
    };
    use ash::vk;
    use static_assertions::assert_impl_all;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, f: impl Fn() -> bool) {
        let start = Instant::now();
        while !f() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn setup(mode: SignalMode) -> (Arc<MockDriver>, Arc<CommandQueue>, Arc<SharedGarbageList>) {
        let driver = Arc::new(MockDriver::with_mode(mode));
        let garbage = Arc::new(SharedGarbageList::new(driver.clone()));
        let family = QueueFamily::new(
            0,
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS,
                queue_count: 1,
                ..Default::default()
            },
        );
        let queue = CommandQueue::new(
            driver.clone(),
            QueueConfig::default().with(|c| {
                c.async_garbage_cleanup = true;
                c.max_fence_wait_time_ns = 1_000_000;
            }),
            &family,
            false,
            1,
            garbage.clone(),
        )
        .unwrap();
        (driver, Arc::new(queue), garbage)
    }

    fn submit(queue: &CommandQueue, serial: QueueSerial) {
        queue
            .flush_outside_render_pass_commands(
                ProtectionType::Unprotected,
                Priority::Medium,
                &mut TestCommands,
            )
            .unwrap();
        queue
            .submit_commands(
                ProtectionType::Unprotected,
                Priority::Medium,
                None,
                None,
                &[],
                serial,
            )
            .unwrap();
    }

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(CleanUpThread: Send, Sync);
        assert_impl_all!(CleanUpSignal: Send, Sync);
    }

    #[test]
    fn requests_collapse() {
        let signal = CleanUpSignal::new();
        signal.request_clean_up();
        signal.request_clean_up();
        assert!(signal.wait_for_request());
        assert!(!signal.is_clean_up_requested());
        signal.request_exit();
        assert!(!signal.wait_for_request());
    }

    #[test]
    fn releases_and_collects_in_background() {
        let (driver, queue, garbage) = setup(SignalMode::OnSubmit);
        let thread = CleanUpThread::spawn(queue.clone()).unwrap();

        let serial = QueueSerial::new(0, Serial::from_raw(1));
        submit(&queue, serial);
        garbage.collect_garbage(
            ResourceUse::from(serial),
            vec![GarbageObject::custom(64, |_| {})],
        );

        //only requests the clean-up
        queue.check_and_cleanup_completed_commands().unwrap();
        wait_until("garbage clean-up", || garbage.is_empty());
        wait_until("release", || queue.num_all_commands() == 0);
        assert!(queue.has_queue_serial_finished(&serial));

        thread.destroy().unwrap();
        assert!(driver.violations().is_empty(), "{:?}", driver.violations());
        queue.destroy();
    }

    #[test]
    fn worker_errors_are_queued() {
        let (driver, queue, _garbage) = setup(SignalMode::Never);
        let thread = CleanUpThread::spawn(queue.clone()).unwrap();

        let serial = QueueSerial::new(0, Serial::from_raw(1));
        submit(&queue, serial);
        driver.set_device_lost();
        thread.request_clean_up();

        wait_until("worker error", || thread.has_pending_error());
        let err = thread.check_and_pop_pending_error().unwrap_err();
        assert!(err.is_device_lost());
        //device loss was handled on the worker
        assert!(queue.has_queue_serial_finished(&serial));

        thread.destroy().unwrap();
        queue.destroy();
    }
}
