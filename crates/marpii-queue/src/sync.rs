//! # Synchronisation
//!
//! Fences and events are cheap to reuse but not free to create. Both are therefore kept in a [Recycler] after use:
//! - [FenceRecycler]: free list of reset, unsignaled fences. Every submission takes one via [RecyclableFence::new].
//! - [EventRecycler]: free list of reset events.
//!
//! A recycler only ever holds objects nobody references anymore. For fences this is guaranteed by [RecyclableFence]:
//! it is shared via [SharedFence] and only goes back to the recycler when the last reference is dropped, which can
//! not happen before the batch that signaled it was released.
//!
//! If more objects are recycled than the recycler retains, the surplus is destroyed.

use ash::{prelude::VkResult, vk};
use std::fmt::Debug;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use crate::{driver::Driver, util::lock};

///Bounded free list.
#[derive(Debug)]
pub struct Recycler<T> {
    objects: Vec<T>,
    max_retained: usize,
}

impl<T> Recycler<T> {
    pub fn new(max_retained: usize) -> Self {
        Recycler {
            objects: Vec::new(),
            max_retained,
        }
    }

    pub fn fetch(&mut self) -> Option<T> {
        self.objects.pop()
    }

    ///Keeps `object` for reuse. Returns it again if the free list is full, the caller has to destroy it in that case.
    #[must_use]
    pub fn recycle(&mut self, object: T) -> Option<T> {
        if self.objects.len() >= self.max_retained {
            Some(object)
        } else {
            self.objects.push(object);
            None
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.objects.drain(..)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

///Free list of unsignaled fences.
#[derive(Debug)]
pub struct FenceRecycler {
    fences: Mutex<Recycler<vk::Fence>>,
}

impl FenceRecycler {
    pub fn new(max_retained: usize) -> Self {
        FenceRecycler {
            fences: Mutex::new(Recycler::new(max_retained)),
        }
    }

    pub fn fetch(&self) -> Option<vk::Fence> {
        lock(&self.fences).fetch()
    }

    ///`fence` must be reset and not referenced anymore.
    pub fn recycle(&self, driver: &dyn Driver, fence: vk::Fence) {
        let overflow = lock(&self.fences).recycle(fence);
        if let Some(fence) = overflow {
            driver.destroy_fence(fence);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.fences).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    ///Destroys all retained fences.
    pub fn destroy(&self, driver: &dyn Driver) {
        let mut fences = lock(&self.fences);
        for fence in fences.drain() {
            driver.destroy_fence(fence);
        }
    }
}

///Fence owned by the queue. Fetched from the [FenceRecycler] (or created on a miss), reset and handed back when
/// dropped.
pub struct RecyclableFence {
    driver: Arc<dyn Driver>,
    fence: vk::Fence,
    recycler: Arc<FenceRecycler>,
    ///If set, the fence is destroyed instead of recycled.
    detached: AtomicBool,
}

///Fence shared between a batch and threads waiting on it.
pub type SharedFence = Arc<RecyclableFence>;

impl RecyclableFence {
    pub fn new(driver: Arc<dyn Driver>, recycler: Arc<FenceRecycler>) -> VkResult<Self> {
        let fence = match recycler.fetch() {
            Some(fence) => fence,
            None => driver.create_fence()?,
        };

        Ok(RecyclableFence {
            driver,
            fence,
            recycler,
            detached: AtomicBool::new(false),
        })
    }

    pub fn inner(&self) -> vk::Fence {
        self.fence
    }

    ///True if signaled.
    pub fn status(&self) -> VkResult<bool> {
        self.driver.get_fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> VkResult<()> {
        self.driver.wait_for_fence(self.fence, timeout_ns)
    }

    ///Makes sure the fence is destroyed instead of recycled once the last reference is dropped. Used when the fence's
    /// signal state can't be trusted anymore (device loss).
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

impl Debug for RecyclableFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fence.fmt(f)
    }
}

impl Drop for RecyclableFence {
    fn drop(&mut self) {
        if self.detached.load(Ordering::Acquire) {
            self.driver.destroy_fence(self.fence);
            return;
        }

        match self.driver.reset_fence(self.fence) {
            Ok(()) => self.recycler.recycle(self.driver.as_ref(), self.fence),
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::warn!("Failed to reset fence {:?}, destroying it: {}", self.fence, _e);
                self.driver.destroy_fence(self.fence);
            }
        }
    }
}

///Fence supplied by the application (for instance backing a sync object it exports). Not recycled, destroyed once the
/// last reference is dropped.
pub struct ExternalFence {
    driver: Arc<dyn Driver>,
    fence: vk::Fence,
}

pub type SharedExternalFence = Arc<ExternalFence>;

impl ExternalFence {
    pub fn new(driver: Arc<dyn Driver>) -> VkResult<Self> {
        let fence = driver.create_fence()?;
        Ok(ExternalFence { driver, fence })
    }

    ///Takes ownership of `fence`.
    ///
    /// # Safety
    ///
    /// `fence` must have been created on `driver`, be unsignaled and must not be destroyed by anyone else.
    pub unsafe fn from_raw(driver: Arc<dyn Driver>, fence: vk::Fence) -> Self {
        ExternalFence { driver, fence }
    }

    pub fn inner(&self) -> vk::Fence {
        self.fence
    }

    pub fn status(&self) -> VkResult<bool> {
        self.driver.get_fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> VkResult<()> {
        self.driver.wait_for_fence(self.fence, timeout_ns)
    }
}

impl Debug for ExternalFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fence.fmt(f)
    }
}

impl Drop for ExternalFence {
    fn drop(&mut self) {
        self.driver.destroy_fence(self.fence);
    }
}

///Free list of reset events.
#[derive(Debug)]
pub struct EventRecycler {
    events: Mutex<Recycler<vk::Event>>,
}

impl EventRecycler {
    pub fn new(max_retained: usize) -> Self {
        EventRecycler {
            events: Mutex::new(Recycler::new(max_retained)),
        }
    }

    ///Returns a recycled event, or creates a new one.
    pub fn fetch_or_create(&self, driver: &dyn Driver) -> VkResult<vk::Event> {
        if let Some(event) = lock(&self.events).fetch() {
            return Ok(event);
        }
        driver.create_event()
    }

    ///Resets `event` and keeps it for reuse. Events that can't be reset, or don't fit, are destroyed.
    pub fn recycle(&self, driver: &dyn Driver, event: vk::Event) {
        if let Err(_e) = driver.reset_event(event) {
            #[cfg(feature = "logging")]
            log::warn!("Failed to reset event {:?}, destroying it: {}", event, _e);
            driver.destroy_event(event);
            return;
        }

        let overflow = lock(&self.events).recycle(event);
        if let Some(event) = overflow {
            driver.destroy_event(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn destroy(&self, driver: &dyn Driver) {
        let mut events = lock(&self.events);
        for event in events.drain() {
            driver.destroy_event(event);
        }
    }
}
