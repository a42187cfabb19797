use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{
    command_pool::{PrimaryCommandBuffer, SecondaryCommandBufferCollector, WhenToReset},
    command_pool_access::CommandPoolAccess,
    driver::Driver,
    error::QueueError,
    queue_family::ProtectionType,
    serial::QueueSerial,
    sync::{FenceRecycler, RecyclableFence, SharedExternalFence, SharedFence},
};

///Reference to the fence of a batch that can be waited on without holding any queue lock.
#[derive(Clone, Debug)]
pub enum BatchFence {
    Owned(SharedFence),
    External(SharedExternalFence),
}

impl BatchFence {
    pub fn wait(&self, timeout_ns: u64) -> VkResult<()> {
        match self {
            BatchFence::Owned(f) => f.wait(timeout_ns),
            BatchFence::External(f) => f.wait(timeout_ns),
        }
    }

    pub fn status(&self) -> VkResult<bool> {
        match self {
            BatchFence::Owned(f) => f.status(),
            BatchFence::External(f) => f.status(),
        }
    }
}

///One submission that is tracked until its fence signaled and its resources were released.
///
/// Every field is set at most once. After [release](CommandBatch::release) or [destroy](CommandBatch::destroy) the
/// batch is consumed.
#[derive(Debug, Default)]
pub struct CommandBatch {
    queue_serial: QueueSerial,
    protection: Option<ProtectionType>,
    primary: Option<PrimaryCommandBuffer>,
    pool_access: Option<Arc<CommandPoolAccess>>,
    secondary: SecondaryCommandBufferCollector,
    fence: Option<SharedFence>,
    external_fence: Option<SharedExternalFence>,
}

impl CommandBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue_serial(&mut self, serial: QueueSerial) {
        debug_assert!(serial.valid());
        debug_assert!(!self.queue_serial.valid(), "queue serial set twice");
        self.queue_serial = serial;
    }

    pub fn set_protection_type(&mut self, protection: ProtectionType) {
        debug_assert!(self.protection.is_none(), "protection type set twice");
        self.protection = Some(protection);
    }

    ///`primary` is optional. If set, `pool_access` is used to give it back once the batch is released.
    pub fn set_primary_commands(
        &mut self,
        primary: Option<PrimaryCommandBuffer>,
        pool_access: Arc<CommandPoolAccess>,
    ) {
        debug_assert!(self.primary.is_none() && self.pool_access.is_none());
        self.primary = primary;
        self.pool_access = Some(pool_access);
    }

    pub fn set_secondary_commands(&mut self, secondary: SecondaryCommandBufferCollector) {
        debug_assert!(self.secondary.is_empty());
        self.secondary = secondary;
    }

    ///Takes a fence from `recycler` (or creates one).
    pub fn init_fence(
        &mut self,
        driver: Arc<dyn Driver>,
        recycler: Arc<FenceRecycler>,
    ) -> VkResult<()> {
        debug_assert!(self.fence.is_none(), "fence initialized twice");
        self.fence = Some(Arc::new(RecyclableFence::new(driver, recycler)?));
        Ok(())
    }

    ///Drops the owned fence of a batch whose fence never made it into a submission. Completion is tracked through the
    /// external fence from then on.
    pub fn discard_fence(&mut self) {
        debug_assert!(self.external_fence.is_some());
        self.fence = None;
    }

    pub fn set_external_fence(&mut self, fence: SharedExternalFence) {
        debug_assert!(self.external_fence.is_none());
        self.external_fence = Some(fence);
    }

    pub fn queue_serial(&self) -> QueueSerial {
        debug_assert!(self.queue_serial.valid());
        self.queue_serial
    }

    pub fn protection_type(&self) -> Option<ProtectionType> {
        self.protection
    }

    pub fn primary_commands(&self) -> Option<vk::CommandBuffer> {
        self.primary.as_ref().map(|p| p.handle())
    }

    pub fn external_fence(&self) -> Option<&SharedExternalFence> {
        self.external_fence.as_ref()
    }

    pub fn has_fence(&self) -> bool {
        self.fence.is_some() || self.external_fence.is_some()
    }

    ///The fence that signals completion. The owned fence wins, since it may be signaled by an extra submission after
    /// the external fence's one.
    pub fn fence_ref(&self) -> Option<BatchFence> {
        if let Some(f) = &self.fence {
            Some(BatchFence::Owned(f.clone()))
        } else {
            self.external_fence.clone().map(BatchFence::External)
        }
    }

    pub fn fence_handle(&self) -> vk::Fence {
        match (&self.fence, &self.external_fence) {
            (Some(f), _) => f.inner(),
            (None, Some(f)) => f.inner(),
            (None, None) => vk::Fence::null(),
        }
    }

    pub fn fence_status(&self) -> VkResult<bool> {
        debug_assert!(self.has_fence());
        match (&self.fence, &self.external_fence) {
            (Some(f), _) => f.status(),
            (None, Some(f)) => f.status(),
            (None, None) => Ok(true),
        }
    }

    pub fn wait_fence(&self, timeout_ns: u64) -> VkResult<()> {
        debug_assert!(self.has_fence());
        match self.fence_ref() {
            Some(fence) => fence.wait(timeout_ns),
            None => Ok(()),
        }
    }

    ///Returns the resources of a completed batch: the primary buffer to its pool, secondaries to their owners and the
    /// fence to the recycler (once no waiter holds it anymore).
    pub fn release(mut self, when: WhenToReset) -> Result<(), QueueError> {
        if let Some(primary) = self.primary.take() {
            let (Some(pool_access), Some(protection)) = (&self.pool_access, self.protection) else {
                debug_assert!(false, "primary command buffer without pool");
                return Ok(());
            };
            pool_access.collect_primary_command_buffer(protection, primary, when)?;
        }
        self.secondary.release_command_buffers();
        self.fence = None;
        self.external_fence = None;
        Ok(())
    }

    ///Drops the batch without returning the primary buffer to its pool. The fence is destroyed instead of recycled.
    pub fn destroy(mut self) {
        self.destroy_inner();
    }

    fn destroy_inner(&mut self) {
        if let Some(primary) = self.primary.take() {
            match &self.pool_access {
                Some(access) => access.destroy_primary_command_buffer(primary),
                None => debug_assert!(false, "primary command buffer without pool"),
            }
        }
        self.secondary.release_command_buffers();
        if let Some(fence) = self.fence.take() {
            fence.detach();
        }
        self.external_fence = None;
    }
}

impl Drop for CommandBatch {
    fn drop(&mut self) {
        //Batches that were neither released nor destroyed (failed submission) must not hand a possibly pending
        // command buffer back to the pool.
        if self.primary.is_some() || !self.secondary.is_empty() {
            self.destroy_inner();
        }
    }
}
