use std::collections::VecDeque;

use ash::{prelude::VkResult, vk};

use crate::{driver::Driver, queue_family::ProtectionType};

///Number of primary buffers allocated when a pool is created.
const INIT_BUFFER_COUNT: usize = 2;

///When a returned command buffer is reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhenToReset {
    ///Reset right away.
    Now,
    ///Reset when the buffer is handed out again.
    Defer,
}

///Primary command buffer allocated from a [PersistentCommandPool]. Intentionally neither `Clone` nor `Copy`, there
/// is exactly one owner at any time.
#[derive(Debug, PartialEq, Eq)]
pub struct PrimaryCommandBuffer {
    inner: vk::CommandBuffer,
}

impl PrimaryCommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.inner
    }
}

///Secondary command buffer recorded by the frontend. The queue only keeps it alive until the batch that executed it
/// finished, then hands it back through [release](SecondaryCommandBuffer::release).
pub trait SecondaryCommandBuffer: Send {
    fn handle(&self) -> vk::CommandBuffer;
    ///Called once the GPU is done with the buffer.
    fn release(self: Box<Self>);
}

///Secondary command buffers executed by one primary.
#[derive(Default)]
pub struct SecondaryCommandBufferCollector {
    buffers: Vec<Box<dyn SecondaryCommandBuffer>>,
}

impl SecondaryCommandBufferCollector {
    pub fn collect(&mut self, buffer: Box<dyn SecondaryCommandBuffer>) {
        self.buffers.push(buffer);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = vk::CommandBuffer> + '_ {
        self.buffers.iter().map(|b| b.handle())
    }

    pub fn release_command_buffers(&mut self) {
        for buffer in self.buffers.drain(..) {
            buffer.release();
        }
    }
}

impl std::fmt::Debug for SecondaryCommandBufferCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handles()).finish()
    }
}

///Command pool that never frees its primary command buffers. Returned buffers are kept in a free list and handed out
/// again.
///
/// Not synchronised, the owner has to make sure the pool is only used by one thread at a time.
#[derive(Debug)]
pub struct PersistentCommandPool {
    pool: vk::CommandPool,
    ///Free buffers and whether they still need a reset.
    free: VecDeque<(vk::CommandBuffer, bool)>,
    protection: ProtectionType,
}

impl PersistentCommandPool {
    pub fn new(driver: &dyn Driver, protection: ProtectionType, family: u32) -> VkResult<Self> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
            | vk::CommandPoolCreateFlags::TRANSIENT;
        if protection.is_protected() {
            flags |= vk::CommandPoolCreateFlags::PROTECTED;
        }

        let pool = driver.create_command_pool(family, flags)?;
        let mut persistent = PersistentCommandPool {
            pool,
            free: VecDeque::with_capacity(INIT_BUFFER_COUNT),
            protection,
        };

        for _ in 0..INIT_BUFFER_COUNT {
            match driver.allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY) {
                Ok(cb) => persistent.free.push_back((cb, false)),
                Err(e) => {
                    persistent.destroy(driver);
                    return Err(e);
                }
            }
        }

        #[cfg(feature = "logging")]
        log::trace!("Created {:?} command pool {:?}", protection, pool);

        Ok(persistent)
    }

    pub fn protection(&self) -> ProtectionType {
        self.protection
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    ///Hands out a reset command buffer. Allocates a new one if the free list is empty.
    pub fn allocate(&mut self, driver: &dyn Driver) -> VkResult<PrimaryCommandBuffer> {
        let Some((inner, needs_reset)) = self.free.pop_front() else {
            let inner = driver.allocate_command_buffer(self.pool, vk::CommandBufferLevel::PRIMARY)?;
            return Ok(PrimaryCommandBuffer { inner });
        };

        if needs_reset {
            if let Err(e) = driver.reset_command_buffer(inner) {
                self.free.push_front((inner, true));
                return Err(e);
            }
        }
        Ok(PrimaryCommandBuffer { inner })
    }

    ///Takes `buffer` back. The GPU must be done with it.
    pub fn collect(
        &mut self,
        driver: &dyn Driver,
        buffer: PrimaryCommandBuffer,
        when: WhenToReset,
    ) -> VkResult<()> {
        match when {
            WhenToReset::Now => {
                if let Err(e) = driver.reset_command_buffer(buffer.inner) {
                    //keep it anyways, the reset is retried on allocation
                    self.free.push_back((buffer.inner, true));
                    return Err(e);
                }
                self.free.push_back((buffer.inner, false));
            }
            WhenToReset::Defer => self.free.push_back((buffer.inner, true)),
        }
        Ok(())
    }

    ///Frees every buffer and destroys the pool. Buffers that are currently handed out become invalid as well.
    pub fn destroy(&mut self, driver: &dyn Driver) {
        if self.pool == vk::CommandPool::null() {
            return;
        }
        for (cb, _) in self.free.drain(..) {
            driver.free_command_buffer(self.pool, cb);
        }
        driver.destroy_command_pool(self.pool);
        self.pool = vk::CommandPool::null();
    }
}
