use ash::{prelude::VkResult, vk};

use crate::driver::{Driver, ForeignImageBarrier, PresentInfo, Submission};

///Thin device abstraction around an ash device that takes care of device destruction once it's dropped.
///
/// Creating the device (extensions, features, queue create infos) is up to the application. Make sure the queue
/// families passed to the [CommandQueue](crate::CommandQueue) were actually requested at creation time, with
/// `VK_DEVICE_QUEUE_CREATE_PROTECTED_BIT` if protected queues are used.
pub struct Device {
    ///The raw ash device
    pub inner: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    ///Swapchain entry points, needed for presenting.
    pub swapchain: Option<ash::khr::swapchain::Device>,
}

impl Device {
    ///Wraps an already created device.
    ///
    /// # Safety
    ///
    /// `device` must have been created from `physical_device`, and must not be destroyed by anyone else. If `instance` is
    /// given, `VK_KHR_swapchain` must have been enabled on the device.
    pub unsafe fn from_raw(
        instance: Option<&ash::Instance>,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let swapchain = instance.map(|instance| ash::khr::swapchain::Device::new(instance, &device));
        Device {
            inner: device,
            physical_device,
            swapchain,
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe { self.inner.destroy_device(None) };
    }
}

impl Driver for Device {
    fn get_device_queue(&self, family: u32, index: u32, protected: bool) -> vk::Queue {
        if protected {
            let info = vk::DeviceQueueInfo2::default()
                .flags(vk::DeviceQueueCreateFlags::PROTECTED)
                .queue_family_index(family)
                .queue_index(index);
            unsafe { self.inner.get_device_queue2(&info) }
        } else {
            unsafe { self.inner.get_device_queue(family, index) }
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut protected_info = vk::ProtectedSubmitInfo::default().protected_submit(true);
        let mut info = vk::SubmitInfo::default()
            .command_buffers(submission.command_buffers)
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_dst_stage_masks)
            .signal_semaphores(submission.signal_semaphores);
        if submission.protected {
            info = info.push_next(&mut protected_info);
        }

        unsafe { self.inner.queue_submit(queue, &[info], fence) }
    }

    fn queue_present(&self, queue: vk::Queue, present: &PresentInfo) -> VkResult<bool> {
        let Some(loader) = &self.swapchain else {
            #[cfg(feature = "logging")]
            log::error!("Presenting without swapchain loader");
            return Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        };

        let swapchains = [present.swapchain];
        let indices = [present.image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&present.wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { loader.queue_present(queue, &info) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.inner.queue_wait_idle(queue) }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe { self.inner.create_fence(&vk::FenceCreateInfo::default(), None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.inner.destroy_fence(fence, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.inner.reset_fences(&[fence]) }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.inner.get_fence_status(fence) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.inner.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        unsafe { self.inner.create_event(&vk::EventCreateInfo::default(), None) }
    }

    fn destroy_event(&self, event: vk::Event) {
        unsafe { self.inner.destroy_event(event, None) }
    }

    fn reset_event(&self, event: vk::Event) -> VkResult<()> {
        unsafe { self.inner.reset_event(event) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.inner.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(flags);
        unsafe { self.inner.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.inner.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let mut buffers = unsafe { self.inner.allocate_command_buffers(&info)? };
        buffers.pop().ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.inner.free_command_buffers(pool, &[command_buffer]) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.inner
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.inner.begin_command_buffer(command_buffer, &info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.inner.end_command_buffer(command_buffer) }
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        if secondaries.is_empty() {
            return;
        }
        unsafe { self.inner.cmd_execute_commands(primary, secondaries) }
    }

    fn cmd_transition_to_foreign(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[ForeignImageBarrier],
    ) {
        if barriers.is_empty() {
            return;
        }
        let image_barriers = barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier::default()
                    .image(b.image)
                    .subresource_range(b.subresource_range)
                    .src_access_mask(b.src_access_mask)
                    .dst_access_mask(vk::AccessFlags::empty())
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(b.src_queue_family_index)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_FOREIGN_EXT)
            })
            .collect::<smallvec::SmallVec<[_; 4]>>();

        unsafe {
            self.inner.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &image_barriers,
            )
        }
    }
}
