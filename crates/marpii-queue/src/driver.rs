//! # Driver surface
//!
//! Everything the command queue needs from Vulkan goes through the [Driver] trait. [Device](crate::Device)
//! implements it on top of ash. Keeping the surface behind a trait lets the queue be driven by anything that behaves like
//! a Vulkan device, which is mostly interesting for tests.
//!
//! All functions take plain `ash::vk` handles. Lifetimes of those handles are managed by the queue, not by the driver.

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

///Description of one `vkQueueSubmit` batch. Borrowed, since it only lives for the duration of the submit call.
#[derive(Clone, Copy, Debug, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    ///One stage mask per wait semaphore.
    pub wait_dst_stage_masks: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    ///Chains `VkProtectedSubmitInfo` if set.
    pub protected: bool,
}

impl Submission<'_> {
    ///True if submitting this would do nothing besides signaling the fence.
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty()
            && self.wait_semaphores.is_empty()
            && self.signal_semaphores.is_empty()
    }
}

///Owned present description. Can be sent to the command processor thread.
#[derive(Clone, Debug)]
pub struct PresentInfo {
    pub wait_semaphores: SmallVec<[vk::Semaphore; 2]>,
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

///Transition of an image to an external (foreign) queue family, recorded right before the primary command buffer
/// of a submission is ended.
#[derive(Clone, Copy, Debug)]
pub struct ForeignImageBarrier {
    pub image: vk::Image,
    pub subresource_range: vk::ImageSubresourceRange,
    pub src_access_mask: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
}

///Present results that leave the swapchain usable (or at least recreatable). Everything else is treated as fatal.
pub fn is_non_fatal_present_result(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::SUCCESS
            | vk::Result::SUBOPTIMAL_KHR
            | vk::Result::ERROR_OUT_OF_DATE_KHR
            | vk::Result::ERROR_SURFACE_LOST_KHR
            | vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT
    )
}

///Folds ash's present return value back into a single [vk::Result].
pub fn present_result_code(result: VkResult<bool>) -> vk::Result {
    match result {
        Ok(false) => vk::Result::SUCCESS,
        Ok(true) => vk::Result::SUBOPTIMAL_KHR,
        Err(e) => e,
    }
}

///The native driver entry points used by the command queue.
///
/// Implementations must be callable from multiple threads. External synchronisation rules of Vulkan (queues, command
/// pools) are upheld by the caller.
pub trait Driver: Send + Sync {
    ///Returns queue `index` of `family`. If `protected` is set the queue is fetched with
    /// `VK_DEVICE_QUEUE_CREATE_PROTECTED_BIT`.
    fn get_device_queue(&self, family: u32, index: u32, protected: bool) -> vk::Queue;
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> VkResult<()>;
    ///Returns `true` if the swapchain is suboptimal.
    fn queue_present(&self, queue: vk::Queue, present: &PresentInfo) -> VkResult<bool>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    ///Returns `true` if signaled.
    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    ///Blocks until `fence` is signaled. A timeout is reported as `Err(vk::Result::TIMEOUT)`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    fn create_event(&self) -> VkResult<vk::Event>;
    fn destroy_event(&self, event: vk::Event);
    fn reset_event(&self, event: vk::Event) -> VkResult<()>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);
    ///Records one pipeline barrier that releases all `barriers` to `VK_QUEUE_FAMILY_FOREIGN_EXT`.
    fn cmd_transition_to_foreign(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[ForeignImageBarrier],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_results() {
        assert_eq!(present_result_code(Ok(true)), vk::Result::SUBOPTIMAL_KHR);
        assert_eq!(present_result_code(Ok(false)), vk::Result::SUCCESS);
        assert!(is_non_fatal_present_result(present_result_code(Err(
            vk::Result::ERROR_OUT_OF_DATE_KHR
        ))));
        assert!(!is_non_fatal_present_result(vk::Result::ERROR_DEVICE_LOST));
    }

    #[test]
    fn empty_submission() {
        assert!(Submission::default().is_empty());
        let sem = [vk::Semaphore::null()];
        let submission = Submission {
            signal_semaphores: &sem,
            ..Default::default()
        };
        assert!(!submission.is_empty());
    }
}
