use std::sync::{Arc, Mutex};

use ash::vk;

use crate::{
    command_pool::{
        PersistentCommandPool, PrimaryCommandBuffer, SecondaryCommandBuffer,
        SecondaryCommandBufferCollector, WhenToReset,
    },
    driver::{Driver, ForeignImageBarrier},
    error::QueueError,
    queue_family::{Priority, ProtectionType},
    util::lock,
};

///Commands accumulated for the next submission of one (priority, protection) pair.
#[derive(Debug, Default)]
pub struct CommandsState {
    primary: Option<PrimaryCommandBuffer>,
    secondary: SecondaryCommandBufferCollector,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stage_masks: Vec<vk::PipelineStageFlags>,
}

impl CommandsState {
    ///The open primary command buffer. Always valid while a recorder is flushing into this state.
    pub fn primary(&self) -> vk::CommandBuffer {
        self.primary
            .as_ref()
            .map(|p| p.handle())
            .unwrap_or(vk::CommandBuffer::null())
    }

    ///Keeps `buffer` alive until the submission that executes it finished.
    pub fn collect_secondary(&mut self, buffer: Box<dyn SecondaryCommandBuffer>) {
        self.secondary.collect(buffer);
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }
}

///Recorded commands that live outside of a render pass. Replayed into the open primary command buffer on flush.
pub trait OutsideRenderPassCommands {
    fn flush_to_primary(
        &mut self,
        driver: &dyn Driver,
        state: &mut CommandsState,
    ) -> Result<(), QueueError>;
}

///Recorded commands of a render pass.
pub trait RenderPassCommands {
    fn flush_to_primary(
        &mut self,
        driver: &dyn Driver,
        state: &mut CommandsState,
        render_pass: vk::RenderPass,
        framebuffer_override: vk::Framebuffer,
    ) -> Result<(), QueueError>;
}

///Everything a submission takes out of a [CommandsState].
#[derive(Debug, Default)]
pub struct SealedCommands {
    ///Already ended, if any.
    pub primary: Option<PrimaryCommandBuffer>,
    pub secondary: SecondaryCommandBufferCollector,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stage_masks: Vec<vk::PipelineStageFlags>,
}

struct PoolState {
    pools: [Option<PersistentCommandPool>; ProtectionType::COUNT],
    states: [[CommandsState; ProtectionType::COUNT]; Priority::COUNT],
}

impl PoolState {
    fn state(&mut self, priority: Priority, protection: ProtectionType) -> &mut CommandsState {
        &mut self.states[priority.as_index()][protection.as_index()]
    }

    fn ensure_primary_valid(
        &mut self,
        driver: &dyn Driver,
        protection: ProtectionType,
        priority: Priority,
    ) -> Result<(), QueueError> {
        if self.state(priority, protection).primary.is_some() {
            return Ok(());
        }

        let pool = self.pools[protection.as_index()]
            .as_mut()
            .ok_or(QueueError::PoolNotInitialized(protection))?;
        let primary = pool.allocate(driver)?;
        if let Err(e) =
            driver.begin_command_buffer(primary.handle(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        {
            pool.collect(driver, primary, WhenToReset::Defer)?;
            return Err(e.into());
        }
        self.state(priority, protection).primary = Some(primary);
        Ok(())
    }
}

///The only way to the command pools. Vulkan requires pools (and every buffer allocated from them) to be externally
/// synchronised, so all pool and accumulator access happens under one lock.
pub struct CommandPoolAccess {
    driver: Arc<dyn Driver>,
    inner: Mutex<PoolState>,
}

impl std::fmt::Debug for CommandPoolAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("CommandPoolAccess")
            .field("pools", &inner.pools)
            .finish()
    }
}

impl CommandPoolAccess {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        CommandPoolAccess {
            driver,
            inner: Mutex::new(PoolState {
                pools: Default::default(),
                states: Default::default(),
            }),
        }
    }

    ///Creates the pool for `protection` if it does not exist yet.
    pub fn init_command_pool(
        &self,
        protection: ProtectionType,
        queue_family_index: u32,
    ) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        let slot = &mut inner.pools[protection.as_index()];
        if slot.is_none() {
            *slot = Some(PersistentCommandPool::new(
                self.driver.as_ref(),
                protection,
                queue_family_index,
            )?);
        }
        Ok(())
    }

    pub fn has_pool(&self, protection: ProtectionType) -> bool {
        lock(&self.inner).pools[protection.as_index()].is_some()
    }

    ///Drops all accumulated state and destroys the pools.
    pub fn destroy(&self) {
        let mut inner = lock(&self.inner);
        for state in inner.states.iter_mut().flatten() {
            state.wait_semaphores.clear();
            state.wait_stage_masks.clear();
            //freed together with the pool
            state.primary = None;
            state.secondary.release_command_buffers();
        }
        for pool in inner.pools.iter_mut() {
            if let Some(mut pool) = pool.take() {
                pool.destroy(self.driver.as_ref());
            }
        }
    }

    ///Forgets `primary` without touching the pool. The buffer is freed when the pool is destroyed. Used on the device
    /// lost path, where the buffer's execution state is unknown.
    pub fn destroy_primary_command_buffer(&self, primary: PrimaryCommandBuffer) {
        #[cfg(feature = "logging")]
        log::trace!("Dropping primary command buffer {:?}", primary.handle());
        drop(primary);
    }

    ///Returns a finished primary command buffer to its pool.
    pub fn collect_primary_command_buffer(
        &self,
        protection: ProtectionType,
        primary: PrimaryCommandBuffer,
        when: WhenToReset,
    ) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        let pool = inner.pools[protection.as_index()]
            .as_mut()
            .ok_or(QueueError::PoolNotInitialized(protection))?;
        pool.collect(self.driver.as_ref(), primary, when)?;
        Ok(())
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: &mut dyn OutsideRenderPassCommands,
    ) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        inner.ensure_primary_valid(self.driver.as_ref(), protection, priority)?;
        commands.flush_to_primary(self.driver.as_ref(), inner.state(priority, protection))
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        render_pass: vk::RenderPass,
        framebuffer_override: vk::Framebuffer,
        commands: &mut dyn RenderPassCommands,
    ) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        inner.ensure_primary_valid(self.driver.as_ref(), protection, priority)?;
        commands.flush_to_primary(
            self.driver.as_ref(),
            inner.state(priority, protection),
            render_pass,
            framebuffer_override,
        )
    }

    ///Adds semaphores the next submission of (`protection`, `priority`) waits on.
    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        semaphores: Vec<vk::Semaphore>,
        stage_masks: Vec<vk::PipelineStageFlags>,
    ) {
        debug_assert!(!semaphores.is_empty());
        debug_assert_eq!(semaphores.len(), stage_masks.len());

        let mut inner = lock(&self.inner);
        let state = inner.state(priority, protection);
        state.wait_semaphores.extend(semaphores);
        state.wait_stage_masks.extend(stage_masks);
    }

    ///Seals the accumulated commands of (`protection`, `priority`) for submission. Records `foreign_barriers` first,
    /// allocating a primary command buffer if needed, then ends the primary buffer and moves everything out.
    pub fn get_commands_and_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        foreign_barriers: &[ForeignImageBarrier],
    ) -> Result<SealedCommands, QueueError> {
        let mut inner = lock(&self.inner);
        debug_assert!({
            let state = inner.state(priority, protection);
            state.primary.is_some() || state.secondary.is_empty()
        });

        if !foreign_barriers.is_empty() {
            //another thread may have submitted just now, leaving no open buffer to record into
            inner.ensure_primary_valid(self.driver.as_ref(), protection, priority)?;
            let primary = inner.state(priority, protection).primary();
            self.driver
                .cmd_transition_to_foreign(primary, foreign_barriers);
        }

        let state = inner.state(priority, protection);
        if let Some(primary) = &state.primary {
            self.driver.end_command_buffer(primary.handle())?;
        }

        Ok(SealedCommands {
            primary: state.primary.take(),
            secondary: std::mem::take(&mut state.secondary),
            wait_semaphores: std::mem::take(&mut state.wait_semaphores),
            wait_stage_masks: std::mem::take(&mut state.wait_stage_masks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DriverCall, MockDriver};
    use static_assertions::assert_impl_all;

    ///Records a single fake secondary into the primary.
    struct FakeCommands;

    impl OutsideRenderPassCommands for FakeCommands {
        fn flush_to_primary(
            &mut self,
            driver: &dyn Driver,
            state: &mut CommandsState,
        ) -> Result<(), QueueError> {
            assert!(state.has_primary());
            driver.cmd_execute_commands(state.primary(), &[vk::CommandBuffer::null()]);
            Ok(())
        }
    }

    struct FakeRenderPass(vk::RenderPass);

    impl RenderPassCommands for FakeRenderPass {
        fn flush_to_primary(
            &mut self,
            _driver: &dyn Driver,
            state: &mut CommandsState,
            render_pass: vk::RenderPass,
            framebuffer_override: vk::Framebuffer,
        ) -> Result<(), QueueError> {
            assert!(state.has_primary());
            assert_eq!(render_pass, self.0);
            assert_eq!(framebuffer_override, vk::Framebuffer::null());
            Ok(())
        }
    }

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(CommandPoolAccess: Send, Sync);
    }

    #[test]
    fn flush_opens_primary_and_sealing_ends_it() {
        let driver = Arc::new(MockDriver::new());
        let access = CommandPoolAccess::new(driver.clone());
        access
            .init_command_pool(ProtectionType::Unprotected, 0)
            .unwrap();

        access
            .flush_outside_render_pass_commands(
                ProtectionType::Unprotected,
                Priority::Medium,
                &mut FakeCommands,
            )
            .unwrap();
        access
            .flush_render_pass_commands(
                ProtectionType::Unprotected,
                Priority::Medium,
                vk::RenderPass::null(),
                vk::Framebuffer::null(),
                &mut FakeRenderPass(vk::RenderPass::null()),
            )
            .unwrap();
        access.flush_wait_semaphores(
            ProtectionType::Unprotected,
            Priority::Medium,
            vec![vk::Semaphore::null()],
            vec![vk::PipelineStageFlags::ALL_COMMANDS],
        );

        let sealed = access
            .get_commands_and_wait_semaphores(ProtectionType::Unprotected, Priority::Medium, &[])
            .unwrap();
        let primary = sealed.primary.expect("no primary");
        assert_eq!(sealed.wait_semaphores.len(), 1);
        assert_eq!(driver.begin_count(primary.handle()), 1);
        assert!(driver.is_ended(primary.handle()));

        //state was reset
        let sealed = access
            .get_commands_and_wait_semaphores(ProtectionType::Unprotected, Priority::Medium, &[])
            .unwrap();
        assert!(sealed.primary.is_none());
        assert!(sealed.wait_semaphores.is_empty());

        access
            .collect_primary_command_buffer(ProtectionType::Unprotected, primary, WhenToReset::Now)
            .unwrap();
        access.destroy();
        assert!(!access.has_pool(ProtectionType::Unprotected));
    }

    #[test]
    fn foreign_barriers_force_a_primary() {
        let driver = Arc::new(MockDriver::new());
        let access = CommandPoolAccess::new(driver.clone());
        access
            .init_command_pool(ProtectionType::Unprotected, 0)
            .unwrap();

        let barrier = ForeignImageBarrier {
            image: vk::Image::null(),
            subresource_range: vk::ImageSubresourceRange::default(),
            src_access_mask: vk::AccessFlags::SHADER_WRITE,
            old_layout: vk::ImageLayout::GENERAL,
            new_layout: vk::ImageLayout::GENERAL,
            src_queue_family_index: 0,
        };
        let sealed = access
            .get_commands_and_wait_semaphores(
                ProtectionType::Unprotected,
                Priority::High,
                &[barrier],
            )
            .unwrap();
        let primary = sealed.primary.expect("barrier needs a primary");
        assert!(driver.calls().iter().any(|c| matches!(
            c,
            DriverCall::ForeignBarrier { command_buffer, count: 1 } if *command_buffer == primary.handle()
        )));
        access.destroy_primary_command_buffer(primary);
        access.destroy();
    }

    #[test]
    fn missing_pool_is_reported() {
        let driver = Arc::new(MockDriver::new());
        let access = CommandPoolAccess::new(driver);
        let err = access
            .flush_outside_render_pass_commands(
                ProtectionType::Protected,
                Priority::Low,
                &mut FakeCommands,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::PoolNotInitialized(ProtectionType::Protected)
        ));
    }
}
