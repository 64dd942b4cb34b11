//! Thread-safe access to the primary command pools and per-slot recording state.
use crate::{
    batch::CommandBatch,
    command::{CommandsState, OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands},
    command_allocator::PersistentCommandPool,
    device::DeviceRef,
    error::{Error, Result, VkResultExt},
    vk,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

/// Wait semaphores detached from a slot, with their destination stage masks.
pub type WaitSemaphores = (SmallVec<[vk::Semaphore; 4]>, SmallVec<[vk::PipelineStageFlags; 4]>);

struct Inner {
    /// Indexed by `[priority][protection]`.
    states: [[CommandsState; ProtectionType::COUNT]; Priority::COUNT],
    pools: [Option<PersistentCommandPool>; ProtectionType::COUNT],
}

/// Owns the primary command pools, one per protection domain, and the primary command buffers
/// being recorded for each (priority, protection) pair.
///
/// All methods serialize on a single lock. Critical sections never wait on the GPU.
pub struct CommandPoolAccess {
    device: DeviceRef,
    inner: Mutex<Inner>,
}

impl CommandPoolAccess {
    pub fn new(device: DeviceRef) -> CommandPoolAccess {
        CommandPoolAccess {
            device,
            inner: Mutex::new(Inner {
                states: Default::default(),
                pools: Default::default(),
            }),
        }
    }

    /// Creates the pool for `protection` if it doesn't exist yet.
    pub fn init_command_pool(&self, protection: ProtectionType, queue_family_index: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.pools[protection.index()];
        if slot.is_none() {
            *slot = Some(PersistentCommandPool::new(&*self.device, protection, queue_family_index)?);
        }
        Ok(())
    }

    pub fn is_initialized(&self, protection: ProtectionType) -> bool {
        self.inner.lock().pools[protection.index()].is_some()
    }

    /// Makes sure the slot has a primary command buffer in the recording state.
    fn ensure_primary_command_buffer_valid_locked(
        &self,
        inner: &mut Inner,
        protection: ProtectionType,
        priority: Priority,
    ) -> Result<()> {
        let Inner { states, pools } = inner;
        let state = &mut states[priority.index()][protection.index()];
        if state.primary.is_some() {
            return Ok(());
        }
        let pool = pools[protection.index()]
            .as_mut()
            .ok_or(Error::CommandPoolNotInitialized(protection))?;
        let cb = pool.alloc(&*self.device)?;
        if let Err(err) = self.device.begin_command_buffer(cb).or_vk_error() {
            pool.free(&*self.device, cb);
            return Err(err);
        }
        state.primary = Some(cb);
        Ok(())
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_primary_command_buffer_valid_locked(&mut inner, protection, priority)?;
        let state = &mut inner.states[priority.index()][protection.index()];
        commands.flush_to_primary(&*self.device, state);
        Ok(())
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_primary_command_buffer_valid_locked(&mut inner, protection, priority)?;
        let state = &mut inner.states[priority.index()][protection.index()];
        commands.flush_to_primary(&*self.device, state, framebuffer_override);
        Ok(())
    }

    /// Adds semaphores that the next submission of the slot waits on.
    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        wait_semaphores: &[vk::Semaphore],
        wait_semaphore_stage_masks: &[vk::PipelineStageFlags],
    ) {
        assert!(!wait_semaphores.is_empty());
        assert_eq!(wait_semaphores.len(), wait_semaphore_stage_masks.len());
        let mut inner = self.inner.lock();
        let state = &mut inner.states[priority.index()][protection.index()];
        state.wait_semaphores.extend_from_slice(wait_semaphores);
        state
            .wait_semaphore_stage_masks
            .extend_from_slice(wait_semaphore_stage_masks);
    }

    /// Moves everything accumulated in the slot into `batch`, ending the primary command buffer
    /// if one was being recorded. Returns the wait semaphores of the slot.
    pub fn get_commands_and_wait_semaphores(
        self: &Arc<Self>,
        protection: ProtectionType,
        priority: Priority,
        batch: &mut CommandBatch,
    ) -> Result<WaitSemaphores> {
        let mut inner = self.inner.lock();
        let state = &mut inner.states[priority.index()][protection.index()];
        debug_assert!(state.primary.is_some() || state.secondaries.is_empty());

        if let Some(primary) = state.primary {
            self.device.end_command_buffer(primary).or_vk_error()?;
        }
        batch.set_primary_commands(state.primary.take(), Some(self.clone()));
        batch.set_secondary_commands(std::mem::take(&mut state.secondaries));

        Ok((
            std::mem::take(&mut state.wait_semaphores),
            std::mem::take(&mut state.wait_semaphore_stage_masks),
        ))
    }

    /// Returns a finished primary command buffer to its pool for reuse.
    pub fn collect_primary_command_buffer(
        &self,
        protection: ProtectionType,
        command_buffer: vk::CommandBuffer,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let pool = inner.pools[protection.index()]
            .as_mut()
            .ok_or(Error::CommandPoolNotInitialized(protection))?;
        pool.collect(&*self.device, command_buffer)
    }

    /// Frees a primary command buffer without recycling it.
    pub fn destroy_primary_command_buffer(&self, protection: ProtectionType, command_buffer: vk::CommandBuffer) {
        let inner = self.inner.lock();
        // if the pool is gone the buffer was freed along with it
        if let Some(pool) = &inner.pools[protection.index()] {
            pool.free(&*self.device, command_buffer);
        }
    }

    /// Frees all recording state and destroys the pools.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        let Inner { states, pools } = &mut *inner;
        for (protection_index, pool) in pools.iter_mut().enumerate() {
            for priority_states in states.iter_mut() {
                let state = &mut priority_states[protection_index];
                state.wait_semaphores.clear();
                state.wait_semaphore_stage_masks.clear();
                if let (Some(primary), Some(pool)) = (state.primary.take(), pool.as_ref()) {
                    pool.free(&*self.device, primary);
                }
                state.secondaries.release_command_buffers();
            }
            if let Some(pool) = pool.take() {
                pool.destroy(&*self.device);
            }
        }
    }
}

impl fmt::Debug for CommandPoolAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommandPoolAccess")
            .field("pools", &inner.pools)
            .field("states", &inner.states)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::SecondaryCommandBufferCollector,
        mock::{MockDevice, MockEvent, MockSecondaryPool},
        serial::{QueueSerial, Serial},
    };

    fn pool_access() -> (Arc<MockDevice>, Arc<CommandPoolAccess>) {
        let mock = Arc::new(MockDevice::new());
        let access = Arc::new(CommandPoolAccess::new(mock.clone()));
        (mock, access)
    }

    #[test]
    fn flush_requires_an_initialized_pool() {
        let (_mock, access) = pool_access();
        assert!(!access.is_initialized(ProtectionType::Unprotected));
        access.init_command_pool(ProtectionType::Unprotected, 0).unwrap();
        assert!(access.is_initialized(ProtectionType::Unprotected));
        assert!(!access.is_initialized(ProtectionType::Protected));
        let err = access
            .flush_outside_render_pass_commands(
                ProtectionType::Protected,
                Priority::Medium,
                OutsideRenderPassCommands::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::CommandPoolNotInitialized(ProtectionType::Protected)));
    }

    #[test]
    fn slots_are_independent() {
        let (mock, access) = pool_access();
        access.init_command_pool(ProtectionType::Unprotected, 0).unwrap();
        let secondary_pool = MockSecondaryPool::new();

        let mut secondaries = SecondaryCommandBufferCollector::new();
        secondaries.collect(secondary_pool.allocate());
        access
            .flush_outside_render_pass_commands(
                ProtectionType::Unprotected,
                Priority::High,
                OutsideRenderPassCommands::new(secondaries),
            )
            .unwrap();

        // nothing was recorded at medium priority
        let mut batch = CommandBatch::new();
        batch.set_queue_serial(QueueSerial::new(0, Serial(1)));
        batch.set_protection_type(ProtectionType::Unprotected);
        let (waits, _) = access
            .get_commands_and_wait_semaphores(ProtectionType::Unprotected, Priority::Medium, &mut batch)
            .unwrap();
        assert!(waits.is_empty());
        assert!(batch.primary_commands().is_none());

        let mut batch = CommandBatch::new();
        batch.set_queue_serial(QueueSerial::new(0, Serial(2)));
        batch.set_protection_type(ProtectionType::Unprotected);
        access
            .get_commands_and_wait_semaphores(ProtectionType::Unprotected, Priority::High, &mut batch)
            .unwrap();
        let primary = batch.primary_commands().unwrap();
        assert_eq!(batch.secondary_commands().len(), 1);
        assert!(mock.events().contains(&MockEvent::EndCommandBuffer(primary)));

        batch.release().unwrap();
        assert_eq!(secondary_pool.collected().len(), 1);
        access.destroy();
        assert_eq!(mock.live_command_buffer_count(), 0);
    }

    #[test]
    #[should_panic]
    fn wait_semaphores_need_matching_stage_masks() {
        let (_mock, access) = pool_access();
        access.flush_wait_semaphores(
            ProtectionType::Unprotected,
            Priority::Medium,
            &[vk::Semaphore::null()],
            &[],
        );
    }
}
