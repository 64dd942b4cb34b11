use crate::{
    command::ProtectionType,
    device::DeviceFunctions,
    error::{Result, VkResultExt},
    vk,
};
use tracing::debug;

/// Number of primary command buffers allocated up front when a pool is created.
const INIT_COMMAND_BUFFER_COUNT: usize = 2;

/// Allocates primary command buffers in a `vk::CommandPool` and allows re-use of collected command buffers.
#[derive(Debug)]
pub(crate) struct PersistentCommandPool {
    protection: ProtectionType,
    queue_family: u32,
    command_pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
}

impl PersistentCommandPool {
    pub(crate) fn new(
        device: &dyn DeviceFunctions,
        protection: ProtectionType,
        queue_family_index: u32,
    ) -> Result<PersistentCommandPool> {
        let command_pool = device
            .create_command_pool(queue_family_index, protection.is_protected())
            .or_vk_error()?;

        let mut pool = PersistentCommandPool {
            protection,
            queue_family: queue_family_index,
            command_pool,
            free: Vec::with_capacity(INIT_COMMAND_BUFFER_COUNT),
        };
        for _ in 0..INIT_COMMAND_BUFFER_COUNT {
            match device.allocate_primary_command_buffer(command_pool).or_vk_error() {
                Ok(cb) => pool.free.push(cb),
                Err(err) => {
                    pool.destroy(device);
                    return Err(err);
                }
            }
        }

        debug!(
            "created {:?} command pool {:?} on queue family {}",
            protection, command_pool, queue_family_index
        );
        Ok(pool)
    }

    /// Returns a primary command buffer in the initial state.
    pub(crate) fn alloc(&mut self, device: &dyn DeviceFunctions) -> Result<vk::CommandBuffer> {
        if let Some(cb) = self.free.pop() {
            return Ok(cb);
        }
        device.allocate_primary_command_buffer(self.command_pool).or_vk_error()
    }

    /// Resets a command buffer allocated from this pool and makes it available again.
    pub(crate) fn collect(&mut self, device: &dyn DeviceFunctions, command_buffer: vk::CommandBuffer) -> Result<()> {
        device.reset_command_buffer(command_buffer).or_vk_error()?;
        self.free.push(command_buffer);
        Ok(())
    }

    /// Frees a command buffer allocated from this pool without recycling it.
    pub(crate) fn free(&self, device: &dyn DeviceFunctions, command_buffer: vk::CommandBuffer) {
        device.free_command_buffer(self.command_pool, command_buffer);
    }

    pub(crate) fn destroy(mut self, device: &dyn DeviceFunctions) {
        for cb in self.free.drain(..) {
            device.free_command_buffer(self.command_pool, cb);
        }
        device.destroy_command_pool(self.command_pool);
        debug!(
            "destroyed {:?} command pool {:?} (queue family {})",
            self.protection, self.command_pool, self.queue_family
        );
    }
}
