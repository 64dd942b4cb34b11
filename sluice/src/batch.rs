use crate::{
    command::{ProtectionType, SecondaryCommandBufferCollector},
    command_pool::CommandPoolAccess,
    device::DeviceRef,
    error::Result,
    fence::{FenceRecycler, RecyclableFence, SharedExternalFence, SharedFence},
    serial::QueueSerial,
    vk,
};
use parking_lot::MutexGuard;
use std::{fmt, sync::Arc};

/// The completion fence of a batch. A batch holds at most one fence, either created
/// internally or supplied by the caller.
#[derive(Clone, Debug, Default)]
pub enum BatchFence {
    #[default]
    None,
    Internal(SharedFence),
    External(SharedExternalFence),
}

impl BatchFence {
    pub fn is_none(&self) -> bool {
        matches!(self, BatchFence::None)
    }

    fn handle(&self) -> vk::Fence {
        match self {
            BatchFence::None => vk::Fence::null(),
            BatchFence::Internal(fence) => fence.handle(),
            BatchFence::External(fence) => fence.handle(),
        }
    }

    fn status(&self) -> vk::Result {
        match self {
            BatchFence::None => panic!("querying the status of a batch without a fence"),
            BatchFence::Internal(fence) => fence.status(),
            BatchFence::External(fence) => fence.status(),
        }
    }

    fn wait(&self, timeout_ns: u64) -> vk::Result {
        match self {
            BatchFence::None => panic!("waiting on a batch without a fence"),
            BatchFence::Internal(fence) => fence.wait(timeout_ns),
            BatchFence::External(fence) => fence.wait(timeout_ns),
        }
    }
}

/// One native submission: the primary command buffer, the secondaries it executes and the
/// fence signaled on completion.
///
/// A batch is released once its fence has been observed signaled, which returns the
/// primary command buffer to the pool that allocated it.
#[derive(Default)]
pub struct CommandBatch {
    queue_serial: QueueSerial,
    protection: Option<ProtectionType>,
    primary: Option<vk::CommandBuffer>,
    pool_access: Option<Arc<CommandPoolAccess>>,
    secondaries: SecondaryCommandBufferCollector,
    fence: BatchFence,
    released: bool,
}

impl CommandBatch {
    pub fn new() -> CommandBatch {
        CommandBatch::default()
    }

    pub fn set_queue_serial(&mut self, queue_serial: QueueSerial) {
        assert!(queue_serial.is_valid());
        assert!(!self.queue_serial.is_valid(), "queue serial set twice");
        self.queue_serial = queue_serial;
    }

    pub fn set_protection_type(&mut self, protection: ProtectionType) {
        assert!(self.protection.is_none(), "protection type set twice");
        self.protection = Some(protection);
    }

    /// Sets the primary command buffer and the pool access that will recycle it. The command
    /// buffer is optional, but if present, the pool access must be too.
    pub fn set_primary_commands(
        &mut self,
        primary: Option<vk::CommandBuffer>,
        pool_access: Option<Arc<CommandPoolAccess>>,
    ) {
        assert!(
            !(primary.is_some() && pool_access.is_none()),
            "primary command buffer without a pool"
        );
        assert!(self.primary.is_none());
        assert!(self.pool_access.is_none());
        self.primary = primary;
        self.pool_access = pool_access;
    }

    pub fn set_secondary_commands(&mut self, secondaries: SecondaryCommandBufferCollector) {
        assert!(self.secondaries.is_empty());
        self.secondaries = secondaries;
    }

    /// Attaches a recycled (or new) internal fence.
    pub fn init_fence(&mut self, device: &DeviceRef, recycler: &Arc<FenceRecycler>) -> Result<()> {
        assert!(!self.has_fence(), "batch already has a fence");
        let fence = RecyclableFence::new(device, recycler)?;
        self.fence = BatchFence::Internal(Arc::new(fence));
        Ok(())
    }

    pub fn set_external_fence(&mut self, fence: SharedExternalFence) {
        assert!(!self.has_fence(), "batch already has a fence");
        self.fence = BatchFence::External(fence);
    }

    pub fn queue_serial(&self) -> QueueSerial {
        debug_assert!(self.queue_serial.is_valid());
        self.queue_serial
    }

    pub fn protection_type(&self) -> ProtectionType {
        debug_assert!(self.protection.is_some());
        self.protection.unwrap_or_default()
    }

    pub fn primary_commands(&self) -> Option<vk::CommandBuffer> {
        self.primary
    }

    pub fn secondary_commands(&self) -> &SecondaryCommandBufferCollector {
        &self.secondaries
    }

    pub fn external_fence(&self) -> Option<&SharedExternalFence> {
        match &self.fence {
            BatchFence::External(fence) => Some(fence),
            _ => None,
        }
    }

    pub fn fence(&self) -> &BatchFence {
        &self.fence
    }

    pub fn has_fence(&self) -> bool {
        !self.fence.is_none()
    }

    pub fn fence_handle(&self) -> vk::Fence {
        assert!(self.has_fence());
        self.fence.handle()
    }

    /// Returns `SUCCESS`, `NOT_READY` or an error. Panics if the batch has no fence.
    pub fn get_fence_status(&self) -> vk::Result {
        self.fence.status()
    }

    pub fn wait_fence(&self, timeout_ns: u64) -> vk::Result {
        self.fence.wait(timeout_ns)
    }

    /// Waits on the fence of the batch selected by `batch`, with `guard` unlocked for the
    /// duration of the wait.
    ///
    /// Only a copy of the fence is used while unlocked: the batch itself may be moved or
    /// destroyed by another thread in the meantime. `guard` is locked again on return.
    pub fn wait_fence_unlocked<T>(
        guard: &mut MutexGuard<'_, T>,
        batch: impl FnOnce(&T) -> &CommandBatch,
        timeout_ns: u64,
    ) -> vk::Result {
        let fence = batch(&**guard).fence.clone();
        MutexGuard::unlocked(guard, || fence.wait(timeout_ns))
    }

    /// Returns the primary command buffer to its pool and drops the fence.
    ///
    /// On failure the batch is left untouched so that the release can be retried.
    pub fn release(&mut self) -> Result<()> {
        debug_assert!(!self.released, "command batch released twice");
        if let Some(primary) = self.primary {
            if let Some(pool_access) = &self.pool_access {
                pool_access.collect_primary_command_buffer(self.protection_type(), primary)?;
            }
            self.primary = None;
        }
        self.secondaries.release_command_buffers();
        self.fence = BatchFence::None;
        self.released = true;
        Ok(())
    }

    /// Frees the primary command buffer instead of recycling it, and destroys the internal
    /// fence instead of recycling it. Used when the device can't be trusted anymore.
    pub fn destroy(&mut self) {
        debug_assert!(!self.released, "command batch destroyed after release");
        if let Some(primary) = self.primary.take() {
            if let Some(pool_access) = &self.pool_access {
                pool_access.destroy_primary_command_buffer(self.protection_type(), primary);
            }
        }
        self.secondaries.release_command_buffers();
        if let BatchFence::Internal(fence) = &self.fence {
            fence.detach_recycler();
        }
        self.fence = BatchFence::None;
        self.released = true;
    }
}

impl Drop for CommandBatch {
    fn drop(&mut self) {
        // a batch dropped before being released never made it to the GPU, or failed to release
        if !self.released {
            self.destroy();
        }
    }
}

impl fmt::Debug for CommandBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBatch")
            .field("queue_serial", &self.queue_serial)
            .field("protection", &self.protection)
            .field("primary", &self.primary)
            .field("secondaries", &self.secondaries)
            .field("fence", &self.fence)
            .field("released", &self.released)
            .finish()
    }
}
