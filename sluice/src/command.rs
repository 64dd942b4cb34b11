//! Priorities, protection domains, and recorded secondary command buffers.
use crate::{
    device::{DeviceFunctions, RenderPassBegin},
    vk,
};
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

/// Priority of the submitting context. Selects the native queue used for submissions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub const COUNT: usize = 3;
    pub const ALL: [Priority; Priority::COUNT] = [Priority::Low, Priority::Medium, Priority::High];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Protection domain of a submission. Protected and unprotected work never share a batch
/// or a command pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum ProtectionType {
    #[default]
    Unprotected,
    Protected,
}

impl ProtectionType {
    pub const COUNT: usize = 2;

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn is_protected(self) -> bool {
        self == ProtectionType::Protected
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Owner of secondary command buffers.
///
/// Secondary command buffers are returned to their pool once the batch that executed them has
/// finished on the GPU.
pub trait SecondaryCommandPool: Send + Sync {
    fn collect(&self, command_buffer: vk::CommandBuffer);
}

/// A recorded secondary command buffer, returned to its pool on drop.
pub struct SecondaryCommandBuffer {
    handle: vk::CommandBuffer,
    pool: Arc<dyn SecondaryCommandPool>,
}

impl SecondaryCommandBuffer {
    pub fn new(handle: vk::CommandBuffer, pool: Arc<dyn SecondaryCommandPool>) -> SecondaryCommandBuffer {
        SecondaryCommandBuffer { handle, pool }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }
}

impl fmt::Debug for SecondaryCommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecondaryCommandBuffer").field(&self.handle).finish()
    }
}

impl Drop for SecondaryCommandBuffer {
    fn drop(&mut self) {
        self.pool.collect(self.handle);
    }
}

/// Secondary command buffers executed by a primary command buffer.
#[derive(Debug, Default)]
pub struct SecondaryCommandBufferCollector {
    buffers: Vec<SecondaryCommandBuffer>,
}

impl SecondaryCommandBufferCollector {
    pub fn new() -> SecondaryCommandBufferCollector {
        SecondaryCommandBufferCollector::default()
    }

    pub fn collect(&mut self, command_buffer: SecondaryCommandBuffer) {
        self.buffers.push(command_buffer);
    }

    pub fn append(&mut self, other: &mut SecondaryCommandBufferCollector) {
        self.buffers.append(&mut other.buffers);
    }

    /// Returns every collected buffer to its pool.
    pub fn release_command_buffers(&mut self) {
        self.buffers.clear();
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = vk::CommandBuffer> + '_ {
        self.buffers.iter().map(|b| b.handle)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Accumulated state of one (priority, protection) slot: the primary command buffer being
/// recorded, the secondaries it executes, and the semaphores the next submission waits on.
#[derive(Debug, Default)]
pub(crate) struct CommandsState {
    pub(crate) primary: Option<vk::CommandBuffer>,
    pub(crate) secondaries: SecondaryCommandBufferCollector,
    pub(crate) wait_semaphores: SmallVec<[vk::Semaphore; 4]>,
    pub(crate) wait_semaphore_stage_masks: SmallVec<[vk::PipelineStageFlags; 4]>,
}

/// Closed secondary command buffers recorded outside of a render pass.
#[derive(Debug, Default)]
pub struct OutsideRenderPassCommands {
    pub secondaries: SecondaryCommandBufferCollector,
}

impl OutsideRenderPassCommands {
    pub fn new(secondaries: SecondaryCommandBufferCollector) -> OutsideRenderPassCommands {
        OutsideRenderPassCommands { secondaries }
    }

    /// Executes the secondaries in `state.primary`, which must be recording.
    pub(crate) fn flush_to_primary(mut self, device: &dyn DeviceFunctions, state: &mut CommandsState) {
        let Some(primary) = state.primary else {
            debug_assert!(false, "flushing into a slot without a primary command buffer");
            return;
        };
        let handles: SmallVec<[vk::CommandBuffer; 8]> = self.secondaries.handles().collect();
        device.cmd_execute_commands(primary, &handles);
        state.secondaries.append(&mut self.secondaries);
    }
}

/// Closed secondary command buffers recorded inside a render pass.
pub struct RenderPassCommands {
    pub secondaries: SecondaryCommandBufferCollector,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: Vec<vk::ClearValue>,
}

impl RenderPassCommands {
    pub fn new(
        secondaries: SecondaryCommandBufferCollector,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
    ) -> RenderPassCommands {
        RenderPassCommands {
            secondaries,
            render_pass,
            framebuffer,
            render_area,
            clear_values: vec![],
        }
    }

    /// Wraps the secondaries in a render pass on `state.primary`, which must be recording.
    ///
    /// `framebuffer_override` replaces the recorded framebuffer (e.g. when the swapchain image
    /// was only known at flush time).
    pub(crate) fn flush_to_primary(
        mut self,
        device: &dyn DeviceFunctions,
        state: &mut CommandsState,
        framebuffer_override: Option<vk::Framebuffer>,
    ) {
        let Some(primary) = state.primary else {
            debug_assert!(false, "flushing into a slot without a primary command buffer");
            return;
        };
        let begin_info = RenderPassBegin {
            render_pass: self.render_pass,
            framebuffer: framebuffer_override.unwrap_or(self.framebuffer),
            render_area: self.render_area,
            clear_values: &self.clear_values,
        };
        let handles: SmallVec<[vk::CommandBuffer; 8]> = self.secondaries.handles().collect();
        device.cmd_begin_render_pass(primary, &begin_info);
        device.cmd_execute_commands(primary, &handles);
        device.cmd_end_render_pass(primary);
        state.secondaries.append(&mut self.secondaries);
    }
}

impl fmt::Debug for RenderPassCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPassCommands")
            .field("secondaries", &self.secondaries)
            .field("render_pass", &self.render_pass)
            .field("framebuffer", &self.framebuffer)
            .field("render_area", &self.render_area)
            .finish_non_exhaustive()
    }
}
