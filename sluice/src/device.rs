//! The native graphics API surface consumed by the scheduler.
mod ash_device;

pub use ash_device::AshDevice;

use crate::vk;
use ash::prelude::VkResult;
use std::{fmt, sync::Arc};

/// Shared handle to the native device functions.
pub type DeviceRef = Arc<dyn DeviceFunctions>;

/// Native calls the scheduler makes. These are the ground truth the scheduler must stay
/// consistent with: implementations must not reorder them.
///
/// Status-returning methods (`get_fence_status`, `wait_for_fence`, `queue_present`) return the
/// raw `vk::Result`, since `NOT_READY`, `TIMEOUT` and `SUBOPTIMAL_KHR` are expected outcomes.
pub trait DeviceFunctions: Send + Sync + 'static {
    /// Creates an unsignaled fence. If `exportable` is set, the fence can be exported as a sync fd.
    fn create_fence(&self, exportable: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// Returns `SUCCESS` if signaled, `NOT_READY` if not, or an error.
    fn get_fence_status(&self, fence: vk::Fence) -> vk::Result;
    /// Returns `SUCCESS` if signaled, `TIMEOUT` if the timeout elapsed, or an error.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> vk::Result;
    /// Exports a sync fd for the fence (copy semantics: the signal must already be pending).
    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<i32>;

    fn get_device_queue(&self, family_index: u32, queue_index: u32, protected: bool) -> vk::Queue;
    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()>;
    fn queue_present(&self, queue: vk::Queue, present_info: &PresentInfo) -> vk::Result;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    fn create_command_pool(&self, family_index: u32, protected: bool) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_primary_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);
    /// Begins a render pass whose contents are provided by secondary command buffers.
    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin_info: &RenderPassBegin<'_>);
    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer);
}

/// A single queue submission.
#[derive(Copy, Clone, Debug, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores to wait on, with the matching destination stage in `wait_dst_stage_masks`.
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_dst_stage_masks: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Whether this is a protected submission.
    pub protected: bool,
}

impl<'a> Submission<'a> {
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty() && self.wait_semaphores.is_empty() && self.signal_semaphores.is_empty()
    }
}

/// Optional extension records attached to a present operation.
#[derive(Clone, Debug)]
pub enum PresentExtension {
    /// Damage rectangles (`VK_KHR_incremental_present`).
    Regions(Vec<vk::RectLayerKHR>),
    /// Fence signaled when the presentation engine is done with the image (`VK_EXT_swapchain_maintenance1`).
    PresentFence(vk::Fence),
    /// Present mode to switch to (`VK_EXT_swapchain_maintenance1`).
    PresentMode(vk::PresentModeKHR),
}

/// Describes a present of one swapchain image.
#[derive(Clone, Debug)]
pub struct PresentInfo {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphore: Option<vk::Semaphore>,
    pub extensions: Vec<PresentExtension>,
}

impl PresentInfo {
    pub fn new(swapchain: vk::SwapchainKHR, image_index: u32) -> PresentInfo {
        PresentInfo {
            swapchain,
            image_index,
            wait_semaphore: None,
            extensions: vec![],
        }
    }

    /// Returns the present fence, if one was attached.
    pub fn present_fence(&self) -> Option<vk::Fence> {
        self.extensions.iter().find_map(|ext| match ext {
            PresentExtension::PresentFence(fence) => Some(*fence),
            _ => None,
        })
    }
}

/// Parameters of `cmd_begin_render_pass`.
#[derive(Copy, Clone)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

impl fmt::Debug for RenderPassBegin<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPassBegin")
            .field("render_pass", &self.render_pass)
            .field("framebuffer", &self.framebuffer)
            .field("render_area", &self.render_area)
            .field("clear_value_count", &self.clear_values.len())
            .finish()
    }
}
