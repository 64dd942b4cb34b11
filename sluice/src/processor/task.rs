use crate::{
    command::{OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands},
    device::PresentInfo,
    fence::SharedExternalFence,
    serial::QueueSerial,
    swapchain::SwapchainStatus,
    vk,
};
use std::{fmt, sync::Arc};

/// Whether an enqueued one-off submission may stay in the task queue after the call returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SubmitPolicy {
    #[default]
    AllowDeferred,
    /// The submission reaches the native queue before the call returns.
    EnsureSubmitted,
}

/// Work for the submission thread.
pub enum Task {
    /// Submits the commands accumulated for a slot.
    FlushAndQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        queue_serial: QueueSerial,
    },
    /// Submits a command buffer recorded by the caller.
    OneOffQueueSubmit {
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        queue_serial: QueueSerial,
    },
    Present {
        priority: Priority,
        present_info: PresentInfo,
        swapchain_status: Arc<SwapchainStatus>,
    },
    FlushWaitSemaphores {
        protection: ProtectionType,
        priority: Priority,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_semaphore_stage_masks: Vec<vk::PipelineStageFlags>,
    },
    FlushOutsideRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    },
    FlushRenderPassCommands {
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::FlushAndQueueSubmit { .. } => "FlushAndQueueSubmit",
            Task::OneOffQueueSubmit { .. } => "OneOffQueueSubmit",
            Task::Present { .. } => "Present",
            Task::FlushWaitSemaphores { .. } => "FlushWaitSemaphores",
            Task::FlushOutsideRenderPassCommands { .. } => "FlushOutsideRenderPassCommands",
            Task::FlushRenderPassCommands { .. } => "FlushRenderPassCommands",
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.name());
        match self {
            Task::FlushAndQueueSubmit {
                protection,
                priority,
                queue_serial,
                ..
            }
            | Task::OneOffQueueSubmit {
                protection,
                priority,
                queue_serial,
                ..
            } => s
                .field("protection", protection)
                .field("priority", priority)
                .field("queue_serial", queue_serial),
            Task::Present {
                priority, present_info, ..
            } => s.field("priority", priority).field("swapchain", &present_info.swapchain),
            Task::FlushWaitSemaphores {
                protection,
                priority,
                wait_semaphores,
                ..
            } => s
                .field("protection", protection)
                .field("priority", priority)
                .field("wait_semaphores", wait_semaphores),
            Task::FlushOutsideRenderPassCommands {
                protection, priority, ..
            }
            | Task::FlushRenderPassCommands {
                protection, priority, ..
            } => s.field("protection", protection).field("priority", priority),
        };
        s.finish_non_exhaustive()
    }
}
