use crate::{
    command::{OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands},
    config::SchedulerConfig,
    device::{DeviceRef, PresentInfo},
    error::Result,
    fence::SharedExternalFence,
    garbage::GarbageCollector,
    processor::{CommandProcessor, SubmitPolicy},
    queue::{CommandQueue, PerfCounters, QueueFamily},
    serial::{QueueSerial, ResourceUse, SerialIndex},
    swapchain::SwapchainStatus,
    vk,
};
use std::{fmt, sync::Arc};
use tracing::debug;

/// Entry point of the crate: routes work to the submission thread or, if asynchronous
/// submission is disabled, directly to the command queue.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<CommandQueue>,
    processor: Option<CommandProcessor>,
}

impl Scheduler {
    /// Creates the command queue over the first `queue_count` queues of `family` and, if
    /// `ASYNC_COMMAND_QUEUE` is enabled, starts the submission thread.
    pub fn new(
        device: DeviceRef,
        config: SchedulerConfig,
        family: &QueueFamily,
        protected: bool,
        queue_count: u32,
        garbage: Arc<dyn GarbageCollector>,
    ) -> Result<Scheduler> {
        let queue = Arc::new(CommandQueue::new(
            device,
            config.clone(),
            family,
            protected,
            queue_count,
            garbage,
        )?);

        let processor = if config.is_async() {
            let processor = CommandProcessor::new(queue.clone(), config.clone());
            processor.init()?;
            Some(processor)
        } else {
            None
        };

        debug!(
            "scheduler created: async={}, async_cleanup={}",
            config.is_async(),
            config.is_async_cleanup()
        );

        Ok(Scheduler {
            config,
            queue,
            processor,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn processor(&self) -> Option<&CommandProcessor> {
        self.processor.as_ref()
    }

    pub fn is_async(&self) -> bool {
        self.processor.is_some()
    }

    /// Device loss is handled here when there is no submission thread to do it.
    fn check_sync<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_device_lost() {
                self.queue.handle_device_lost();
            }
        }
        result
    }

    /// Returns the oldest error raised on the submission thread, if any.
    pub fn check_pending_error(&self) -> Result<()> {
        match &self.processor {
            Some(processor) => processor.check_and_pop_pending_error(),
            None => Ok(()),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Serials

    /// Allocates a serial stream. Returns `None` if all streams are in use.
    pub fn allocate_queue_serial_index(&self) -> Option<SerialIndex> {
        self.queue.serial_index_allocator().allocate()
    }

    pub fn generate_queue_serial(&self, index: SerialIndex) -> QueueSerial {
        self.queue.serial_index_allocator().generate(index)
    }

    pub fn release_queue_serial_index(&self, index: SerialIndex) {
        self.queue.serial_index_allocator().release(index)
    }

    pub fn has_resource_use_submitted(&self, use_: &ResourceUse) -> bool {
        self.queue.has_resource_use_submitted(use_)
    }

    pub fn has_resource_use_finished(&self, use_: &ResourceUse) -> bool {
        self.queue.has_resource_use_finished(use_)
    }

    /// Whether there is work that was enqueued or submitted but hasn't completed.
    pub fn is_busy(&self) -> bool {
        self.queue.is_busy() || self.processor.as_ref().is_some_and(|p| p.pending_task_count() > 0)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Submission

    /// Submits the commands accumulated for (`protection`, `priority`) as `queue_serial`.
    pub fn submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        match &self.processor {
            Some(processor) => {
                processor.enqueue_submit_commands(protection, priority, signal_semaphore, external_fence, queue_serial)?
            }
            None => self.check_sync(self.queue.submit_commands(
                protection,
                priority,
                signal_semaphore,
                external_fence,
                queue_serial,
            ))?,
        }
        self.check_sync(self.queue.post_submit_check())
    }

    /// Submits a command buffer recorded by the caller as `queue_serial`.
    pub fn submit_one_off_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        policy: SubmitPolicy,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        match &self.processor {
            Some(processor) => processor.enqueue_submit_one_off_commands(
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                policy,
                queue_serial,
            )?,
            None => self.check_sync(self.queue.queue_submit_one_off(
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                queue_serial,
            ))?,
        }
        self.check_sync(self.queue.post_submit_check())
    }

    /// Presents a swapchain image.
    ///
    /// With asynchronous submission, this returns `SUCCESS` immediately and the actual result
    /// is available from `status` once the present has been issued. An error raised earlier on
    /// the submission thread is returned instead, and nothing is presented.
    pub fn queue_present(&self, priority: Priority, present_info: PresentInfo, status: &Arc<SwapchainStatus>) -> vk::Result {
        match &self.processor {
            Some(processor) => match processor.enqueue_present(priority, present_info, status.clone()) {
                Ok(()) => vk::Result::SUCCESS,
                Err(err) => err.vk_result().unwrap_or(vk::Result::ERROR_UNKNOWN),
            },
            None => {
                status.mark_pending();
                let result = self.queue.queue_present(priority, &present_info, status);
                status.clear_pending();
                if result == vk::Result::ERROR_DEVICE_LOST {
                    self.queue.handle_device_lost();
                }
                result
            }
        }
    }

    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_semaphore_stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> Result<()> {
        match &self.processor {
            Some(processor) => {
                processor.enqueue_flush_wait_semaphores(protection, priority, wait_semaphores, wait_semaphore_stage_masks)
            }
            None => {
                self.queue
                    .flush_wait_semaphores(protection, priority, &wait_semaphores, &wait_semaphore_stage_masks);
                Ok(())
            }
        }
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<()> {
        match &self.processor {
            Some(processor) => processor.enqueue_flush_outside_render_pass_commands(protection, priority, commands),
            None => self.check_sync(
                self.queue
                    .flush_outside_render_pass_commands(protection, priority, commands),
            ),
        }
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<()> {
        match &self.processor {
            Some(processor) => {
                processor.enqueue_flush_render_pass_commands(protection, priority, commands, framebuffer_override)
            }
            None => self.check_sync(self.queue.flush_render_pass_commands(
                protection,
                priority,
                commands,
                framebuffer_override,
            )),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Synchronization

    fn ensure_submitted(&self, use_: &ResourceUse) -> Result<()> {
        match &self.processor {
            Some(processor) => processor.wait_for_resource_use_to_be_submitted(use_),
            None => Ok(()),
        }
    }

    /// Blocks until every serial of `use_` has completed on the GPU.
    pub fn finish_resource_use(&self, use_: &ResourceUse) -> Result<()> {
        self.ensure_submitted(use_)?;
        self.check_sync(
            self.queue
                .finish_resource_use(use_, self.config.max_fence_wait_time_ns()),
        )
    }

    pub fn finish_queue_serial(&self, queue_serial: QueueSerial) -> Result<()> {
        self.finish_resource_use(&ResourceUse::from(queue_serial))
    }

    /// Waits for `use_` with a caller-provided timeout. Returns `TIMEOUT` instead of an error if
    /// it elapses.
    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> Result<vk::Result> {
        self.ensure_submitted(use_)?;
        self.check_sync(
            self.queue
                .wait_for_resource_use_to_finish_with_user_timeout(use_, timeout_ns),
        )
    }

    pub fn wait_for_present_to_be_submitted(&self, status: &SwapchainStatus) -> Result<()> {
        match &self.processor {
            Some(processor) => processor.wait_for_present_to_be_submitted(status),
            None => Ok(()),
        }
    }

    /// Blocks until everything enqueued so far has completed.
    pub fn wait_idle(&self) -> Result<()> {
        if let Some(processor) = &self.processor {
            processor.wait_for_all_work_to_be_submitted()?;
        }
        self.check_sync(self.queue.wait_idle(self.config.max_fence_wait_time_ns()))
    }

    /// Retires completed batches without blocking.
    pub fn check_completed_commands(&self) -> Result<()> {
        self.check_pending_error()?;
        self.check_sync(self.queue.check_and_cleanup_completed_commands())
    }

    pub fn perf_counters(&self) -> PerfCounters {
        self.queue.perf_counters()
    }

    pub fn reset_per_frame_perf_counters(&self) {
        self.queue.reset_per_frame_perf_counters()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(processor) = self.processor.take() {
            processor.destroy();
        }
        self.queue.destroy();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("processor", &self.processor)
            .finish()
    }
}
