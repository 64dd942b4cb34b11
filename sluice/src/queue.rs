//! Native queue submission and completion tracking.
mod map;
mod ring;

pub use map::{DeviceQueueMap, QueueAndIndex, QueueFamily};
pub use ring::FixedQueue;

use crate::{
    batch::CommandBatch,
    command::{OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands},
    command_pool::CommandPoolAccess,
    config::SchedulerConfig,
    device::{DeviceRef, PresentInfo, Submission},
    error::{check, Error, Result, VkResultExt},
    fence::{FenceRecycler, SharedExternalFence},
    garbage::GarbageCollector,
    serial::{AtomicSerials, QueueSerial, QueueSerialIndexAllocator, ResourceUse, Serial, SerialIndex},
    swapchain::SwapchainStatus,
    vk,
};
use parking_lot::Mutex;
use std::{
    fmt, slice,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};
use tracing::{debug, trace, trace_span, warn};

/// Submission statistics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PerfCounters {
    /// Calls to `submit_commands`.
    pub command_queue_submit_calls_total: u64,
    pub command_queue_submit_calls_per_frame: u64,
    /// Wait semaphores consumed by `submit_commands`.
    pub command_queue_wait_semaphores_total: u64,
    /// Native submissions (empty submissions are skipped).
    pub vk_queue_submit_calls_total: u64,
    pub vk_queue_submit_calls_per_frame: u64,
}

type CleanupRequester = Box<dyn Fn() + Send + Sync>;

/// Submits command batches to the native queues and tracks their completion.
///
/// Batches go through two bounded rings: `in_flight` (submitted, fence not observed signaled)
/// then `finished` (signaled, resources not yet released). Each has its own lock, plus one for
/// submissions that also guards the performance counters. Locks are always taken in the order
/// submit, then in-flight, then finished.
pub struct CommandQueue {
    device: DeviceRef,
    config: SchedulerConfig,
    queue_map: DeviceQueueMap,
    pool_access: Arc<CommandPoolAccess>,
    fence_recycler: Arc<FenceRecycler>,
    garbage: Arc<dyn GarbageCollector>,
    serial_indices: QueueSerialIndexAllocator,

    submit: Mutex<PerfCounters>,
    in_flight: Mutex<FixedQueue<CommandBatch>>,
    finished: Mutex<FixedQueue<CommandBatch>>,
    /// Batches in either ring.
    num_all_commands: AtomicUsize,

    last_submitted: AtomicSerials,
    last_completed: AtomicSerials,
    device_lost: AtomicBool,
    cleanup_requester: OnceLock<CleanupRequester>,
}

impl CommandQueue {
    /// Creates the queue map and the command pools.
    ///
    /// `queue_count` queues, starting at index 0 of `family`, are used for the three
    /// priorities. A protected command pool is created if `protected` is set.
    pub fn new(
        device: DeviceRef,
        config: SchedulerConfig,
        family: &QueueFamily,
        protected: bool,
        queue_count: u32,
        garbage: Arc<dyn GarbageCollector>,
    ) -> Result<CommandQueue> {
        config.validate()?;

        let queue_map = DeviceQueueMap::new(&*device, family, protected, 0, queue_count);
        let pool_access = Arc::new(CommandPoolAccess::new(device.clone()));
        pool_access.init_command_pool(ProtectionType::Unprotected, queue_map.family_index())?;
        if queue_map.is_protected() {
            pool_access.init_command_pool(ProtectionType::Protected, queue_map.family_index())?;
        }

        Ok(CommandQueue {
            fence_recycler: Arc::new(FenceRecycler::new(device.clone())),
            in_flight: Mutex::new(FixedQueue::new(config.in_flight_commands_limit)),
            finished: Mutex::new(FixedQueue::new(config.finished_commands_limit)),
            device,
            config,
            queue_map,
            pool_access,
            garbage,
            serial_indices: QueueSerialIndexAllocator::new(),
            submit: Mutex::new(PerfCounters::default()),
            num_all_commands: AtomicUsize::new(0),
            last_submitted: AtomicSerials::new(),
            last_completed: AtomicSerials::new(),
            device_lost: AtomicBool::new(false),
            cleanup_requester: OnceLock::new(),
        })
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue_map(&self) -> &DeviceQueueMap {
        &self.queue_map
    }

    pub fn pool_access(&self) -> &Arc<CommandPoolAccess> {
        &self.pool_access
    }

    pub fn serial_index_allocator(&self) -> &QueueSerialIndexAllocator {
        &self.serial_indices
    }

    pub fn queue(&self, priority: Priority) -> vk::Queue {
        self.queue_map.queue(priority)
    }

    /// Routes finished-command release and garbage cleanup to another thread when
    /// asynchronous cleanup is enabled. Can only be set once.
    pub(crate) fn set_cleanup_requester(&self, requester: impl Fn() + Send + Sync + 'static) {
        if self.cleanup_requester.set(Box::new(requester)).is_err() {
            warn!("cleanup requester already set");
        }
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    #[track_caller]
    fn check_device_not_lost(&self) -> Result<()> {
        if self.is_device_lost() {
            Err(Error::vulkan(vk::Result::ERROR_DEVICE_LOST))
        } else {
            Ok(())
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Serials

    pub fn last_submitted_serial(&self, index: SerialIndex) -> Serial {
        self.last_submitted.get(index)
    }

    pub fn last_completed_serial(&self, index: SerialIndex) -> Serial {
        self.last_completed.get(index)
    }

    pub fn last_completed_serials(&self) -> &AtomicSerials {
        &self.last_completed
    }

    pub fn has_resource_use_submitted(&self, use_: &ResourceUse) -> bool {
        use_.is_reached_by(&self.last_submitted)
    }

    pub fn has_resource_use_finished(&self, use_: &ResourceUse) -> bool {
        use_.is_reached_by(&self.last_completed)
    }

    pub fn has_queue_serial_finished(&self, queue_serial: QueueSerial) -> bool {
        queue_serial.serial <= self.last_completed.get(queue_serial.index)
    }

    /// Returns whether some submitted work hasn't completed yet. Doesn't take any lock.
    pub fn is_busy(&self) -> bool {
        let max_index = self.serial_indices.largest_index_ever_allocated();
        (0..=max_index).any(|i| self.last_submitted.get(i) > self.last_completed.get(i))
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Recording state

    pub fn flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        wait_semaphores: &[vk::Semaphore],
        wait_semaphore_stage_masks: &[vk::PipelineStageFlags],
    ) {
        self.pool_access
            .flush_wait_semaphores(protection, priority, wait_semaphores, wait_semaphore_stage_masks)
    }

    pub fn flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<()> {
        self.pool_access
            .flush_outside_render_pass_commands(protection, priority, commands)
    }

    pub fn flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<()> {
        self.pool_access
            .flush_render_pass_commands(protection, priority, commands, framebuffer_override)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Submission

    /// Submits the commands accumulated for (`protection`, `priority`) as the work of
    /// `queue_serial`.
    ///
    /// If `external_fence` is given, it is signaled on completion instead of an internal fence,
    /// and exported once the submission is in flight.
    pub fn submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        let _span = trace_span!("submit_commands", serial = %queue_serial.serial, index = queue_serial.index).entered();
        let mut perf = self.submit.lock();
        self.check_device_not_lost()?;

        perf.command_queue_submit_calls_total += 1;
        perf.command_queue_submit_calls_per_frame += 1;

        let mut batch = CommandBatch::new();
        batch.set_queue_serial(queue_serial);
        batch.set_protection_type(protection);

        let (wait_semaphores, wait_semaphore_stage_masks) =
            self.pool_access
                .get_commands_and_wait_semaphores(protection, priority, &mut batch)?;
        perf.command_queue_wait_semaphores_total += wait_semaphores.len() as u64;

        let primary = batch.primary_commands();
        let command_buffers: &[vk::CommandBuffer] = match &primary {
            Some(cb) => slice::from_ref(cb),
            None => &[],
        };
        let signal_semaphores: &[vk::Semaphore] = match &signal_semaphore {
            Some(semaphore) => slice::from_ref(semaphore),
            None => &[],
        };

        // Don't make a submission if there is nothing to submit.
        let needs_queue_submit = primary.is_some()
            || signal_semaphore.is_some()
            || external_fence.is_some()
            || !wait_semaphores.is_empty();

        let submission = if needs_queue_submit {
            match external_fence {
                Some(fence) => batch.set_external_fence(fence),
                None => batch.init_fence(&self.device, &self.fence_recycler)?,
            }
            perf.vk_queue_submit_calls_total += 1;
            perf.vk_queue_submit_calls_per_frame += 1;
            Some(Submission {
                command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_dst_stage_masks: &wait_semaphore_stage_masks,
                signal_semaphores,
                // protected submissions are only needed when there are commands
                protected: protection.is_protected() && primary.is_some(),
            })
        } else {
            trace!("nothing to submit");
            None
        };

        self.queue_submit_locked(priority, submission.as_ref(), batch, queue_serial)
    }

    /// Submits a single command buffer recorded by the caller.
    ///
    /// The command buffer remains owned by the caller and is not recycled on completion.
    pub fn queue_submit_one_off(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        let _span = trace_span!("queue_submit_one_off", serial = %queue_serial.serial, index = queue_serial.index).entered();
        let mut perf = self.submit.lock();
        self.check_device_not_lost()?;

        let mut batch = CommandBatch::new();
        batch.set_queue_serial(queue_serial);
        batch.set_protection_type(protection);
        batch.init_fence(&self.device, &self.fence_recycler)?;

        let command_buffers: &[vk::CommandBuffer] = match &command_buffer {
            Some(cb) => slice::from_ref(cb),
            None => &[],
        };
        let (wait_semaphores, wait_dst_stage_masks): (&[vk::Semaphore], &[vk::PipelineStageFlags]) =
            match &wait_semaphore {
                Some((semaphore, stage_mask)) => (slice::from_ref(semaphore), slice::from_ref(stage_mask)),
                None => (&[], &[]),
            };
        let submission = Submission {
            command_buffers,
            wait_semaphores,
            wait_dst_stage_masks,
            signal_semaphores: &[],
            protected: protection.is_protected(),
        };

        perf.vk_queue_submit_calls_total += 1;
        perf.vk_queue_submit_calls_per_frame += 1;

        self.queue_submit_locked(priority, Some(&submission), batch, queue_serial)
    }

    /// Must be called with the submit lock held.
    fn queue_submit_locked(
        &self,
        priority: Priority,
        submission: Option<&Submission<'_>>,
        batch: CommandBatch,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        // Throttle the CPU so that the in-flight ring doesn't grow too fast.
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.is_full() {
                debug!("in-flight ring full, waiting for the oldest batch");
                self.finish_one_command_batch_locked(&mut in_flight, self.config.max_fence_wait_time_ns())?;
            }
            // new batches are only pushed below, under the submit lock
            debug_assert!(!in_flight.is_full());
        }

        // Make sure every batch can move to the finished ring without releasing anything.
        let finished_capacity = self.config.finished_commands_limit;
        debug_assert!(self.num_all_commands.load(Ordering::Acquire) <= finished_capacity);
        if self.num_all_commands.load(Ordering::Acquire) == finished_capacity {
            let mut finished = self.finished.lock();
            self.release_finished_commands_locked(&mut finished)?;
        }
        debug_assert!(self.num_all_commands.load(Ordering::Acquire) < finished_capacity);

        if let Some(submission) = submission {
            let queue = self.queue_map.queue(priority);
            let fence = batch.fence_handle();
            self.device.queue_submit(queue, submission, fence).or_vk_error()?;

            if let Some(external_fence) = batch.external_fence() {
                // sync fds have copy semantics: export only once the signal is in flight
                if let Err(err) = external_fence.export_fd() {
                    warn!("failed to export the external fence of serial {}: {err}", queue_serial.serial);
                }
            }
        }

        self.push_in_flight_batch_locked(batch);

        // Set last, so that a serial never appears submitted before its batch can be found in
        // the in-flight ring.
        self.last_submitted.set_queue_serial(queue_serial);
        Ok(())
    }

    fn push_in_flight_batch_locked(&self, batch: CommandBatch) {
        // incremented before the push so that it never underflows
        self.num_all_commands.fetch_add(1, Ordering::AcqRel);
        self.in_flight.lock().push(batch);
    }

    /// Presents a swapchain image and records the result in `status`.
    pub fn queue_present(&self, priority: Priority, present_info: &PresentInfo, status: &SwapchainStatus) -> vk::Result {
        let _span = trace_span!("queue_present").entered();
        let _submit = self.submit.lock();
        let result = if self.is_device_lost() {
            vk::Result::ERROR_DEVICE_LOST
        } else {
            self.device.queue_present(self.queue_map.queue(priority), present_info)
        };
        status.set_last_present_result(result);
        result
    }

    pub fn perf_counters(&self) -> PerfCounters {
        *self.submit.lock()
    }

    pub fn reset_per_frame_perf_counters(&self) {
        let mut perf = self.submit.lock();
        perf.command_queue_submit_calls_per_frame = 0;
        perf.vk_queue_submit_calls_per_frame = 0;
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Completion

    /// Checks whether the oldest in-flight batch has finished, without blocking. Moves it to
    /// the finished ring if so.
    fn check_one_command_batch_locked(&self, in_flight: &mut FixedQueue<CommandBatch>) -> Result<bool> {
        let batch = in_flight.front();
        if batch.has_fence() {
            let status = batch.get_fence_status();
            if status == vk::Result::NOT_READY {
                return Ok(false);
            }
            check(status)?;
        }
        self.on_command_batch_finished_locked(in_flight);
        Ok(true)
    }

    /// Waits for the oldest in-flight batch to finish and moves it to the finished ring.
    fn finish_one_command_batch_locked(&self, in_flight: &mut FixedQueue<CommandBatch>, timeout_ns: u64) -> Result<()> {
        let batch = in_flight.front();
        if batch.has_fence() {
            check(batch.wait_fence(timeout_ns))?;
        }
        self.on_command_batch_finished_locked(in_flight);
        Ok(())
    }

    fn on_command_batch_finished_locked(&self, in_flight: &mut FixedQueue<CommandBatch>) {
        let batch = in_flight.pop();
        trace!("batch {} on stream {} finished", batch.queue_serial().serial, batch.queue_serial().index);
        self.last_completed.set_queue_serial(batch.queue_serial());
        // cannot overflow: queue_submit_locked always leaves room in the finished ring
        self.finished.lock().push(batch);
    }

    fn check_completed_commands_locked(&self, in_flight: &mut FixedQueue<CommandBatch>) -> Result<()> {
        while !in_flight.is_empty() {
            if !self.check_one_command_batch_locked(in_flight)? {
                break;
            }
        }
        Ok(())
    }

    fn release_finished_commands_locked(&self, finished: &mut FixedQueue<CommandBatch>) -> Result<()> {
        let _span = trace_span!("release_finished_commands").entered();
        while !finished.is_empty() {
            let batch = finished.front_mut();
            debug_assert!(self.has_queue_serial_finished(batch.queue_serial()));
            batch.release()?;
            finished.pop();
            // decremented after the pop so that a push never goes over the limit
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Moves every in-flight batch whose fence is signaled to the finished ring.
    pub fn check_completed_commands(&self) -> Result<()> {
        let mut in_flight = self.in_flight.lock();
        self.check_completed_commands_locked(&mut in_flight)
    }

    /// Releases every batch in the finished ring.
    pub fn release_finished_commands(&self) -> Result<()> {
        let mut finished = self.finished.lock();
        self.release_finished_commands_locked(&mut finished)
    }

    pub fn has_finished_commands(&self) -> bool {
        !self.finished.lock().is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Runs the garbage collector against the completed serials.
    pub fn cleanup_garbage(&self) -> bool {
        self.garbage.cleanup_garbage(&self.last_completed)
    }

    /// Releases finished batches and garbage, on the worker thread if asynchronous cleanup
    /// is enabled.
    pub fn release_finished_commands_and_cleanup_garbage(&self) -> Result<()> {
        if self.config.is_async_cleanup() {
            if let Some(request) = self.cleanup_requester.get() {
                request();
                return Ok(());
            }
        }
        self.release_finished_commands()?;
        self.cleanup_garbage();
        Ok(())
    }

    pub fn check_and_cleanup_completed_commands(&self) -> Result<()> {
        self.check_completed_commands()?;
        if self.has_finished_commands() {
            self.release_finished_commands_and_cleanup_garbage()?;
        }
        Ok(())
    }

    /// Blocks until every serial of `use_` has completed.
    ///
    /// The lock on the in-flight ring is released while waiting on a fence, so other threads
    /// can keep checking for completion.
    pub fn finish_resource_use(&self, use_: &ResourceUse, timeout_ns: u64) -> Result<()> {
        let _span = trace_span!("finish_resource_use").entered();
        {
            let mut in_flight = self.in_flight.lock();
            while !in_flight.is_empty() && !self.has_resource_use_finished(use_) {
                if !self.check_one_command_batch_locked(&mut in_flight)? {
                    check(CommandBatch::wait_fence_unlocked(&mut in_flight, |q| q.front(), timeout_ns))?;
                }
            }
            // the following batches may have finished as well
            self.check_completed_commands_locked(&mut in_flight)?;
        }
        debug_assert!(self.has_resource_use_finished(use_));

        if self.has_finished_commands() {
            self.release_finished_commands_and_cleanup_garbage()?;
        }
        Ok(())
    }

    pub fn finish_queue_serial(&self, queue_serial: QueueSerial, timeout_ns: u64) -> Result<()> {
        self.finish_resource_use(&ResourceUse::from(queue_serial), timeout_ns)
    }

    /// Blocks until everything submitted so far has completed.
    pub fn wait_idle(&self, timeout_ns: u64) -> Result<()> {
        let use_ = {
            let _submit = self.submit.lock();
            let in_flight = self.in_flight.lock();
            if in_flight.is_empty() {
                return Ok(());
            }
            ResourceUse::from(in_flight.back().queue_serial())
        };
        self.finish_resource_use(&use_, timeout_ns)
    }

    /// Like `finish_resource_use`, but a timeout isn't an error: returns `SUCCESS`, `TIMEOUT`,
    /// or `NOT_READY` if the wait stopped early.
    ///
    /// Waiting on work that hasn't been submitted yet is a caller bug: it is reported as a
    /// timeout.
    pub fn wait_for_resource_use_to_finish_with_user_timeout(
        &self,
        use_: &ResourceUse,
        timeout_ns: u64,
    ) -> Result<vk::Result> {
        if !self.has_resource_use_submitted(use_) {
            warn!("waiting on an unsubmitted serial");
            return Ok(vk::Result::TIMEOUT);
        }

        let mut result;
        let finished_count = {
            let mut in_flight = self.in_flight.lock();
            result = self.finished_status(use_);
            while !in_flight.is_empty() && !self.has_resource_use_finished(use_) {
                if self.check_one_command_batch_locked(&mut in_flight)? {
                    result = self.finished_status(use_);
                } else {
                    result = CommandBatch::wait_fence_unlocked(&mut in_flight, |q| q.front(), timeout_ns);
                    if result == vk::Result::TIMEOUT {
                        break;
                    }
                    check(result)?;
                }
            }
            self.check_completed_commands_locked(&mut in_flight)?;
            self.finished.lock().len()
        };

        if finished_count > 0 {
            self.release_finished_commands_and_cleanup_garbage()?;
        }
        Ok(result)
    }

    fn finished_status(&self, use_: &ResourceUse) -> vk::Result {
        if self.has_resource_use_finished(use_) {
            vk::Result::SUCCESS
        } else {
            vk::Result::NOT_READY
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Garbage throttling

    /// Checks for completed work, then, while there is too much garbage, waits for the oldest
    /// batches to finish so that it can be freed.
    pub fn post_submit_check(&self) -> Result<()> {
        self.check_and_cleanup_completed_commands()?;

        let mut garbage_size = self.garbage.suballocation_garbage_size();
        while garbage_size > self.config.max_suballocation_garbage_size {
            // Keep at least a few batches in flight so that the GPU doesn't starve.
            if !self.cleanup_some_garbage(self.config.min_in_flight_batches_to_keep)? {
                break;
            }
            garbage_size = self.garbage.suballocation_garbage_size();
        }
        Ok(())
    }

    /// Finishes in-flight batches one by one, down to `min_in_flight_batches_to_keep`, until
    /// some garbage can be destroyed. Returns whether any was.
    pub fn cleanup_some_garbage(&self, min_in_flight_batches_to_keep: usize) -> Result<bool> {
        let mut any_garbage_cleaned = self.cleanup_garbage();
        while !any_garbage_cleaned {
            {
                let mut in_flight = self.in_flight.lock();
                if in_flight.len() <= min_in_flight_batches_to_keep {
                    break;
                }
                self.finish_one_command_batch_locked(&mut in_flight, self.config.max_fence_wait_time_ns())?;
            }
            any_garbage_cleaned = self.cleanup_garbage();
        }
        Ok(any_garbage_cleaned)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Teardown

    /// Retires every in-flight batch after a device loss.
    ///
    /// Fences are still waited on before their batch is destroyed, but a lost-device result
    /// counts as signaled. All streams are then marked complete, and further submissions fail.
    pub fn handle_device_lost(&self) {
        let _span = trace_span!("handle_device_lost").entered();
        let _submit = self.submit.lock();
        let mut in_flight = self.in_flight.lock();
        let _finished = self.finished.lock();

        if !self.device_lost.swap(true, Ordering::AcqRel) {
            warn!("device lost, retiring {} in-flight batches", in_flight.len());
        }

        while !in_flight.is_empty() {
            let batch = in_flight.front();
            if batch.has_fence() {
                let status = batch.wait_fence(self.config.max_fence_wait_time_ns());
                // a timeout here means the device can't be recovered anyway
                debug_assert!(
                    status == vk::Result::SUCCESS || status == vk::Result::ERROR_DEVICE_LOST,
                    "unexpected fence status after device loss: {status}"
                );
            }
            let mut batch = in_flight.pop();
            self.last_completed.set_queue_serial(batch.queue_serial());
            batch.destroy();
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
        }

        self.last_completed.fill(Serial::INFINITE);
    }

    /// Waits for the queues to be idle and frees everything.
    pub fn destroy(&self) {
        let _span = trace_span!("destroy_command_queue").entered();
        let _submit = self.submit.lock();
        let mut in_flight = self.in_flight.lock();
        let mut finished = self.finished.lock();

        self.queue_map.wait_idle(&*self.device);

        // Assign an infinite "last completed" serial to force the garbage to be deleted.
        self.last_completed.fill(Serial::INFINITE);

        while !in_flight.is_empty() {
            let mut batch = in_flight.pop();
            if let Err(err) = batch.release() {
                debug!("failed to release batch on destroy: {err}");
            }
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
        }
        while !finished.is_empty() {
            let mut batch = finished.pop();
            if let Err(err) = batch.release() {
                debug!("failed to release batch on destroy: {err}");
            }
            self.num_all_commands.fetch_sub(1, Ordering::AcqRel);
        }
        debug_assert_eq!(self.num_all_commands.load(Ordering::Acquire), 0);

        self.garbage.cleanup_garbage(&self.last_completed);
        self.pool_access.destroy();
        self.fence_recycler.destroy();
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("queue_map", &self.queue_map)
            .field("num_all_commands", &self.num_all_commands.load(Ordering::Relaxed))
            .field("last_submitted", &self.last_submitted)
            .field("last_completed", &self.last_completed)
            .field("device_lost", &self.is_device_lost())
            .finish_non_exhaustive()
    }
}
