//! Asynchronous submission thread.
mod task;

pub use task::{SubmitPolicy, Task};

use crate::{
    command::{OutsideRenderPassCommands, Priority, ProtectionType, RenderPassCommands},
    config::{SchedulerConfig, SchedulerFeatures},
    device::PresentInfo,
    error::{Error, Result},
    fence::SharedExternalFence,
    queue::CommandQueue,
    serial::{AtomicSerials, QueueSerial, ResourceUse},
    swapchain::SwapchainStatus,
    vk,
};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, trace_span, warn};

/// Extra time spent on each task with `SLOW_ASYNC_COMMAND_QUEUE_FOR_TESTING`.
const SLOW_TASK_DELAY: Duration = Duration::from_millis(5);

struct WorkerState {
    should_exit: bool,
}

struct Shared {
    queue: Arc<CommandQueue>,
    config: SchedulerConfig,
    /// Pushed with `enqueue` held, popped with `dequeue` held.
    tasks: ArrayQueue<Task>,
    /// Held by producers, and by the worker while deciding whether to sleep.
    enqueue: Mutex<WorkerState>,
    work_available: Condvar,
    /// Held while a task executes, so that tasks run in the order they were pushed.
    dequeue: Mutex<()>,
    need_cleanup: AtomicBool,
    errors: Mutex<VecDeque<Error>>,
    last_enqueued: AtomicSerials,
    device_lost: AtomicBool,
}

/// Runs queue submissions, presents and command flushes on a dedicated thread.
///
/// Tasks are executed in the exact order they were enqueued. Producers never block on the GPU,
/// except when the task queue is full, in which case the producer executes the oldest task
/// itself to make room.
///
/// Errors raised on the worker thread are queued and returned by the next call that checks
/// for them (most enqueue and wait methods do).
pub struct CommandProcessor {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CommandProcessor {
    /// Creates the processor. The worker thread isn't started until `init`; tasks enqueued
    /// before then only run when they are drained.
    pub fn new(queue: Arc<CommandQueue>, config: SchedulerConfig) -> CommandProcessor {
        let shared = Arc::new(Shared {
            tasks: ArrayQueue::new(config.task_queue_capacity),
            queue,
            config,
            enqueue: Mutex::new(WorkerState { should_exit: false }),
            work_available: Condvar::new(),
            dequeue: Mutex::new(()),
            need_cleanup: AtomicBool::new(false),
            errors: Mutex::new(VecDeque::new()),
            last_enqueued: AtomicSerials::new(),
            device_lost: AtomicBool::new(false),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        shared.queue.set_cleanup_requester(move || {
            if let Some(shared) = weak.upgrade() {
                shared.request_commands_and_garbage_cleanup();
            }
        });

        CommandProcessor {
            shared,
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker thread.
    pub fn init(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        assert!(worker.is_none(), "command processor already initialized");
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("sluice-submit".to_string())
            .spawn(move || shared.process_tasks())
            .map_err(|err| Error::WorkerThread(Arc::new(err)))?;
        debug!("submission thread started");
        *worker = Some(handle);
        Ok(())
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.shared.queue
    }

    /// Returns the oldest error raised on the worker thread, if any.
    pub fn check_and_pop_pending_error(&self) -> Result<()> {
        self.shared.check_and_pop_pending_error()
    }

    pub fn has_pending_error(&self) -> bool {
        !self.shared.errors.lock().is_empty()
    }

    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }

    /// Number of tasks waiting to be executed.
    pub fn pending_task_count(&self) -> usize {
        self.shared.tasks.len()
    }

    pub fn last_enqueued_serials(&self) -> &AtomicSerials {
        &self.shared.last_enqueued
    }

    pub fn has_resource_use_enqueued(&self, use_: &ResourceUse) -> bool {
        use_.is_reached_by(&self.shared.last_enqueued)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Enqueue

    pub fn enqueue_submit_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        signal_semaphore: Option<vk::Semaphore>,
        external_fence: Option<SharedExternalFence>,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        self.shared.check_and_pop_pending_error()?;
        self.shared.queue_command(Task::FlushAndQueueSubmit {
            protection,
            priority,
            signal_semaphore,
            external_fence,
            queue_serial,
        });
        self.shared.last_enqueued.set_queue_serial(queue_serial);
        Ok(())
    }

    pub fn enqueue_submit_one_off_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        command_buffer: Option<vk::CommandBuffer>,
        wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        policy: SubmitPolicy,
        queue_serial: QueueSerial,
    ) -> Result<()> {
        self.shared.check_and_pop_pending_error()?;
        self.shared.queue_command(Task::OneOffQueueSubmit {
            protection,
            priority,
            command_buffer,
            wait_semaphore,
            queue_serial,
        });
        self.shared.last_enqueued.set_queue_serial(queue_serial);

        if policy == SubmitPolicy::EnsureSubmitted {
            self.wait_for_resource_use_to_be_submitted(&ResourceUse::from(queue_serial))?;
        }
        Ok(())
    }

    /// Enqueues a present.
    ///
    /// `status` reports `SUCCESS` until the present has actually been issued. Panics if a
    /// present is already pending on `status`. Nothing is enqueued if an error is pending.
    pub fn enqueue_present(
        &self,
        priority: Priority,
        present_info: PresentInfo,
        status: Arc<SwapchainStatus>,
    ) -> Result<()> {
        self.shared.check_and_pop_pending_error()?;
        status.mark_pending();
        self.shared.queue_command(Task::Present {
            priority,
            present_info,
            swapchain_status: status,
        });
        Ok(())
    }

    pub fn enqueue_flush_wait_semaphores(
        &self,
        protection: ProtectionType,
        priority: Priority,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_semaphore_stage_masks: Vec<vk::PipelineStageFlags>,
    ) -> Result<()> {
        self.shared.check_and_pop_pending_error()?;
        self.shared.queue_command(Task::FlushWaitSemaphores {
            protection,
            priority,
            wait_semaphores,
            wait_semaphore_stage_masks,
        });
        Ok(())
    }

    pub fn enqueue_flush_outside_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: OutsideRenderPassCommands,
    ) -> Result<()> {
        self.shared.check_and_pop_pending_error()?;
        self.shared.queue_command(Task::FlushOutsideRenderPassCommands {
            protection,
            priority,
            commands,
        });
        Ok(())
    }

    pub fn enqueue_flush_render_pass_commands(
        &self,
        protection: ProtectionType,
        priority: Priority,
        commands: RenderPassCommands,
        framebuffer_override: Option<vk::Framebuffer>,
    ) -> Result<()> {
        self.shared.check_and_pop_pending_error()?;
        self.shared.queue_command(Task::FlushRenderPassCommands {
            protection,
            priority,
            commands,
            framebuffer_override,
        });
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////
    // Synchronization

    /// Executes tasks on the calling thread until `use_` has been submitted.
    ///
    /// At most the tasks present when called are executed, so that producers on other
    /// threads can't keep this going forever.
    pub fn wait_for_resource_use_to_be_submitted(&self, use_: &ResourceUse) -> Result<()> {
        let shared = &*self.shared;
        if shared.queue.has_resource_use_submitted(use_) {
            return shared.check_and_pop_pending_error();
        }

        // enqueue isn't held, other threads can keep pushing tasks
        let _dequeue = shared.dequeue.lock();
        shared.check_and_pop_pending_error()?;
        let max_task_count = shared.tasks.len();
        let mut task_count = 0;
        while task_count < max_task_count && !shared.queue.has_resource_use_submitted(use_) {
            let Some(task) = shared.tasks.pop() else { break };
            shared.run_task_inline(task)?;
            task_count += 1;
        }
        Ok(())
    }

    /// Executes tasks on the calling thread until the present pending on `status` has been
    /// issued.
    pub fn wait_for_present_to_be_submitted(&self, status: &SwapchainStatus) -> Result<()> {
        let shared = &*self.shared;
        if !status.is_pending() {
            return shared.check_and_pop_pending_error();
        }

        let _dequeue = shared.dequeue.lock();
        shared.check_and_pop_pending_error()?;
        let max_task_count = shared.tasks.len();
        let mut task_count = 0;
        while task_count < max_task_count && status.is_pending() {
            let Some(task) = shared.tasks.pop() else { break };
            shared.run_task_inline(task)?;
            task_count += 1;
        }
        debug_assert!(!status.is_pending());
        Ok(())
    }

    /// Executes every queued task on the calling thread, blocking other producers meanwhile.
    pub fn wait_for_all_work_to_be_submitted(&self) -> Result<()> {
        let _state = self.shared.enqueue.lock();
        self.shared.wait_for_all_work_to_be_submitted_locked()
    }

    /// Asks the worker to check for completed commands and release them along with garbage.
    pub fn request_commands_and_garbage_cleanup(&self) {
        self.shared.request_commands_and_garbage_cleanup();
    }

    /// Stops the worker thread after executing every queued task.
    pub fn destroy(&self) {
        let _span = trace_span!("destroy_command_processor").entered();
        {
            let mut state = self.shared.enqueue.lock();
            state.should_exit = true;
            self.shared.work_available.notify_one();
        }

        if let Err(err) = self.wait_for_all_work_to_be_submitted() {
            warn!("error while draining the task queue: {err}");
        }

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("submission thread panicked");
            }
            debug!("submission thread stopped");
        }
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            self.destroy();
        }
    }
}

impl fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("pending_tasks", &self.shared.tasks.len())
            .field("pending_errors", &self.shared.errors.lock().len())
            .field("device_lost", &self.is_device_lost())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn queue_command(&self, task: Task) {
        let _span = trace_span!("queue_command", task = task.name()).entered();
        let _state = self.enqueue.lock();
        if self.tasks.is_full() {
            let _dequeue = self.dequeue.lock();
            // the worker may have made room while we were waiting on the lock
            if self.tasks.is_full() {
                if let Some(front) = self.tasks.pop() {
                    // the new task is pushed regardless; the error is reported later
                    if let Err(err) = self.process_task(front) {
                        self.handle_error(err);
                    }
                }
            }
        }
        // only pushed with `enqueue` held, so there is room
        let pushed = self.tasks.push(task);
        assert!(pushed.is_ok(), "task queue full after draining");
        self.work_available.notify_one();
    }

    fn request_commands_and_garbage_cleanup(&self) {
        if !self.need_cleanup.swap(true, Ordering::AcqRel) {
            let _state = self.enqueue.lock();
            self.work_available.notify_one();
        }
    }

    fn check_and_pop_pending_error(&self) -> Result<()> {
        match self.errors.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn handle_error(&self, err: Error) {
        error!("{err}");
        if err.is_device_lost() {
            self.handle_device_lost();
        }
        self.errors.lock().push_back(err);
    }

    fn handle_device_lost(&self) {
        if !self.device_lost.swap(true, Ordering::AcqRel) {
            warn!("device lost, discarding further tasks");
        }
        self.queue.handle_device_lost();
    }

    /// Executes a task on a thread other than the worker.
    fn run_task_inline(&self, task: Task) -> Result<()> {
        self.process_task(task).map_err(|err| {
            if err.is_device_lost() {
                self.handle_device_lost();
            }
            err
        })
    }

    fn process_tasks(&self) {
        loop {
            let mut state = self.enqueue.lock();
            if self.tasks.is_empty() {
                if state.should_exit {
                    break;
                }
                while self.tasks.is_empty() && !state.should_exit && !self.need_cleanup.load(Ordering::Acquire) {
                    self.work_available.wait(&mut state);
                }
            }

            // execute with `enqueue` unlocked so that producers aren't blocked meanwhile
            let dequeue = self.dequeue.lock();
            drop(state);
            if let Some(task) = self.tasks.pop() {
                if self.config.features.contains(SchedulerFeatures::SLOW_ASYNC_COMMAND_QUEUE_FOR_TESTING) {
                    thread::sleep(SLOW_TASK_DELAY);
                }
                if let Err(err) = self.process_task(task) {
                    self.handle_error(err);
                }
            }
            drop(dequeue);

            if self.need_cleanup.swap(false, Ordering::AcqRel) {
                if let Err(err) = self.cleanup() {
                    self.handle_error(err);
                }
            }
        }
    }

    fn cleanup(&self) -> Result<()> {
        let _span = trace_span!("cleanup").entered();
        // check again, in case anything finished since the last submission
        self.queue.check_completed_commands()?;
        if self.config.is_async_cleanup() && self.queue.has_finished_commands() {
            self.queue.release_finished_commands()?;
        }
        self.queue.cleanup_garbage();
        Ok(())
    }

    fn process_task(&self, task: Task) -> Result<()> {
        let _span = trace_span!("process_task", task = task.name()).entered();

        if self.device_lost.load(Ordering::Acquire) {
            debug!("discarding {task:?} after device loss");
            if let Task::Present { swapchain_status, .. } = task {
                swapchain_status.set_last_present_result(vk::Result::ERROR_DEVICE_LOST);
                swapchain_status.clear_pending();
            }
            return Ok(());
        }

        match task {
            Task::FlushAndQueueSubmit {
                protection,
                priority,
                signal_semaphore,
                external_fence,
                queue_serial,
            } => {
                self.queue
                    .submit_commands(protection, priority, signal_semaphore, external_fence, queue_serial)?;
                self.need_cleanup.store(true, Ordering::Release);
            }
            Task::OneOffQueueSubmit {
                protection,
                priority,
                command_buffer,
                wait_semaphore,
                queue_serial,
            } => {
                self.queue
                    .queue_submit_one_off(protection, priority, command_buffer, wait_semaphore, queue_serial)?;
                self.need_cleanup.store(true, Ordering::Release);
            }
            Task::Present {
                priority,
                present_info,
                swapchain_status,
            } => {
                let result = self.queue.queue_present(priority, &present_info, &swapchain_status);
                // the status may be reused by another thread as soon as it isn't pending
                swapchain_status.clear_pending();
                match result {
                    // not errors, the caller sees them on the next acquire
                    vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR | vk::Result::ERROR_OUT_OF_DATE_KHR => {}
                    // reported later, the tasks behind the present still run
                    err => self.handle_error(Error::vulkan(err)),
                }
            }
            Task::FlushWaitSemaphores {
                protection,
                priority,
                wait_semaphores,
                wait_semaphore_stage_masks,
            } => {
                self.queue
                    .flush_wait_semaphores(protection, priority, &wait_semaphores, &wait_semaphore_stage_masks);
            }
            Task::FlushOutsideRenderPassCommands {
                protection,
                priority,
                commands,
            } => {
                self.queue
                    .flush_outside_render_pass_commands(protection, priority, commands)?;
            }
            Task::FlushRenderPassCommands {
                protection,
                priority,
                commands,
                framebuffer_override,
            } => {
                self.queue
                    .flush_render_pass_commands(protection, priority, commands, framebuffer_override)?;
            }
        }
        Ok(())
    }

    /// Must be called with `enqueue` held.
    fn wait_for_all_work_to_be_submitted_locked(&self) -> Result<()> {
        let _span = trace_span!("wait_for_all_work_to_be_submitted").entered();
        let _dequeue = self.dequeue.lock();
        self.check_and_pop_pending_error()?;

        while let Some(task) = self.tasks.pop() {
            self.run_task_inline(task)?;
        }

        if self.config.is_async_cleanup() {
            self.queue.release_finished_commands()?;
            self.queue.cleanup_garbage();
        }
        self.need_cleanup.store(false, Ordering::Release);
        Ok(())
    }
}
