//! In-memory device for headless use and tests.
use crate::{
    command::{SecondaryCommandBuffer, SecondaryCommandPool},
    device::{DeviceFunctions, PresentInfo, RenderPassBegin, Submission},
    vk,
};
use ash::{prelude::VkResult, vk::Handle};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// When submitted fences become signaled.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FenceMode {
    /// As soon as they are submitted.
    #[default]
    AutoSignal,
    /// Only through `signal_fence` or `signal_all`. Waits block until then, or time out.
    Manual,
    /// The first time they are waited on. Status queries report them as not ready until then.
    SignalOnWait,
}

/// A recorded queue submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MockSubmit {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_dst_stage_masks: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
    pub protected: bool,
}

/// Native calls observed by the mock device, in call order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MockEvent {
    Submit(MockSubmit),
    ExportFence {
        fence: vk::Fence,
    },
    Present {
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
    WaitIdle {
        queue: vk::Queue,
    },
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    FreeCommandBuffer(vk::CommandBuffer),
    ExecuteCommands {
        primary: vk::CommandBuffer,
        secondaries: Vec<vk::CommandBuffer>,
    },
    BeginRenderPass {
        primary: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass(vk::CommandBuffer),
}

#[derive(Copy, Clone, Debug, Default)]
struct MockFence {
    signaled: bool,
    /// Submitted and not yet signaled.
    pending: bool,
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    next_fd: i32,
    fence_mode: FenceMode,
    fences: HashMap<vk::Fence, MockFence>,
    command_pools: HashSet<vk::CommandPool>,
    /// Live command buffers and the pool they were allocated from.
    command_buffers: HashMap<vk::CommandBuffer, vk::CommandPool>,
    events: Vec<MockEvent>,
    device_lost: bool,
    submit_failures: VecDeque<vk::Result>,
    export_failures: VecDeque<vk::Result>,
    present_result: vk::Result,
}

impl MockState {
    fn next_handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }
}

/// A device that executes nothing but keeps track of fences and command buffers.
///
/// Native errors can be injected with `fail_next_submit`, `fail_next_export`,
/// `set_present_result` and `lose_device`.
#[derive(Debug)]
pub struct MockDevice {
    state: Mutex<MockState>,
    fence_signaled: Condvar,
}

impl MockDevice {
    pub fn new() -> MockDevice {
        MockDevice::with_fence_mode(FenceMode::default())
    }

    pub fn with_fence_mode(fence_mode: FenceMode) -> MockDevice {
        MockDevice {
            state: Mutex::new(MockState {
                next_handle: 0x1000,
                next_fd: 100,
                fence_mode,
                fences: HashMap::new(),
                command_pools: HashSet::new(),
                command_buffers: HashMap::new(),
                events: vec![],
                device_lost: false,
                submit_failures: VecDeque::new(),
                export_failures: VecDeque::new(),
                present_result: vk::Result::SUCCESS,
            }),
            fence_signaled: Condvar::new(),
        }
    }

    /// Handle returned by `get_device_queue`.
    pub fn queue_handle(family_index: u32, queue_index: u32, protected: bool) -> vk::Queue {
        vk::Queue::from_raw(((family_index as u64 + 1) << 8) | ((queue_index as u64) << 1) | protected as u64)
    }

    pub fn set_fence_mode(&self, fence_mode: FenceMode) {
        self.state.lock().fence_mode = fence_mode;
    }

    /// Signals a fence, waking up threads waiting on it.
    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        let f = state.fences.get_mut(&fence).expect("signaling an unknown fence");
        f.signaled = true;
        f.pending = false;
        self.fence_signaled.notify_all();
    }

    /// Signals every submitted fence. Returns how many there were.
    pub fn signal_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for fence in state.fences.values_mut().filter(|f| f.pending) {
            fence.signaled = true;
            fence.pending = false;
            count += 1;
        }
        self.fence_signaled.notify_all();
        count
    }

    /// Submitted fences that haven't been signaled yet, oldest first.
    pub fn pending_fences(&self) -> Vec<vk::Fence> {
        let state = self.state.lock();
        state
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Submit(submit) if state.fences.get(&submit.fence).is_some_and(|f| f.pending) => {
                    Some(submit.fence)
                }
                _ => None,
            })
            .collect()
    }

    /// Makes every subsequent call report `ERROR_DEVICE_LOST`.
    pub fn lose_device(&self) {
        self.state.lock().device_lost = true;
        self.fence_signaled.notify_all();
    }

    pub fn is_device_lost(&self) -> bool {
        self.state.lock().device_lost
    }

    /// The next `queue_submit` fails with `result` without submitting anything.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().submit_failures.push_back(result);
    }

    /// The next `export_fence_fd` fails with `result`.
    pub fn fail_next_export(&self, result: vk::Result) {
        self.state.lock().export_failures.push_back(result);
    }

    /// Result returned by every subsequent present.
    pub fn set_present_result(&self, result: vk::Result) {
        self.state.lock().present_result = result;
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn submits(&self) -> Vec<MockSubmit> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Submit(submit) => Some(submit.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_command_pool_count(&self) -> usize {
        self.state.lock().command_pools.len()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice::new()
    }
}

impl DeviceFunctions for MockDevice {
    fn create_fence(&self, _exportable: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.next_handle();
        state.fences.insert(fence, MockFence::default());
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let removed = self.state.lock().fences.remove(&fence);
        assert!(removed.is_some(), "destroying unknown fence {fence:?}");
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let f = state.fences.get_mut(&fence).expect("resetting an unknown fence");
        assert!(!f.pending, "resetting a fence in use by a submission");
        f.signaled = false;
        Ok(())
    }

    fn get_fence_status(&self, fence: vk::Fence) -> vk::Result {
        let state = self.state.lock();
        if state.device_lost {
            return vk::Result::ERROR_DEVICE_LOST;
        }
        match state.fences.get(&fence) {
            Some(f) if f.signaled => vk::Result::SUCCESS,
            Some(_) => vk::Result::NOT_READY,
            None => panic!("querying unknown fence {fence:?}"),
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> vk::Result {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            if state.device_lost {
                return vk::Result::ERROR_DEVICE_LOST;
            }
            let fence_mode = state.fence_mode;
            let f = state.fences.get_mut(&fence).expect("waiting on an unknown fence");
            if f.signaled {
                return vk::Result::SUCCESS;
            }
            if fence_mode == FenceMode::SignalOnWait && f.pending {
                f.signaled = true;
                f.pending = false;
                return vk::Result::SUCCESS;
            }
            match deadline {
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut state, deadline).timed_out() {
                        return if state.fences.get(&fence).is_some_and(|f| f.signaled) {
                            vk::Result::SUCCESS
                        } else {
                            vk::Result::TIMEOUT
                        };
                    }
                }
                None => self.fence_signaled.wait(&mut state),
            }
        }
    }

    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<i32> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        assert!(state.fences.contains_key(&fence), "exporting unknown fence {fence:?}");
        if let Some(result) = state.export_failures.pop_front() {
            return Err(result);
        }
        state.events.push(MockEvent::ExportFence { fence });
        state.next_fd += 1;
        Ok(state.next_fd)
    }

    fn get_device_queue(&self, family_index: u32, queue_index: u32, protected: bool) -> vk::Queue {
        MockDevice::queue_handle(family_index, queue_index, protected)
    }

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if let Some(result) = state.submit_failures.pop_front() {
            if result == vk::Result::ERROR_DEVICE_LOST {
                state.device_lost = true;
                self.fence_signaled.notify_all();
            }
            return Err(result);
        }
        for cb in submission.command_buffers {
            assert!(state.command_buffers.contains_key(cb), "submitting unknown command buffer {cb:?}");
        }

        if fence != vk::Fence::null() {
            let auto_signal = state.fence_mode == FenceMode::AutoSignal;
            let f = state.fences.get_mut(&fence).expect("submitting an unknown fence");
            assert!(!f.signaled && !f.pending, "submitting a fence that wasn't reset");
            if auto_signal {
                f.signaled = true;
            } else {
                f.pending = true;
            }
        }

        state.events.push(MockEvent::Submit(MockSubmit {
            queue,
            command_buffers: submission.command_buffers.to_vec(),
            wait_semaphores: submission.wait_semaphores.to_vec(),
            wait_dst_stage_masks: submission.wait_dst_stage_masks.to_vec(),
            signal_semaphores: submission.signal_semaphores.to_vec(),
            fence,
            protected: submission.protected,
        }));
        self.fence_signaled.notify_all();
        Ok(())
    }

    fn queue_present(&self, queue: vk::Queue, present_info: &PresentInfo) -> vk::Result {
        let mut state = self.state.lock();
        if state.device_lost {
            return vk::Result::ERROR_DEVICE_LOST;
        }
        state.events.push(MockEvent::Present {
            queue,
            swapchain: present_info.swapchain,
            image_index: present_info.image_index,
        });
        state.present_result
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.events.push(MockEvent::WaitIdle { queue });
        // the mock doesn't track which queue a fence was submitted to
        for f in state.fences.values_mut().filter(|f| f.pending) {
            f.signaled = true;
            f.pending = false;
        }
        self.fence_signaled.notify_all();
        Ok(())
    }

    fn create_command_pool(&self, _family_index: u32, _protected: bool) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.next_handle();
        state.command_pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        assert!(state.command_pools.remove(&pool), "destroying unknown command pool {pool:?}");
        state.command_buffers.retain(|_, p| *p != pool);
    }

    fn allocate_primary_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        assert!(state.command_pools.contains(&pool), "allocating from unknown command pool {pool:?}");
        let cb = state.next_handle();
        state.command_buffers.insert(cb, pool);
        Ok(cb)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        match state.command_buffers.remove(&command_buffer) {
            Some(owner) => assert_eq!(owner, pool, "command buffer freed to the wrong pool"),
            None => panic!("command buffer {command_buffer:?} freed twice"),
        }
        state.events.push(MockEvent::FreeCommandBuffer(command_buffer));
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.state.lock().events.push(MockEvent::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.state.lock().events.push(MockEvent::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.events.push(MockEvent::ResetCommandBuffer(command_buffer));
        Ok(())
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.state.lock().events.push(MockEvent::ExecuteCommands {
            primary,
            secondaries: secondaries.to_vec(),
        });
    }

    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin_info: &RenderPassBegin<'_>) {
        self.state.lock().events.push(MockEvent::BeginRenderPass {
            primary,
            render_pass: begin_info.render_pass,
            framebuffer: begin_info.framebuffer,
        });
    }

    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer) {
        self.state.lock().events.push(MockEvent::EndRenderPass(primary));
    }
}

/// Hands out secondary command buffers and records the ones returned to it.
#[derive(Debug)]
pub struct MockSecondaryPool {
    next_handle: AtomicU64,
    collected: Mutex<Vec<vk::CommandBuffer>>,
}

impl MockSecondaryPool {
    pub fn new() -> Arc<MockSecondaryPool> {
        Arc::new(MockSecondaryPool {
            next_handle: AtomicU64::new(0x10_0000),
            collected: Mutex::new(vec![]),
        })
    }

    pub fn allocate(self: &Arc<Self>) -> SecondaryCommandBuffer {
        let handle = vk::CommandBuffer::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        SecondaryCommandBuffer::new(handle, self.clone())
    }

    /// Secondary command buffers returned so far, in order.
    pub fn collected(&self) -> Vec<vk::CommandBuffer> {
        self.collected.lock().clone()
    }
}

impl SecondaryCommandPool for MockSecondaryPool {
    fn collect(&self, command_buffer: vk::CommandBuffer) {
        self.collected.lock().push(command_buffer);
    }
}
