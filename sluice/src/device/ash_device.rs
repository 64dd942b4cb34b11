//! `DeviceFunctions` over a real Vulkan device.
use super::{DeviceFunctions, PresentExtension, PresentInfo, RenderPassBegin, Submission};
use crate::vk;
use ash::{
    extensions::khr,
    prelude::VkResult,
};
use std::{ffi::c_void, fmt, ptr};

/// Wrapper around a vulkan device and the extension functions the scheduler calls.
pub struct AshDevice {
    device: ash::Device,
    vk_khr_swapchain: khr::Swapchain,
    vk_khr_external_fence_fd: khr::ExternalFenceFd,
}

impl AshDevice {
    /// Wraps an existing device.
    ///
    /// # Safety
    ///
    /// `device` must have been created from `instance` and must outlive this object.
    /// Every handle later passed to this object (queues, fences, command buffers, swapchains,
    /// semaphores, render passes) must have been created from `device`.
    /// `VK_KHR_swapchain` and `VK_KHR_external_fence_fd` must be enabled for presentation and
    /// fence export respectively.
    pub unsafe fn new(instance: &ash::Instance, device: ash::Device) -> AshDevice {
        let vk_khr_swapchain = khr::Swapchain::new(instance, &device);
        let vk_khr_external_fence_fd = khr::ExternalFenceFd::new(instance, &device);
        AshDevice {
            device,
            vk_khr_swapchain,
            vk_khr_external_fence_fd,
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AshDevice").field("handle", &self.device.handle()).finish()
    }
}

fn status_of<T>(result: VkResult<T>) -> vk::Result {
    match result {
        Ok(_) => vk::Result::SUCCESS,
        Err(err) => err,
    }
}

// SAFETY (all methods below): validity of the handles is guaranteed by the contract of `AshDevice::new`.
impl DeviceFunctions for AshDevice {
    fn create_fence(&self, exportable: bool) -> VkResult<vk::Fence> {
        let export_info = vk::ExportFenceCreateInfo {
            handle_types: vk::ExternalFenceHandleTypeFlags::SYNC_FD,
            ..Default::default()
        };
        let create_info = vk::FenceCreateInfo {
            p_next: if exportable {
                &export_info as *const _ as *const c_void
            } else {
                ptr::null()
            },
            flags: vk::FenceCreateFlags::empty(),
            ..Default::default()
        };
        unsafe { self.device.create_fence(&create_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> vk::Result {
        match unsafe { self.device.get_fence_status(fence) } {
            Ok(true) => vk::Result::SUCCESS,
            Ok(false) => vk::Result::NOT_READY,
            Err(err) => err,
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> vk::Result {
        status_of(unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) })
    }

    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<i32> {
        let get_fd_info = vk::FenceGetFdInfoKHR {
            fence,
            handle_type: vk::ExternalFenceHandleTypeFlags::SYNC_FD,
            ..Default::default()
        };
        unsafe { self.vk_khr_external_fence_fd.get_fence_fd(&get_fd_info) }
    }

    fn get_device_queue(&self, family_index: u32, queue_index: u32, protected: bool) -> vk::Queue {
        unsafe {
            if protected {
                let queue_info = vk::DeviceQueueInfo2 {
                    flags: vk::DeviceQueueCreateFlags::PROTECTED,
                    queue_family_index: family_index,
                    queue_index,
                    ..Default::default()
                };
                self.device.get_device_queue2(&queue_info)
            } else {
                self.device.get_device_queue(family_index, queue_index)
            }
        }
    }

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        debug_assert_eq!(
            submission.wait_semaphores.len(),
            submission.wait_dst_stage_masks.len()
        );
        let protected_submit_info = vk::ProtectedSubmitInfo {
            protected_submit: vk::TRUE,
            ..Default::default()
        };
        let submit_info = vk::SubmitInfo {
            p_next: if submission.protected {
                &protected_submit_info as *const _ as *const c_void
            } else {
                ptr::null()
            },
            wait_semaphore_count: submission.wait_semaphores.len() as u32,
            p_wait_semaphores: submission.wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: submission.wait_dst_stage_masks.as_ptr(),
            command_buffer_count: submission.command_buffers.len() as u32,
            p_command_buffers: submission.command_buffers.as_ptr(),
            signal_semaphore_count: submission.signal_semaphores.len() as u32,
            p_signal_semaphores: submission.signal_semaphores.as_ptr(),
            ..Default::default()
        };
        unsafe { self.device.queue_submit(queue, &[submit_info], fence) }
    }

    fn queue_present(&self, queue: vk::Queue, present_info: &PresentInfo) -> vk::Result {
        // Storage for the extension structs. Only the first extension of each kind is used.
        let rects = present_info.extensions.iter().find_map(|ext| match ext {
            PresentExtension::Regions(rects) => Some(rects),
            _ => None,
        });
        let present_fence = present_info.extensions.iter().find_map(|ext| match ext {
            PresentExtension::PresentFence(fence) => Some(*fence),
            _ => None,
        });
        let present_mode = present_info.extensions.iter().find_map(|ext| match ext {
            PresentExtension::PresentMode(mode) => Some(*mode),
            _ => None,
        });

        let present_region = rects.map(|rects| vk::PresentRegionKHR {
            rectangle_count: rects.len() as u32,
            p_rectangles: rects.as_ptr(),
        });
        let mut present_regions = present_region.as_ref().map(|region| vk::PresentRegionsKHR {
            swapchain_count: 1,
            p_regions: region,
            ..Default::default()
        });
        let mut present_fence_info = present_fence.as_ref().map(|fence| vk::SwapchainPresentFenceInfoEXT {
            swapchain_count: 1,
            p_fences: fence,
            ..Default::default()
        });
        let mut present_mode_info = present_mode.as_ref().map(|mode| vk::SwapchainPresentModeInfoEXT {
            swapchain_count: 1,
            p_present_modes: mode,
            ..Default::default()
        });

        // build the pNext chain back to front
        let mut p_next: *const c_void = ptr::null();
        if let Some(ref mut info) = present_mode_info {
            info.p_next = p_next;
            p_next = info as *const _ as *const c_void;
        }
        if let Some(ref mut info) = present_fence_info {
            info.p_next = p_next;
            p_next = info as *const _ as *const c_void;
        }
        if let Some(ref mut info) = present_regions {
            info.p_next = p_next;
            p_next = info as *const _ as *const c_void;
        }

        let wait_semaphores: &[vk::Semaphore] = match present_info.wait_semaphore {
            Some(ref semaphore) => std::slice::from_ref(semaphore),
            None => &[],
        };
        let vk_present_info = vk::PresentInfoKHR {
            p_next,
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            swapchain_count: 1,
            p_swapchains: &present_info.swapchain,
            p_image_indices: &present_info.image_index,
            p_results: ptr::null_mut(),
            ..Default::default()
        };

        match unsafe { self.vk_khr_swapchain.queue_present(queue, &vk_present_info) } {
            Ok(false) => vk::Result::SUCCESS,
            Ok(true) => vk::Result::SUBOPTIMAL_KHR,
            Err(err) => err,
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn create_command_pool(&self, family_index: u32, protected: bool) -> VkResult<vk::CommandPool> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        if protected {
            flags |= vk::CommandPoolCreateFlags::PROTECTED;
        }
        let create_info = vk::CommandPoolCreateInfo {
            flags,
            queue_family_index: family_index,
            ..Default::default()
        };
        unsafe { self.device.create_command_pool(&create_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_primary_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info)? };
        Ok(buffers[0])
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        if secondaries.is_empty() {
            return;
        }
        unsafe { self.device.cmd_execute_commands(primary, secondaries) }
    }

    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin_info: &RenderPassBegin<'_>) {
        let vk_begin_info = vk::RenderPassBeginInfo {
            render_pass: begin_info.render_pass,
            framebuffer: begin_info.framebuffer,
            render_area: begin_info.render_area,
            clear_value_count: begin_info.clear_values.len() as u32,
            p_clear_values: begin_info.clear_values.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device.cmd_begin_render_pass(
                primary,
                &vk_begin_info,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            )
        }
    }

    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(primary) }
    }
}
