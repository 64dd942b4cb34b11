//! Completion fences: internally recycled ones and caller-owned exportable ones.
use crate::{
    device::DeviceRef,
    error::{Result, VkResultExt},
    vk,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::debug;

/// Pool of unsignaled fences ready for reuse.
pub struct FenceRecycler {
    device: DeviceRef,
    free: Mutex<Vec<vk::Fence>>,
}

impl FenceRecycler {
    pub fn new(device: DeviceRef) -> FenceRecycler {
        FenceRecycler {
            device,
            free: Mutex::new(vec![]),
        }
    }

    /// Takes a fence from the pool and resets it.
    fn fetch(&self) -> Result<Option<vk::Fence>> {
        let mut free = self.free.lock();
        match free.pop() {
            Some(fence) => {
                if let Err(err) = self.device.reset_fence(fence).or_vk_error() {
                    self.device.destroy_fence(fence);
                    return Err(err);
                }
                Ok(Some(fence))
            }
            None => Ok(None),
        }
    }

    fn recycle(&self, fence: vk::Fence) {
        self.free.lock().push(fence);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    /// Destroys every fence in the pool.
    pub fn destroy(&self) {
        let mut free = self.free.lock();
        if !free.is_empty() {
            debug!("destroying {} recycled fences", free.len());
        }
        for fence in free.drain(..) {
            self.device.destroy_fence(fence);
        }
    }
}

impl fmt::Debug for FenceRecycler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceRecycler").field("free", &*self.free.lock()).finish()
    }
}

/// A fence that goes back to its recycler when dropped, or is destroyed if the recycler
/// has been detached.
pub struct RecyclableFence {
    device: DeviceRef,
    fence: vk::Fence,
    recycler: Mutex<Option<Arc<FenceRecycler>>>,
}

pub type SharedFence = Arc<RecyclableFence>;

impl RecyclableFence {
    /// Fetches a fence from `recycler`, or creates a new one if the recycler is empty.
    pub fn new(device: &DeviceRef, recycler: &Arc<FenceRecycler>) -> Result<RecyclableFence> {
        let fence = match recycler.fetch()? {
            Some(fence) => fence,
            None => device.create_fence(false).or_vk_error()?,
        };
        Ok(RecyclableFence {
            device: device.clone(),
            fence,
            recycler: Mutex::new(Some(recycler.clone())),
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    pub fn status(&self) -> vk::Result {
        self.device.get_fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> vk::Result {
        self.device.wait_for_fence(self.fence, timeout_ns)
    }

    /// The fence will be destroyed instead of recycled.
    pub fn detach_recycler(&self) {
        self.recycler.lock().take();
    }
}

impl Drop for RecyclableFence {
    fn drop(&mut self) {
        match self.recycler.get_mut().take() {
            Some(recycler) => recycler.recycle(self.fence),
            None => self.device.destroy_fence(self.fence),
        }
    }
}

impl fmt::Debug for RecyclableFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecyclableFence").field(&self.fence).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A caller-supplied fence that is exported as a sync fd once the submission signaling it
/// is in flight.
pub struct ExternalFence {
    device: DeviceRef,
    fence: vk::Fence,
    exported: Mutex<Option<std::result::Result<i32, vk::Result>>>,
}

pub type SharedExternalFence = Arc<ExternalFence>;

impl ExternalFence {
    pub fn new(device: &DeviceRef) -> Result<ExternalFence> {
        let fence = device.create_fence(true).or_vk_error()?;
        Ok(ExternalFence {
            device: device.clone(),
            fence,
            exported: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    pub fn status(&self) -> vk::Result {
        self.device.get_fence_status(self.fence)
    }

    pub fn wait(&self, timeout_ns: u64) -> vk::Result {
        self.device.wait_for_fence(self.fence, timeout_ns)
    }

    /// Exports the fence as a sync fd and records the outcome.
    ///
    /// Sync fds have copy semantics: the signal operation must already be queued, so this is
    /// only valid after the submission that signals the fence succeeded.
    pub fn export_fd(&self) -> Result<i32> {
        let result = self.device.export_fence_fd(self.fence);
        *self.exported.lock() = Some(result);
        result.or_vk_error()
    }

    /// The exported sync fd, if `export_fd` succeeded.
    pub fn fd(&self) -> Option<i32> {
        let exported = *self.exported.lock();
        exported.and_then(|r| r.ok())
    }

    /// Outcome of the export, or `None` if the fence wasn't exported yet.
    pub fn export_status(&self) -> Option<vk::Result> {
        let exported = *self.exported.lock();
        exported.map(|r| match r {
            Ok(_) => vk::Result::SUCCESS,
            Err(err) => err,
        })
    }
}

impl Drop for ExternalFence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

impl fmt::Debug for ExternalFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalFence")
            .field("fence", &self.fence)
            .field("exported", &*self.exported.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn recycled_fences_are_reset_and_reused() {
        let mock = Arc::new(MockDevice::new());
        let device: DeviceRef = mock.clone();
        let recycler = Arc::new(FenceRecycler::new(device.clone()));

        let first = RecyclableFence::new(&device, &recycler).unwrap();
        let handle = first.handle();
        drop(first);
        assert_eq!(recycler.len(), 1);

        let second = RecyclableFence::new(&device, &recycler).unwrap();
        assert_eq!(second.handle(), handle);
        assert!(recycler.is_empty());
        assert_eq!(mock.live_fence_count(), 1);
    }

    #[test]
    fn detached_fence_is_destroyed() {
        let mock = Arc::new(MockDevice::new());
        let device: DeviceRef = mock.clone();
        let recycler = Arc::new(FenceRecycler::new(device.clone()));

        let fence = RecyclableFence::new(&device, &recycler).unwrap();
        fence.detach_recycler();
        drop(fence);
        assert!(recycler.is_empty());
        assert_eq!(mock.live_fence_count(), 0);
    }
}
