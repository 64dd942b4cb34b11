use crate::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Status of the presents issued for one swapchain.
///
/// While a present is pending, no other present may be issued with the same status, and the
/// swapchain must not be destroyed.
#[derive(Debug)]
pub struct SwapchainStatus {
    is_pending: AtomicBool,
    last_present_result: Mutex<vk::Result>,
}

impl SwapchainStatus {
    pub fn new() -> SwapchainStatus {
        SwapchainStatus {
            is_pending: AtomicBool::new(false),
            last_present_result: Mutex::new(vk::Result::SUCCESS),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.is_pending.load(Ordering::Acquire)
    }

    /// Result of the last present. `SUCCESS` while a present is pending.
    pub fn last_present_result(&self) -> vk::Result {
        *self.last_present_result.lock()
    }

    /// Marks a present as pending. Panics if one already is.
    pub(crate) fn mark_pending(&self) {
        let mut result = self.last_present_result.lock();
        let was_pending = self.is_pending.swap(true, Ordering::AcqRel);
        assert!(!was_pending, "a present is already pending on this swapchain");
        *result = vk::Result::SUCCESS;
    }

    pub(crate) fn set_last_present_result(&self, result: vk::Result) {
        *self.last_present_result.lock() = result;
    }

    /// Clears the pending flag. Must come after the present result is recorded.
    pub(crate) fn clear_pending(&self) {
        debug_assert!(self.is_pending());
        self.is_pending.store(false, Ordering::Release);
    }
}

impl Default for SwapchainStatus {
    fn default() -> Self {
        SwapchainStatus::new()
    }
}
