use crate::{command::ProtectionType, vk};
use ash::prelude::VkResult;
use std::{panic::Location, sync::Arc};

/// Errors reported by the scheduler.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// A native call failed. `location` is where the call was made.
    #[error("internal Vulkan error ({result}) at {location}")]
    Vulkan {
        result: vk::Result,
        location: &'static Location<'static>,
    },
    #[error("no command pool has been initialized for {0:?} submissions")]
    CommandPoolNotInitialized(ProtectionType),
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn the submission thread")]
    WorkerThread(#[source] Arc<std::io::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a native error code, recording the caller's location.
    #[track_caller]
    pub fn vulkan(result: vk::Result) -> Error {
        debug_assert_ne!(result, vk::Result::SUCCESS);
        Error::Vulkan {
            result,
            location: Location::caller(),
        }
    }

    /// Returns the native error code, if this error came from a native call.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Error::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }

    pub fn is_device_lost(&self) -> bool {
        self.vk_result() == Some(vk::Result::ERROR_DEVICE_LOST)
    }
}

pub(crate) trait VkResultExt<T> {
    /// Converts a native result into a scheduler result, tagging failures with the call site.
    fn or_vk_error(self) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    #[track_caller]
    fn or_vk_error(self) -> Result<T> {
        let location = Location::caller();
        self.map_err(|result| Error::Vulkan { result, location })
    }
}

/// Turns a raw status code (as returned by fence queries) into a result.
#[track_caller]
pub(crate) fn check(result: vk::Result) -> Result<()> {
    if result == vk::Result::SUCCESS {
        Ok(())
    } else {
        Err(Error::vulkan(result))
    }
}
