//! Asynchronous command submission for Vulkan.
//!
//! Closed command buffers are submitted with the serial they represent. The [`Scheduler`]
//! routes submissions and presents through a dedicated thread ([`CommandProcessor`]) or
//! directly to the [`CommandQueue`], which tracks their completion with fences and recycles
//! command buffers and fences once the GPU is done with them.

pub use ash::{self, vk};

pub use batch::*;
pub use command::*;
pub use command_pool::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use fence::*;
pub use garbage::*;
pub use processor::*;
pub use queue::*;
pub use scheduler::*;
pub use serial::*;
pub use swapchain::*;

mod batch;
mod command;
mod command_allocator;
mod command_pool;
mod config;
mod device;
mod error;
mod fence;
mod garbage;
pub mod mock;
mod processor;
mod queue;
mod scheduler;
mod serial;
mod swapchain;
