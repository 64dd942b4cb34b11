#![allow(dead_code)]

use sluice::{
    ash::vk::Handle,
    mock::{FenceMode, MockDevice},
    vk, CommandQueue, DeviceRef, GarbageCollector, NoGarbage, QueueFamily, QueueSerial, SchedulerConfig,
};
use std::sync::Arc;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn mock_device(fence_mode: FenceMode) -> (Arc<MockDevice>, DeviceRef) {
    init_logging();
    let mock = Arc::new(MockDevice::with_fence_mode(fence_mode));
    let device: DeviceRef = mock.clone();
    (mock, device)
}

pub fn queue_family(queue_count: u32) -> QueueFamily {
    QueueFamily::new(
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            queue_count,
            ..Default::default()
        },
        0,
    )
}

pub fn create_queue(device: &DeviceRef, config: SchedulerConfig) -> CommandQueue {
    create_queue_with_garbage(device, config, Arc::new(NoGarbage))
}

pub fn create_queue_with_garbage(
    device: &DeviceRef,
    config: SchedulerConfig,
    garbage: Arc<dyn GarbageCollector>,
) -> CommandQueue {
    CommandQueue::new(device.clone(), config, &queue_family(3), false, 3, garbage).unwrap()
}

pub fn semaphore(raw: u64) -> vk::Semaphore {
    vk::Semaphore::from_raw(raw)
}

/// A wait semaphore identifying a one-off submission in the mock event log.
pub fn tag(raw: u64) -> Option<(vk::Semaphore, vk::PipelineStageFlags)> {
    Some((semaphore(raw), vk::PipelineStageFlags::ALL_COMMANDS))
}

/// Allocates a serial index on `queue` and returns the first `count` serials generated on it.
pub fn serials(queue: &CommandQueue, count: usize) -> Vec<QueueSerial> {
    let allocator = queue.serial_index_allocator();
    let index = allocator.allocate().unwrap();
    (0..count).map(|_| allocator.generate(index)).collect()
}
