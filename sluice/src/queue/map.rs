use crate::{command::Priority, device::DeviceFunctions, vk};
use tracing::debug;

/// Queue index, within the family, of the queue serving each priority.
const QUEUE_INDEX_MEDIUM: u32 = 0;
const QUEUE_INDEX_HIGH: u32 = 1;
const QUEUE_INDEX_LOW: u32 = 2;

/// A queue family of the physical device.
#[derive(Copy, Clone, Debug)]
pub struct QueueFamily {
    properties: vk::QueueFamilyProperties,
    index: u32,
}

impl QueueFamily {
    /// Priorities to request at device creation, by queue index within the family
    /// (medium, high, then low).
    pub const QUEUE_PRIORITIES: [f32; Priority::COUNT] = [0.4, 1.0, 0.0];

    pub fn new(properties: vk::QueueFamilyProperties, index: u32) -> QueueFamily {
        QueueFamily { properties, index }
    }

    /// Finds the `match_number`-th family (counting from 0) whose flags contain `flags`.
    ///
    /// Returns the index of that family, if any, and the total number of matching families.
    pub fn find_index(
        properties: &[vk::QueueFamilyProperties],
        flags: vk::QueueFlags,
        match_number: usize,
    ) -> (Option<u32>, usize) {
        let mut index = None;
        let mut count = 0;
        for (family_index, props) in properties.iter().enumerate() {
            if props.queue_flags.contains(flags) {
                debug_assert!(props.queue_count > 0);
                if index.is_none() && count == match_number {
                    index = Some(family_index as u32);
                }
                count += 1;
            }
        }
        (index, count)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn properties(&self) -> &vk::QueueFamilyProperties {
        &self.properties
    }

    pub fn queue_count(&self) -> u32 {
        self.properties.queue_count
    }
}

/// A native queue and the priority it really runs at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueAndIndex {
    /// Priority of the native queue. Differs from the requested one when aliased.
    pub device_priority: Priority,
    pub queue: vk::Queue,
    pub index: u32,
}

/// Native queues by priority.
///
/// With fewer than two queues in the family, `High` runs on the `Medium` queue; with fewer
/// than three, so does `Low`.
#[derive(Debug)]
pub struct DeviceQueueMap {
    family_index: u32,
    protected: bool,
    queues: [QueueAndIndex; Priority::COUNT],
}

impl DeviceQueueMap {
    pub fn new(
        device: &dyn DeviceFunctions,
        family: &QueueFamily,
        protected: bool,
        first_queue_index: u32,
        queue_count: u32,
    ) -> DeviceQueueMap {
        assert!(queue_count > 0);
        assert!(first_queue_index + queue_count <= family.queue_count());

        let family_index = family.index();
        let get = |priority: Priority, index: u32| QueueAndIndex {
            device_priority: priority,
            queue: device.get_device_queue(family_index, first_queue_index + index, protected),
            index: first_queue_index + index,
        };

        let medium = get(Priority::Medium, QUEUE_INDEX_MEDIUM);
        let high = if queue_count > 1 {
            get(Priority::High, QUEUE_INDEX_HIGH)
        } else {
            medium
        };
        let low = if queue_count > 2 {
            get(Priority::Low, QUEUE_INDEX_LOW)
        } else {
            medium
        };

        let mut queues = [medium; Priority::COUNT];
        queues[Priority::Low.index()] = low;
        queues[Priority::High.index()] = high;

        debug!(
            "queue family {}: {} queue(s), protected={}",
            family_index, queue_count, protected
        );

        DeviceQueueMap {
            family_index,
            protected,
            queues,
        }
    }

    pub fn queue(&self, priority: Priority) -> vk::Queue {
        self.queues[priority.index()].queue
    }

    pub fn queue_and_index(&self, priority: Priority) -> QueueAndIndex {
        self.queues[priority.index()]
    }

    /// The priority that submissions at `priority` actually run at.
    pub fn device_priority(&self, priority: Priority) -> Priority {
        self.queues[priority.index()].device_priority
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Waits until every queue is idle. Aliased queues are waited on once.
    pub(crate) fn wait_idle(&self, device: &dyn DeviceFunctions) {
        let mut waited: Vec<vk::Queue> = Vec::with_capacity(Priority::COUNT);
        for entry in self.queues.iter() {
            if entry.queue == vk::Queue::null() || waited.contains(&entry.queue) {
                continue;
            }
            if let Err(err) = device.queue_wait_idle(entry.queue) {
                debug!("vkQueueWaitIdle failed on {:?}: {}", entry.queue, err);
            }
            waited.push(entry.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn family(queue_count: u32) -> QueueFamily {
        QueueFamily::new(
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS,
                queue_count,
                ..Default::default()
            },
            0,
        )
    }

    #[test]
    fn single_queue_is_shared_by_all_priorities() {
        let device = MockDevice::new();
        let map = DeviceQueueMap::new(&device, &family(1), false, 0, 1);
        let medium = map.queue(Priority::Medium);
        assert_eq!(map.queue(Priority::High), medium);
        assert_eq!(map.queue(Priority::Low), medium);
        assert_eq!(map.device_priority(Priority::High), Priority::Medium);
        assert_eq!(map.device_priority(Priority::Low), Priority::Medium);
    }

    #[test]
    fn low_priority_needs_a_third_queue() {
        let device = MockDevice::new();
        let map = DeviceQueueMap::new(&device, &family(2), false, 0, 2);
        assert_eq!(map.queue(Priority::High), MockDevice::queue_handle(0, 1, false));
        assert_eq!(map.queue(Priority::Low), map.queue(Priority::Medium));

        let map = DeviceQueueMap::new(&device, &family(3), false, 0, 3);
        assert_eq!(map.queue(Priority::Low), MockDevice::queue_handle(0, 2, false));
        assert_eq!(map.queue_and_index(Priority::Low).device_priority, Priority::Low);
    }

    #[test]
    fn find_index_counts_matching_families() {
        let props = |queue_flags| vk::QueueFamilyProperties {
            queue_flags,
            queue_count: 1,
            ..Default::default()
        };
        let families = [
            props(vk::QueueFlags::TRANSFER),
            props(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            props(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(QueueFamily::find_index(&families, vk::QueueFlags::GRAPHICS, 0), (Some(1), 2));
        assert_eq!(QueueFamily::find_index(&families, vk::QueueFlags::GRAPHICS, 1), (Some(2), 2));
        assert_eq!(QueueFamily::find_index(&families, vk::QueueFlags::GRAPHICS, 2), (None, 2));
        assert_eq!(QueueFamily::find_index(&families, vk::QueueFlags::SPARSE_BINDING, 0), (None, 0));
    }
}
