use ash::vk;

use crate::driver::Driver;

///Priority a submission stream asks for. Mapped to a hardware queue by the [DeviceQueueMap].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub const COUNT: usize = 3;
    pub const ALL: [Priority; Self::COUNT] = [Priority::Low, Priority::Medium, Priority::High];

    pub fn as_index(self) -> usize {
        self as usize
    }

    ///Priority handed to `VkDeviceQueueCreateInfo` for the queue that serves `self`.
    pub fn queue_priority(self) -> f32 {
        match self {
            Priority::Low => 0.0,
            Priority::Medium => 0.4,
            Priority::High => 1.0,
        }
    }

    ///Offset of the queue that serves `self`, relative to the first queue of the map. Medium always exists, so it
    /// comes first.
    fn queue_offset(self) -> u32 {
        match self {
            Priority::Medium => 0,
            Priority::High => 1,
            Priority::Low => 2,
        }
    }
}

///Whether work may touch protected memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtectionType {
    Unprotected,
    Protected,
}

impl ProtectionType {
    pub const COUNT: usize = 2;
    pub const ALL: [ProtectionType; Self::COUNT] =
        [ProtectionType::Unprotected, ProtectionType::Protected];

    pub fn as_index(self) -> usize {
        self as usize
    }

    pub fn is_protected(self) -> bool {
        self == ProtectionType::Protected
    }
}

///Abstract queue family that collects the family's index and its properties.
#[derive(Clone, Copy, Debug)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
}

impl QueueFamily {
    ///Queue priorities of a map with all three queues, in the order the queues are fetched (Medium, High, Low).
    pub const QUEUE_PRIORITIES: [f32; Priority::COUNT] = [0.4, 1.0, 0.0];

    pub fn new(index: u32, properties: vk::QueueFamilyProperties) -> Self {
        QueueFamily { index, properties }
    }

    pub fn queue_count(&self) -> u32 {
        self.properties.queue_count
    }

    pub fn supports_protected(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::PROTECTED)
    }

    ///Finds the first family that has all `include` flags and none of the `exclude` flags. Families that also have all
    /// `optional` flags are preferred. Returns `None` if no family matches.
    pub fn find_index(
        properties: &[vk::QueueFamilyProperties],
        include: vk::QueueFlags,
        optional: vk::QueueFlags,
        exclude: vk::QueueFlags,
    ) -> Option<u32> {
        let find = |preferred: vk::QueueFlags| {
            properties.iter().position(|p| {
                (p.queue_flags & exclude).is_empty() && p.queue_flags.contains(preferred)
            })
        };

        find(include | optional)
            .or_else(|| find(include))
            .map(|index| index as u32)
    }

    ///Queue priorities to request at device creation if `queue_count` queues of this family are used.
    pub fn queue_priorities(queue_count: u32) -> &'static [f32] {
        let count = (queue_count as usize).clamp(1, Priority::COUNT);
        &Self::QUEUE_PRIORITIES[..count]
    }
}

///A hardware queue serving a priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueAndIndex {
    ///Priority the hardware queue was created for. Differs from the requested one if queues are aliased.
    pub device_priority: Priority,
    pub queue: vk::Queue,
    pub index: u32,
}

impl Default for QueueAndIndex {
    fn default() -> Self {
        QueueAndIndex {
            device_priority: Priority::Medium,
            queue: vk::Queue::null(),
            index: 0,
        }
    }
}

///Maps every [Priority] to a hardware queue.
///
/// If fewer than three queues are available, the missing priorities alias the Medium queue.
#[derive(Clone, Debug, Default)]
pub struct DeviceQueueMap {
    family_index: u32,
    protected: bool,
    queues: [QueueAndIndex; Priority::COUNT],
}

impl DeviceQueueMap {
    ///Fetches `queue_count` queues of `family`, starting at `queue_index`.
    pub fn initialize(
        driver: &dyn Driver,
        family: &QueueFamily,
        protected: bool,
        queue_index: u32,
        queue_count: u32,
    ) -> Self {
        debug_assert!(queue_count > 0);
        debug_assert!(queue_index + queue_count <= family.queue_count());

        let mut map = DeviceQueueMap {
            family_index: family.index,
            protected,
            queues: Default::default(),
        };

        let fetch = |priority: Priority| {
            let index = queue_index + priority.queue_offset();
            QueueAndIndex {
                device_priority: priority,
                queue: driver.get_device_queue(family.index, index, protected),
                index,
            }
        };

        let medium = fetch(Priority::Medium);
        map.queues[Priority::Medium.as_index()] = medium;
        map.queues[Priority::High.as_index()] = if queue_count > 1 {
            fetch(Priority::High)
        } else {
            medium
        };
        map.queues[Priority::Low.as_index()] = if queue_count > 2 {
            fetch(Priority::Low)
        } else {
            medium
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "Initialized queue map for family {} (protected: {}) with {} queue(s)",
            family.index,
            protected,
            queue_count
        );

        map
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn get_queue(&self, priority: Priority) -> vk::Queue {
        self.queues[priority.as_index()].queue
    }

    ///Priority of the hardware queue that actually serves `priority`.
    pub fn get_device_priority(&self, priority: Priority) -> Priority {
        self.queues[priority.as_index()].device_priority
    }

    pub fn get_device_queue_index(&self, priority: Priority) -> u32 {
        self.queues[priority.as_index()].index
    }

    ///Waits until every distinct hardware queue is idle. Errors are ignored, this is used on teardown and device loss
    /// where nothing can be done about them anyways.
    pub fn wait_all_queues_idle(&self, driver: &dyn Driver) {
        let mut waited: smallvec::SmallVec<[vk::Queue; Priority::COUNT]> = smallvec::SmallVec::new();
        for q in self.queues.iter() {
            if q.queue == vk::Queue::null() || waited.contains(&q.queue) {
                continue;
            }
            waited.push(q.queue);
            if let Err(_e) = driver.queue_wait_idle(q.queue) {
                #[cfg(feature = "logging")]
                log::warn!("Waiting for queue {:?} to idle failed: {}", q.queue, _e);
            }
        }
    }

    pub fn destroy(&self, driver: &dyn Driver) {
        self.wait_all_queues_idle(driver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DriverCall, MockDriver};

    fn props(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn find_index_prefers_optional_flags() {
        let families = [
            props(vk::QueueFlags::TRANSFER, 1),
            props(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            props(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::PROTECTED,
                2,
            ),
        ];

        assert_eq!(
            QueueFamily::find_index(
                &families,
                vk::QueueFlags::GRAPHICS,
                vk::QueueFlags::PROTECTED,
                vk::QueueFlags::empty()
            ),
            Some(2)
        );
        //fallback without optional flags
        assert_eq!(
            QueueFamily::find_index(
                &families,
                vk::QueueFlags::COMPUTE,
                vk::QueueFlags::VIDEO_DECODE_KHR,
                vk::QueueFlags::empty()
            ),
            Some(1)
        );
        assert_eq!(
            QueueFamily::find_index(
                &families,
                vk::QueueFlags::GRAPHICS,
                vk::QueueFlags::empty(),
                vk::QueueFlags::PROTECTED
            ),
            Some(1)
        );
        assert_eq!(
            QueueFamily::find_index(
                &families,
                vk::QueueFlags::SPARSE_BINDING,
                vk::QueueFlags::empty(),
                vk::QueueFlags::empty()
            ),
            None
        );
    }

    #[test]
    fn priorities_alias_medium() {
        let driver = MockDriver::new();
        let family = QueueFamily::new(0, props(vk::QueueFlags::GRAPHICS, 1));
        let map = DeviceQueueMap::initialize(&driver, &family, false, 0, 1);

        let medium = map.get_queue(Priority::Medium);
        assert_eq!(map.get_queue(Priority::High), medium);
        assert_eq!(map.get_queue(Priority::Low), medium);
        assert_eq!(map.get_device_priority(Priority::Low), Priority::Medium);

        map.wait_all_queues_idle(&driver);
        assert_eq!(
            driver
                .calls()
                .iter()
                .filter(|c| matches!(c, DriverCall::WaitIdle { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn three_queues_are_distinct() {
        let driver = MockDriver::new();
        let family = QueueFamily::new(1, props(vk::QueueFlags::GRAPHICS, 4));
        let map = DeviceQueueMap::initialize(&driver, &family, false, 1, 3);

        assert_ne!(map.get_queue(Priority::High), map.get_queue(Priority::Medium));
        assert_ne!(map.get_queue(Priority::Low), map.get_queue(Priority::Medium));
        assert_eq!(map.get_device_queue_index(Priority::Medium), 1);
        assert_eq!(map.get_device_queue_index(Priority::High), 2);
        assert_eq!(map.get_device_queue_index(Priority::Low), 3);
        assert_eq!(QueueFamily::queue_priorities(3), &[0.4, 1.0, 0.0]);
        assert_eq!(QueueFamily::queue_priorities(8).len(), 3);
    }
}
