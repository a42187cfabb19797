use std::collections::VecDeque;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use ash::vk;

use crate::{
    driver::Driver, resource_use::ResourceUse, serial::AtomicQueueSerialArray,
    sync::EventRecycler, util::lock,
};

///Object that has to outlive the GPU work referencing it.
pub enum GarbageObject {
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    ///Goes back to the event recycler if there is one.
    Event(vk::Event),
    ///Anything else. `size` is accounted in [garbage_size](GarbageCollector::garbage_size), `destroy` is called once
    /// the use finished.
    Custom {
        size: u64,
        destroy: Box<dyn FnOnce(&dyn Driver) + Send>,
    },
}

impl GarbageObject {
    pub fn custom(size: u64, destroy: impl FnOnce(&dyn Driver) + Send + 'static) -> Self {
        GarbageObject::Custom {
            size,
            destroy: Box::new(destroy),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            GarbageObject::Custom { size, .. } => *size,
            _ => 0,
        }
    }
}

impl std::fmt::Debug for GarbageObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GarbageObject::Fence(h) => write!(f, "Fence({h:?})"),
            GarbageObject::Semaphore(h) => write!(f, "Semaphore({h:?})"),
            GarbageObject::Event(h) => write!(f, "Event({h:?})"),
            GarbageObject::Custom { size, .. } => write!(f, "Custom({size} bytes)"),
        }
    }
}

///Collects objects together with the [ResourceUse] they have to outlive and destroys them once it finished.
pub trait GarbageCollector: Send + Sync {
    fn collect_garbage(&self, use_: ResourceUse, objects: Vec<GarbageObject>);
    ///Destroys all garbage whose use is contained in `completed`. Returns true if anything was destroyed.
    fn cleanup_garbage(&self, completed: &AtomicQueueSerialArray) -> bool;
    ///Bytes of pending garbage.
    fn garbage_size(&self) -> u64;
}

struct GarbageGroup {
    use_: ResourceUse,
    objects: Vec<GarbageObject>,
    size: u64,
}

///Default [GarbageCollector]. Keeps garbage in submission order.
pub struct SharedGarbageList {
    driver: Arc<dyn Driver>,
    events: Option<Arc<EventRecycler>>,
    list: Mutex<VecDeque<GarbageGroup>>,
    size: AtomicU64,
}

impl SharedGarbageList {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        SharedGarbageList {
            driver,
            events: None,
            list: Mutex::new(VecDeque::new()),
            size: AtomicU64::new(0),
        }
    }

    ///Hands finished events to `recycler` instead of destroying them.
    pub fn with_event_recycler(mut self, recycler: Arc<EventRecycler>) -> Self {
        self.events = Some(recycler);
        self
    }

    pub fn len(&self) -> usize {
        lock(&self.list).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn destroy_object(&self, object: GarbageObject) {
        match object {
            GarbageObject::Fence(f) => self.driver.destroy_fence(f),
            GarbageObject::Semaphore(s) => self.driver.destroy_semaphore(s),
            GarbageObject::Event(e) => match &self.events {
                Some(recycler) => recycler.recycle(self.driver.as_ref(), e),
                None => self.driver.destroy_event(e),
            },
            GarbageObject::Custom { destroy, .. } => destroy(self.driver.as_ref()),
        }
    }

    ///Destroys everything regardless of its use. Only valid once the device is idle.
    pub fn destroy(&self) {
        let groups = std::mem::take(&mut *lock(&self.list));
        for group in groups {
            for object in group.objects {
                self.destroy_object(object);
            }
        }
        self.size.store(0, Ordering::Release);
    }
}

impl GarbageCollector for SharedGarbageList {
    fn collect_garbage(&self, use_: ResourceUse, objects: Vec<GarbageObject>) {
        if objects.is_empty() {
            return;
        }
        let size = objects.iter().map(GarbageObject::size).sum();
        self.size.fetch_add(size, Ordering::AcqRel);
        lock(&self.list).push_back(GarbageGroup {
            use_,
            objects,
            size,
        });
    }

    fn cleanup_garbage(&self, completed: &AtomicQueueSerialArray) -> bool {
        //Take finished groups out first, destroying may call back into the driver for a while.
        let finished = {
            let mut list = lock(&self.list);
            let mut finished = Vec::new();
            let mut index = 0;
            while index < list.len() {
                if list[index].use_.is_contained_in(completed) {
                    if let Some(group) = list.remove(index) {
                        finished.push(group);
                    }
                } else {
                    index += 1;
                }
            }
            finished
        };

        let any = !finished.is_empty();
        for group in finished {
            self.size.fetch_sub(group.size, Ordering::AcqRel);
            for object in group.objects {
                self.destroy_object(object);
            }
        }

        #[cfg(feature = "logging")]
        if any {
            log::trace!("Cleaned up garbage, {} bytes pending", self.garbage_size());
        }
        any
    }

    fn garbage_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::MockDriver,
        serial::{QueueSerial, Serial},
    };
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(SharedGarbageList: Send, Sync);
        assert_impl_all!(GarbageObject: Send);
    }

    #[test]
    fn garbage_waits_for_its_use() {
        let driver = Arc::new(MockDriver::new());
        let events = Arc::new(EventRecycler::new(4));
        let garbage = SharedGarbageList::new(driver.clone()).with_event_recycler(events.clone());
        let completed = AtomicQueueSerialArray::default();
        let destroyed = Arc::new(AtomicUsize::new(0));

        let event = events.fetch_or_create(driver.as_ref()).unwrap();
        let d = destroyed.clone();
        garbage.collect_garbage(
            ResourceUse::from(QueueSerial::new(0, Serial::from_raw(2))),
            vec![
                GarbageObject::custom(1024, move |_| {
                    d.fetch_add(1, Ordering::SeqCst);
                }),
                GarbageObject::Event(event),
            ],
        );
        let d = destroyed.clone();
        garbage.collect_garbage(
            ResourceUse::from(QueueSerial::new(1, Serial::from_raw(1))),
            vec![GarbageObject::custom(512, move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            })],
        );
        assert_eq!(garbage.garbage_size(), 1536);

        completed.set_queue_serial(&QueueSerial::new(0, Serial::from_raw(1)));
        assert!(!garbage.cleanup_garbage(&completed));

        completed.set_queue_serial(&QueueSerial::new(1, Serial::from_raw(1)));
        assert!(garbage.cleanup_garbage(&completed));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(garbage.garbage_size(), 1024);

        completed.fill(Serial::INFINITE);
        assert!(garbage.cleanup_garbage(&completed));
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(events.len(), 1, "event was not recycled");
        assert!(garbage.is_empty());
    }

    #[test]
    fn destroy_ignores_uses() {
        let driver = Arc::new(MockDriver::new());
        let garbage = SharedGarbageList::new(driver.clone());
        let fence = driver.create_fence().unwrap();
        garbage.collect_garbage(
            ResourceUse::from(QueueSerial::new(0, Serial::from_raw(9))),
            vec![GarbageObject::Fence(fence)],
        );
        garbage.destroy();
        assert!(!driver.is_fence_alive(fence));
        assert_eq!(garbage.garbage_size(), 0);
    }
}
