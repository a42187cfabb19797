//! # Serials
//!
//! Every submission to a queue is identified by a [QueueSerial]: the index of the logical submission stream
//! (usually one per rendering context) and a [Serial] that strictly increases on that stream.
//!
//! The command queue keeps two [AtomicQueueSerialArray]s, one for the last *submitted* and one for the last *completed*
//! serial of every index. Whether some work has finished is then answered by comparing the recorded serial against the
//! array slot of its index. Serials of two different indices are never compared directly.

use std::sync::{
    Mutex,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::util::lock;

///Index of a logical submission stream.
pub type SerialIndex = usize;

///Marks a [QueueSerial] that was never assigned to a stream.
pub const INVALID_SERIAL_INDEX: SerialIndex = SerialIndex::MAX;

///Maximum number of submission streams that can exist at the same time.
pub const MAX_QUEUE_SERIAL_INDEX_COUNT: usize = 128;

///Monotonically increasing 64bit value of a single submission stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(u64);

impl Serial {
    ///The "never submitted" value. Every array slot starts at zero.
    pub const ZERO: Serial = Serial(0);
    ///Greater or equal than every serial ever generated. Assigned as the completed value
    /// when no further progress is possible (device loss, teardown).
    pub const INFINITE: Serial = Serial(u64::MAX);

    pub const fn from_raw(value: u64) -> Self {
        Serial(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn valid(&self) -> bool {
        self.0 != 0
    }
}

///Identifies one submission on one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueSerial {
    index: SerialIndex,
    serial: Serial,
}

impl Default for QueueSerial {
    fn default() -> Self {
        QueueSerial {
            index: INVALID_SERIAL_INDEX,
            serial: Serial::ZERO,
        }
    }
}

impl QueueSerial {
    ///Out of range indices are only rejected once the serial is submitted.
    pub fn new(index: SerialIndex, serial: Serial) -> Self {
        QueueSerial { index, serial }
    }

    pub fn index(&self) -> SerialIndex {
        self.index
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    ///True if the serial was assigned and the index fits into an [AtomicQueueSerialArray].
    pub fn valid(&self) -> bool {
        self.index < MAX_QUEUE_SERIAL_INDEX_COUNT && self.serial.valid()
    }
}

///Thread safe generator of strictly increasing serials. The first generated serial is 1.
#[derive(Debug)]
pub struct AtomicSerialFactory {
    next: AtomicU64,
}

impl Default for AtomicSerialFactory {
    fn default() -> Self {
        AtomicSerialFactory {
            next: AtomicU64::new(1),
        }
    }
}

impl AtomicSerialFactory {
    pub fn generate(&self) -> Serial {
        let serial = self.next.fetch_add(1, Ordering::Relaxed);
        debug_assert!(serial != u64::MAX, "serial factory overflow");
        Serial(serial)
    }

    ///Restarts the factory. Only valid once no serial of this factory is referenced anymore.
    pub fn reset(&self) {
        self.next.store(1, Ordering::Relaxed);
    }
}

///One atomic [Serial] per [SerialIndex].
///
/// Stores use release and loads acquire ordering, so whoever observes a serial also observes all writes that happened
/// before it was published.
pub struct AtomicQueueSerialArray {
    serials: [AtomicU64; MAX_QUEUE_SERIAL_INDEX_COUNT],
}

impl Default for AtomicQueueSerialArray {
    fn default() -> Self {
        AtomicQueueSerialArray {
            serials: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl std::fmt::Debug for AtomicQueueSerialArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        //Only print touched slots, 128 zeros are not helpful.
        f.debug_map()
            .entries(
                self.serials
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (i, s.load(Ordering::Relaxed)))
                    .filter(|(_, s)| *s != 0),
            )
            .finish()
    }
}

impl AtomicQueueSerialArray {
    pub fn get(&self, index: SerialIndex) -> Serial {
        Serial(self.serials[index].load(Ordering::Acquire))
    }

    pub fn set(&self, index: SerialIndex, serial: Serial) {
        self.serials[index].store(serial.0, Ordering::Release);
    }

    pub fn set_queue_serial(&self, queue_serial: &QueueSerial) {
        debug_assert!(queue_serial.valid());
        self.set(queue_serial.index(), queue_serial.serial());
    }

    ///Sets every slot to `serial`.
    pub fn fill(&self, serial: Serial) {
        for slot in self.serials.iter() {
            slot.store(serial.0, Ordering::Release);
        }
    }

    ///Returns true if `queue_serial` is less or equal to the stored value of its index. Unassigned serials are never
    /// contained.
    pub fn contains(&self, queue_serial: &QueueSerial) -> bool {
        queue_serial.valid() && queue_serial.serial() <= self.get(queue_serial.index())
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }
}

///Hands out stream indices (usually one per rendering context) and generates the serials of every index.
pub struct QueueSerialIndexAllocator {
    ///Bit `n` is set while index `n` is in use.
    used: Mutex<u128>,
    largest_index_ever_allocated: AtomicUsize,
    factories: [AtomicSerialFactory; MAX_QUEUE_SERIAL_INDEX_COUNT],
}

const _: () = assert!(MAX_QUEUE_SERIAL_INDEX_COUNT <= u128::BITS as usize);

impl Default for QueueSerialIndexAllocator {
    fn default() -> Self {
        QueueSerialIndexAllocator {
            used: Mutex::new(0),
            largest_index_ever_allocated: AtomicUsize::new(0),
            factories: std::array::from_fn(|_| AtomicSerialFactory::default()),
        }
    }
}

impl QueueSerialIndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    ///Allocates the lowest free index. Returns `None` if all [MAX_QUEUE_SERIAL_INDEX_COUNT] indices are taken.
    ///
    /// Serials of a re-used index keep increasing. This keeps old serials of that index comparable against the completed
    /// serial array.
    pub fn allocate(&self) -> Option<SerialIndex> {
        let mut used = lock(&self.used);
        let free = (!*used).trailing_zeros() as usize;
        if free >= MAX_QUEUE_SERIAL_INDEX_COUNT {
            #[cfg(feature = "logging")]
            log::warn!("All {} queue serial indices are in use", MAX_QUEUE_SERIAL_INDEX_COUNT);
            return None;
        }
        *used |= 1u128 << free;
        self.largest_index_ever_allocated
            .fetch_max(free, Ordering::AcqRel);
        Some(free)
    }

    pub fn release(&self, index: SerialIndex) {
        debug_assert!(index < MAX_QUEUE_SERIAL_INDEX_COUNT);
        let mut used = lock(&self.used);
        debug_assert!(*used & (1u128 << index) != 0, "releasing unallocated index {index}");
        *used &= !(1u128 << index);
    }

    ///Generates the next serial of `index`.
    pub fn generate(&self, index: SerialIndex) -> QueueSerial {
        QueueSerial::new(index, self.factories[index].generate())
    }

    pub fn largest_index_ever_allocated(&self) -> SerialIndex {
        self.largest_index_ever_allocated.load(Ordering::Acquire)
    }

    pub fn allocated_count(&self) -> usize {
        lock(&self.used).count_ones() as usize
    }
}
