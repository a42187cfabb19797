use smallvec::SmallVec;

use crate::serial::{AtomicQueueSerialArray, QueueSerial, Serial, SerialIndex};

///Records the highest [Serial] of every submission stream a resource was used on.
///
/// Indices the resource was never used on hold [Serial::ZERO] and are therefore trivially finished.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceUse {
    serials: SmallVec<[Serial; 4]>,
}

impl From<QueueSerial> for ResourceUse {
    fn from(queue_serial: QueueSerial) -> Self {
        let mut use_ = ResourceUse::default();
        use_.set_queue_serial(&queue_serial);
        use_
    }
}

impl ResourceUse {
    pub fn new() -> Self {
        Self::default()
    }

    ///True if at least one use was recorded.
    pub fn valid(&self) -> bool {
        !self.serials.is_empty()
    }

    pub fn reset(&mut self) {
        self.serials.clear();
    }

    pub fn serials(&self) -> &[Serial] {
        &self.serials
    }

    pub fn set_serial(&mut self, index: SerialIndex, serial: Serial) {
        debug_assert!(serial.valid());
        if self.serials.len() <= index {
            self.serials.resize(index + 1, Serial::ZERO);
        }
        self.serials[index] = serial;
    }

    pub fn set_queue_serial(&mut self, queue_serial: &QueueSerial) {
        debug_assert!(
            queue_serial.valid(),
            "recording use of unassigned queue serial"
        );
        self.set_serial(queue_serial.index(), queue_serial.serial());
    }

    ///Element wise maximum of `self` and `other`.
    pub fn merge(&mut self, other: &ResourceUse) {
        if self.serials.len() < other.serials.len() {
            self.serials.resize(other.serials.len(), Serial::ZERO);
        }
        for (mine, theirs) in self.serials.iter_mut().zip(other.serials.iter()) {
            *mine = (*mine).max(*theirs);
        }
    }

    ///True if every recorded serial is less or equal to the value of its index in `serials`. Serials recorded on an
    /// index `serials` has no slot for are never contained.
    pub fn is_contained_in(&self, serials: &AtomicQueueSerialArray) -> bool {
        self.serials.iter().enumerate().all(|(index, serial)| {
            !serial.valid() || (index < serials.len() && *serial <= serials.get(index))
        })
    }

    ///True if this use recorded something newer than `queue_serial` on the same index.
    pub fn is_newer_than(&self, queue_serial: &QueueSerial) -> bool {
        self.serials
            .get(queue_serial.index())
            .map(|s| *s > queue_serial.serial())
            .unwrap_or(false)
    }

    ///True if `command_buffer_serial` is exactly the recorded serial of its index.
    pub fn used_by_command_buffer(&self, command_buffer_serial: &QueueSerial) -> bool {
        command_buffer_serial.valid()
            && self.serials.get(command_buffer_serial.index()) == Some(&command_buffer_serial.serial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qs(index: SerialIndex, serial: u64) -> QueueSerial {
        QueueSerial::new(index, Serial::from_raw(serial))
    }

    #[test]
    fn merge_takes_elementwise_maximum() {
        let mut a = ResourceUse::from(qs(0, 7));
        a.set_queue_serial(&qs(2, 3));
        let mut b = ResourceUse::from(qs(0, 4));
        b.set_queue_serial(&qs(1, 9));
        b.set_queue_serial(&qs(3, 1));

        a.merge(&b);
        assert_eq!(
            a.serials(),
            &[
                Serial::from_raw(7),
                Serial::from_raw(9),
                Serial::from_raw(3),
                Serial::from_raw(1)
            ]
        );
    }

    #[test]
    fn finished_only_when_every_index_caught_up() {
        let completed = AtomicQueueSerialArray::default();
        let mut use_ = ResourceUse::from(qs(0, 2));
        use_.set_queue_serial(&qs(3, 5));
        assert!(!use_.is_contained_in(&completed));

        completed.set_queue_serial(&qs(0, 10));
        assert!(!use_.is_contained_in(&completed));

        completed.set_queue_serial(&qs(3, 5));
        assert!(use_.is_contained_in(&completed));
    }

    #[test]
    fn untouched_indices_are_trivially_finished() {
        let completed = AtomicQueueSerialArray::default();
        assert!(ResourceUse::new().is_contained_in(&completed));

        //index 0 and 1 are padded with zero serials
        let use_ = ResourceUse::from(qs(2, 1));
        completed.set_queue_serial(&qs(2, 1));
        assert!(use_.is_contained_in(&completed));
    }

    #[test]
    fn command_buffer_matching() {
        let use_ = ResourceUse::from(qs(1, 4));
        assert!(use_.used_by_command_buffer(&qs(1, 4)));
        assert!(!use_.used_by_command_buffer(&qs(1, 3)));
        assert!(!use_.used_by_command_buffer(&QueueSerial::default()));
        assert!(use_.is_newer_than(&qs(1, 3)));
        assert!(!use_.is_newer_than(&qs(0, 1)));
    }

    #[test]
    fn out_of_range_index_is_never_contained() {
        let completed = AtomicQueueSerialArray::default();
        completed.fill(Serial::INFINITE);
        let mut use_ = ResourceUse::new();
        use_.set_serial(completed.len(), Serial::from_raw(1));
        assert!(!use_.is_contained_in(&completed));
    }

}
