//! Queue serials and resource uses.
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    cmp::Ordering,
    fmt,
    sync::atomic::{self, AtomicU64, AtomicUsize},
};

/// Maximum number of serial streams (one per submitting context).
pub const MAX_QUEUE_SERIAL_INDEX_COUNT: usize = 128;

/// Index of a serial stream.
pub type SerialIndex = usize;

/// A strictly increasing number identifying a unit of work on one serial stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct Serial(pub u64);

impl Serial {
    pub const ZERO: Serial = Serial(0);
    /// Compares greater than any serial ever generated.
    pub const INFINITE: Serial = Serial(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Serial::ZERO
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Serial::INFINITE {
            write!(f, "inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A serial on a specific stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct QueueSerial {
    pub index: SerialIndex,
    pub serial: Serial,
}

impl QueueSerial {
    pub const fn new(index: SerialIndex, serial: Serial) -> QueueSerial {
        QueueSerial { index, serial }
    }

    pub fn is_valid(&self) -> bool {
        self.serial.is_valid()
    }
}

/// The set of serials a resource depends on, one per serial stream.
///
/// A resource use is finished once, for every stream, the last completed serial is greater
/// or equal to the recorded serial.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct ResourceUse {
    serials: SmallVec<[Serial; 4]>,
}

impl ResourceUse {
    pub fn new() -> ResourceUse {
        ResourceUse::default()
    }

    /// Records a use of the resource by the given queue serial.
    pub fn set_queue_serial(&mut self, queue_serial: QueueSerial) {
        if self.serials.len() <= queue_serial.index {
            self.serials.resize(queue_serial.index + 1, Serial::ZERO);
        }
        debug_assert!(
            queue_serial.serial >= self.serials[queue_serial.index],
            "resource use serials must not go backwards"
        );
        self.serials[queue_serial.index] = queue_serial.serial;
    }

    /// Merges the serials of `other` into this use, keeping the larger serial for each stream.
    pub fn merge(&mut self, other: &ResourceUse) {
        if self.serials.len() < other.serials.len() {
            self.serials.resize(other.serials.len(), Serial::ZERO);
        }
        for (mine, theirs) in self.serials.iter_mut().zip(other.serials.iter()) {
            *mine = (*mine).max(*theirs);
        }
    }

    pub fn serial(&self, index: SerialIndex) -> Serial {
        self.serials.get(index).copied().unwrap_or(Serial::ZERO)
    }

    /// Iterates over the (index, serial) pairs that are set.
    pub fn iter(&self) -> impl Iterator<Item = (SerialIndex, Serial)> + '_ {
        self.serials
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_valid())
            .map(|(i, s)| (i, *s))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Returns whether every serial in this use is at or below the corresponding value in `serials`.
    pub fn is_reached_by(&self, serials: &AtomicSerials) -> bool {
        self.iter().all(|(index, serial)| serial <= serials.get(index))
    }
}

impl From<QueueSerial> for ResourceUse {
    fn from(queue_serial: QueueSerial) -> Self {
        let mut use_ = ResourceUse::new();
        use_.set_queue_serial(queue_serial);
        use_
    }
}

impl PartialOrd for ResourceUse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let len = self.serials.len().max(other.serials.len());
        let before = (0..len).all(|i| self.serial(i) <= other.serial(i));
        let after = (0..len).all(|i| self.serial(i) >= other.serial(i));

        match (before, after) {
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => Some(Ordering::Equal),
            (false, false) => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-stream serials that can be read without locking.
pub struct AtomicSerials {
    serials: Box<[AtomicU64]>,
}

impl AtomicSerials {
    pub fn new() -> AtomicSerials {
        AtomicSerials {
            serials: (0..MAX_QUEUE_SERIAL_INDEX_COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn get(&self, index: SerialIndex) -> Serial {
        Serial(self.serials[index].load(atomic::Ordering::Acquire))
    }

    /// Publishes a new serial for the stream. Serials never go backwards.
    pub fn set_queue_serial(&self, queue_serial: QueueSerial) {
        let slot = &self.serials[queue_serial.index];
        debug_assert!(
            queue_serial.serial.0 >= slot.load(atomic::Ordering::Relaxed),
            "serial {} on stream {} went backwards",
            queue_serial.serial,
            queue_serial.index
        );
        slot.store(queue_serial.serial.0, atomic::Ordering::Release);
    }

    /// Sets every stream to `serial`.
    pub fn fill(&self, serial: Serial) {
        for slot in self.serials.iter() {
            slot.store(serial.0, atomic::Ordering::Release);
        }
    }
}

impl Default for AtomicSerials {
    fn default() -> Self {
        AtomicSerials::new()
    }
}

impl fmt::Debug for AtomicSerials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // only print the streams that have seen any work
        f.debug_map()
            .entries(
                (0..self.serials.len())
                    .map(|i| (i, self.get(i)))
                    .filter(|(_, s)| s.is_valid()),
            )
            .finish()
    }
}

/// Generates strictly increasing serials, starting at 1.
#[derive(Debug)]
pub struct SerialFactory {
    next: AtomicU64,
}

impl SerialFactory {
    pub const fn new() -> SerialFactory {
        SerialFactory {
            next: AtomicU64::new(1),
        }
    }

    pub fn generate(&self) -> Serial {
        let serial = self.next.fetch_add(1, atomic::Ordering::Relaxed);
        assert!(serial != u64::MAX, "serial overflow");
        Serial(serial)
    }
}

impl Default for SerialFactory {
    fn default() -> Self {
        SerialFactory::new()
    }
}

/// Hands out serial stream indices.
pub struct QueueSerialIndexAllocator {
    /// One bit per index, set when allocated.
    used: Mutex<u128>,
    largest_index_ever_allocated: AtomicUsize,
    factories: Box<[SerialFactory]>,
}

impl QueueSerialIndexAllocator {
    pub fn new() -> QueueSerialIndexAllocator {
        QueueSerialIndexAllocator {
            used: Mutex::new(0),
            largest_index_ever_allocated: AtomicUsize::new(0),
            factories: (0..MAX_QUEUE_SERIAL_INDEX_COUNT).map(|_| SerialFactory::new()).collect(),
        }
    }

    /// Allocates a free stream index. Returns `None` if all indices are in use.
    pub fn allocate(&self) -> Option<SerialIndex> {
        let mut used = self.used.lock();
        let index = (!*used).trailing_zeros() as usize;
        if index >= MAX_QUEUE_SERIAL_INDEX_COUNT {
            return None;
        }
        *used |= 1u128 << index;
        self.largest_index_ever_allocated
            .fetch_max(index, atomic::Ordering::AcqRel);
        Some(index)
    }

    pub fn release(&self, index: SerialIndex) {
        let mut used = self.used.lock();
        assert!(*used & (1u128 << index) != 0, "serial index {index} was not allocated");
        *used &= !(1u128 << index);
    }

    pub fn largest_index_ever_allocated(&self) -> SerialIndex {
        self.largest_index_ever_allocated.load(atomic::Ordering::Acquire)
    }

    /// Generates the next serial on the given stream.
    ///
    /// Serials keep increasing across releases of the index, so that a recycled index never
    /// reports stale work as complete.
    pub fn generate(&self, index: SerialIndex) -> QueueSerial {
        QueueSerial::new(index, self.factories[index].generate())
    }
}

impl Default for QueueSerialIndexAllocator {
    fn default() -> Self {
        QueueSerialIndexAllocator::new()
    }
}

impl fmt::Debug for QueueSerialIndexAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSerialIndexAllocator")
            .field("used", &format_args!("{:#x}", *self.used.lock()))
            .finish()
    }
}
