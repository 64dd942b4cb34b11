//! Deferred destruction of resources still referenced by submitted work.
use crate::serial::{AtomicSerials, ResourceUse};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt};
use tracing::trace;

/// Releases resources whose last use has completed on the GPU.
pub trait GarbageCollector: Send + Sync {
    /// Destroys the garbage whose use has been reached by `completed`. Returns whether anything
    /// was destroyed.
    fn cleanup_garbage(&self, completed: &AtomicSerials) -> bool;

    /// Size in bytes of the suballocated memory awaiting release.
    fn suballocation_garbage_size(&self) -> u64;
}

/// A collector with nothing to collect.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoGarbage;

impl GarbageCollector for NoGarbage {
    fn cleanup_garbage(&self, _completed: &AtomicSerials) -> bool {
        false
    }

    fn suballocation_garbage_size(&self) -> u64 {
        0
    }
}

struct GarbageObject {
    use_: ResourceUse,
    size: u64,
    destroy: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct GarbageListInner {
    objects: VecDeque<GarbageObject>,
    total_size: u64,
}

/// A list of resources awaiting destruction, each tagged with its last use.
#[derive(Default)]
pub struct GarbageList {
    inner: Mutex<GarbageListInner>,
}

impl GarbageList {
    pub fn new() -> GarbageList {
        GarbageList::default()
    }

    /// Defers `destroy` until `use_` has finished. `size` counts toward the suballocation
    /// garbage size.
    pub fn add(&self, use_: ResourceUse, size: u64, destroy: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        inner.total_size += size;
        inner.objects.push_back(GarbageObject {
            use_,
            size,
            destroy: Box::new(destroy),
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().objects.is_empty()
    }
}

impl GarbageCollector for GarbageList {
    fn cleanup_garbage(&self, completed: &AtomicSerials) -> bool {
        let finished = {
            let mut inner = self.inner.lock();
            let mut finished = vec![];
            let mut kept = VecDeque::with_capacity(inner.objects.len());
            for object in inner.objects.drain(..) {
                if object.use_.is_reached_by(completed) {
                    finished.push(object);
                } else {
                    kept.push_back(object);
                }
            }
            inner.objects = kept;
            inner.total_size -= finished.iter().map(|o| o.size).sum::<u64>();
            finished
        };

        let any = !finished.is_empty();
        if any {
            trace!("destroying {} garbage objects", finished.len());
        }
        // destructors run outside of the lock, they may add garbage themselves
        for object in finished {
            (object.destroy)();
        }
        any
    }

    fn suballocation_garbage_size(&self) -> u64 {
        self.inner.lock().total_size
    }
}

impl fmt::Debug for GarbageList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("GarbageList")
            .field("len", &inner.objects.len())
            .field("total_size", &inner.total_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{QueueSerial, Serial};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn only_finished_garbage_is_destroyed() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let list = GarbageList::new();
        for serial in 1..=3 {
            let destroyed = destroyed.clone();
            list.add(QueueSerial::new(0, Serial(serial)).into(), 100, move || {
                destroyed.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(list.suballocation_garbage_size(), 300);

        let completed = AtomicSerials::new();
        assert!(!list.cleanup_garbage(&completed));

        completed.set_queue_serial(QueueSerial::new(0, Serial(2)));
        assert!(list.cleanup_garbage(&completed));
        assert_eq!(destroyed.load(Ordering::Relaxed), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.suballocation_garbage_size(), 100);
    }
}
