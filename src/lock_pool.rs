// Lock pool - Access serialization for the native API
//
// Vulkan forbids unsynchronized use of queues, pools and most handles from
// several threads. Every native call site takes the mutex of the category
// it touches; queue operations take the mutex of their queue family instead,
// so two families can still be driven concurrently.
//
// The pool is an ordinary value: the application builds one and hands it to
// the device, so separate renderers never share locks.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Category of shared native state guarded by one mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockGroup {
    Instance,
    Device,
    Queue,
    /// Graphics command pool and every command buffer allocated from it.
    CommandBuffer,
    Descriptor,
    Pipeline,
    Shader,
    RenderPass,
    Memory,
    Buffer,
    Image,
    Sampler,
    Synchronization,
    Swapchain,
}

impl LockGroup {
    pub const COUNT: usize = 14;

    pub const ALL: [LockGroup; Self::COUNT] = [
        LockGroup::Instance,
        LockGroup::Device,
        LockGroup::Queue,
        LockGroup::CommandBuffer,
        LockGroup::Descriptor,
        LockGroup::Pipeline,
        LockGroup::Shader,
        LockGroup::RenderPass,
        LockGroup::Memory,
        LockGroup::Buffer,
        LockGroup::Image,
        LockGroup::Sampler,
        LockGroup::Synchronization,
        LockGroup::Swapchain,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Named-category mutexes plus one mutex per registered queue family.
pub struct LockPool {
    groups: [Mutex<()>; LockGroup::COUNT],
    queues: RwLock<HashMap<u32, Arc<Mutex<()>>>>,
}

impl LockPool {
    pub fn new() -> Self {
        Self {
            groups: std::array::from_fn(|_| Mutex::new(())),
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a mutex for `family`. Registering the same family twice is a no-op.
    pub fn register_queue_family(&self, family: u32) {
        let mut queues = self.queues.write();
        queues.entry(family).or_insert_with(|| {
            log::debug!("Lock pool: registered queue family {}", family);
            Arc::new(Mutex::new(()))
        });
    }

    pub fn has_queue_family(&self, family: u32) -> bool {
        self.queues.read().contains_key(&family)
    }

    /// Runs `f` while holding the mutex of `group`.
    ///
    /// The mutexes are not reentrant: `f` must not take the same group again.
    pub fn with<R>(&self, group: LockGroup, f: impl FnOnce() -> R) -> R {
        let _guard = self.groups[group.index()].lock();
        f()
    }

    /// Runs `f` while holding the mutex of queue family `family`.
    pub fn with_queue<R>(&self, family: u32, f: impl FnOnce() -> R) -> Result<R> {
        // Clone the family mutex out so the table lock is not held during `f`.
        let lock = self
            .queues
            .read()
            .get(&family)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidState(format!("queue family {} has no registered lock", family))
            })?;
        let _guard = lock.lock();
        Ok(f())
    }

    /// Runs `f` while holding every registered queue family mutex.
    ///
    /// Device-wide calls such as `vkDeviceWaitIdle` touch all queues. The
    /// mutexes are taken in ascending family order.
    pub fn with_all_queues<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut locks: Vec<(u32, Arc<Mutex<()>>)> = self
            .queues
            .read()
            .iter()
            .map(|(&family, lock)| (family, lock.clone()))
            .collect();
        locks.sort_by_key(|&(family, _)| family);

        let _guards: Vec<_> = locks.iter().map(|(_, lock)| lock.lock()).collect();
        f()
    }
}

impl Default for LockPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn group_indices_are_distinct() {
        let mut seen = [false; LockGroup::COUNT];
        for group in LockGroup::ALL {
            assert!(!seen[group.index()]);
            seen[group.index()] = true;
        }
    }

    #[test]
    fn same_group_is_serialized() {
        let pool = Arc::new(LockPool::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        pool.with(LockGroup::Queue, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_queue_families_run_concurrently() {
        let pool = Arc::new(LockPool::new());
        pool.register_queue_family(0);
        pool.register_queue_family(1);

        let (tx, rx) = mpsc::channel();
        let other = pool.clone();
        let (entered_tx, entered_rx) = mpsc::channel();

        let waiter = thread::spawn(move || {
            other
                .with_queue(0, || {
                    entered_tx.send(()).unwrap();
                    rx.recv_timeout(Duration::from_secs(5))
                })
                .unwrap()
        });

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.with_queue(1, || tx.send(()).unwrap()).unwrap();

        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn all_queues_excludes_a_single_queue() {
        let pool = Arc::new(LockPool::new());
        pool.register_queue_family(0);
        pool.register_queue_family(1);

        let inside = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let pool = pool.clone();
            let inside = inside.clone();
            thread::spawn(move || {
                pool.with_all_queues(|| {
                    inside.store(1, Ordering::SeqCst);
                    entered_tx.send(()).unwrap();
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                    inside.store(0, Ordering::SeqCst);
                })
            })
        };

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let submitter = {
            let pool = pool.clone();
            let inside = inside.clone();
            thread::spawn(move || pool.with_queue(1, || inside.load(Ordering::SeqCst)).unwrap())
        };

        // The submitter stays blocked until the device-wide section ends
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        holder.join().unwrap();
        assert_eq!(submitter.join().unwrap(), 0);
    }

    #[test]
    fn unregistered_family_is_an_error() {
        let pool = LockPool::new();
        pool.register_queue_family(2);
        pool.register_queue_family(2);
        assert!(pool.has_queue_family(2));
        assert!(matches!(pool.with_queue(7, || ()), Err(Error::InvalidState(_))));
    }
}
