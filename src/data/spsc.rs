//! Fixed-capacity single-producer/single-consumer queue.
//!
//! A power-of-two ring of preallocated slots with atomic head/tail cursors.
//! `try_push` never blocks and never reallocates; `try_pop` returns `None`
//! on empty. Release/Acquire ordering on the tail store guarantees a pushed
//! value is fully visible to the consumer before the consumer can observe
//! the advanced cursor.
//!
//! # Overflow policy
//!
//! Chosen at construction:
//!
//! - [`OverflowPolicy::DropNewest`]: a push against a full ring is rejected
//!   and counted in `dropped()`. Every production queue in this daemon uses
//!   this policy so ordered history is never silently rewritten.
//! - [`OverflowPolicy::OverwriteOldest`]: the producer advances the read
//!   cursor (discarding the oldest element) and then pushes. The overwrite
//!   path claims the cursor with a CAS, so a concurrent `try_pop` either
//!   wins the slot or retries; a consumer-side read that loses the race is
//!   forgotten without being used.
//!
//! # Thread safety
//!
//! [`Producer`] and [`Consumer`] are `Send` but not `Clone`; exactly one of
//! each exists per ring. Multiple logical producers serialize through an
//! external mutex around the `Producer` handle (held only for the push, no
//! syscalls under it).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// What a full ring does with the next push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the push, increment the dropped counter.
    DropNewest,
    /// Discard the oldest element, then push.
    OverwriteOldest,
}

struct Inner<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot to pop. Written by the consumer, and by the producer on the
    /// overwrite path.
    head: AtomicUsize,
    /// Next slot to push. Written only by the producer.
    tail: AtomicUsize,
    dropped: AtomicU64,
    policy: OverflowPolicy,
}

// SAFETY: slot access is coordinated by the head/tail cursors; a slot is
// written only while it is outside the [head, tail) window and read only
// after a Release store of tail made the write visible.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut i = head;
        while i != tail {
            // SAFETY: [head, tail) holds initialized values; both handles are
            // gone so no concurrent access remains.
            unsafe {
                (*self.slots[i & self.mask].get()).assume_init_drop();
            }
            i = i.wrapping_add(1);
        }
    }
}

/// Producer handle. Exactly one per ring.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// Consumer handle. Exactly one per ring.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Create a ring with the given capacity (must be a power of two) and
/// overflow policy.
pub fn channel<T>(capacity: usize, policy: OverflowPolicy) -> (Producer<T>, Consumer<T>) {
    assert!(
        capacity.is_power_of_two() && capacity >= 2,
        "ring capacity must be a power of two >= 2, got {}",
        capacity
    );
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(Inner {
        slots,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
        policy,
    });
    (
        Producer {
            inner: inner.clone(),
        },
        Consumer { inner },
    )
}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

impl<T> Producer<T> {
    /// Push a value. Returns `false` (and counts a drop) when the ring is
    /// full under [`OverflowPolicy::DropNewest`].
    pub fn try_push(&mut self, value: T) -> bool {
        let inner = &*self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        loop {
            let head = inner.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) <= inner.mask {
                break;
            }
            match inner.policy {
                OverflowPolicy::DropNewest => {
                    inner.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                OverflowPolicy::OverwriteOldest => {
                    // Claim the oldest slot; a concurrent pop may win instead.
                    if inner
                        .head
                        .compare_exchange(
                            head,
                            head.wrapping_add(1),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        inner.dropped.fetch_add(1, Ordering::Relaxed);
                        // SAFETY: the claimed slot left the live window, so
                        // only this thread touches it now.
                        unsafe {
                            (*inner.slots[head & inner.mask].get()).assume_init_drop();
                        }
                    }
                }
            }
        }
        // SAFETY: tail is outside the live window; the consumer cannot read
        // this slot until the Release store below.
        unsafe {
            (*inner.slots[tail & inner.mask].get()).write(value);
        }
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() > self.inner.mask
    }

    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }

    /// Total values discarded so far (rejected pushes or overwritten
    /// elements).
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Consumer<T> {
    /// Pop the oldest value, or `None` when the ring is empty.
    pub fn try_pop(&mut self) -> Option<T> {
        let inner = &*self.inner;
        loop {
            let head = inner.head.load(Ordering::Relaxed);
            let tail = inner.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            // SAFETY: [head, tail) is initialized. Under DropNewest nothing
            // else mutates head, so the CAS below always succeeds and the
            // read is uncontended. Under OverwriteOldest the producer may
            // claim this slot first; the CAS fails and the copy is forgotten
            // unused.
            let value = unsafe { (*inner.slots[head & inner.mask].get()).assume_init_read() };
            match inner.head.compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(value),
                Err(_) => std::mem::forget(value),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_pop_round_trip() {
        let (mut tx, mut rx) = channel(8, OverflowPolicy::DropNewest);
        assert!(tx.try_push(1u32));
        assert!(tx.try_push(2));
        assert_eq!(rx.try_pop(), Some(1));
        assert_eq!(rx.try_pop(), Some(2));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn drop_newest_rejects_at_capacity() {
        let (mut tx, mut rx) = channel(4, OverflowPolicy::DropNewest);
        for i in 0..4u32 {
            assert!(tx.try_push(i));
        }
        assert!(tx.is_full());
        assert!(!tx.try_push(99));
        assert_eq!(tx.dropped(), 1);
        // Contents are intact and ordered.
        for i in 0..4u32 {
            assert_eq!(rx.try_pop(), Some(i));
        }
    }

    #[test]
    fn overwrite_oldest_advances_read_cursor() {
        let (mut tx, mut rx) = channel(4, OverflowPolicy::OverwriteOldest);
        for i in 0..6u32 {
            assert!(tx.try_push(i));
        }
        assert_eq!(tx.dropped(), 2);
        assert_eq!(rx.try_pop(), Some(2));
        assert_eq!(rx.try_pop(), Some(3));
        assert_eq!(rx.try_pop(), Some(4));
        assert_eq!(rx.try_pop(), Some(5));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn capacity_must_be_power_of_two() {
        let result = std::panic::catch_unwind(|| channel::<u8>(3, OverflowPolicy::DropNewest));
        assert!(result.is_err());
    }

    #[test]
    fn drops_pending_values_on_destruction() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Probe;
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }
        let (mut tx, rx) = channel(8, OverflowPolicy::DropNewest);
        for _ in 0..5 {
            assert!(tx.try_push(Probe));
        }
        drop(tx);
        drop(rx);
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn concurrent_producer_consumer_loses_nothing() {
        const N: u64 = 1_000_000;
        let (mut tx, mut rx) = channel(256, OverflowPolicy::DropNewest);

        let producer = thread::spawn(move || {
            let mut sent = 0u64;
            let mut next = 0u64;
            while next < N {
                if tx.try_push(next) {
                    sent += 1;
                    next += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
            sent
        });

        let consumer = thread::spawn(move || {
            let mut expected = 0u64;
            while expected < N {
                match rx.try_pop() {
                    Some(v) => {
                        assert_eq!(v, expected, "element lost or duplicated");
                        expected += 1;
                    }
                    None => std::hint::spin_loop(),
                }
            }
            expected
        });

        assert_eq!(producer.join().unwrap(), N);
        assert_eq!(consumer.join().unwrap(), N);
    }
}
