//! Lock-free bucket array: a singly-linked list of fixed-size slot arrays,
//! used as the storage substrate for processes, threads, memory mappings,
//! and debug sections.
//!
//! Grounded directly in `original_source/shared/bucket_array.h`: each
//! bucket holds `N` slots, each slot has an `unavailable` flag (claimed,
//! may still be mid-construction) and an `occupied` flag (holds a live
//! value); claiming a slot is a single compare-and-swap on `unavailable`,
//! and new buckets are appended (never removed) when every existing bucket
//! is full.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

struct Bucket<T, const N: usize> {
    entries: [UnsafeCell<MaybeUninit<T>>; N],
    unavailable: [AtomicBool; N],
    occupied: [AtomicBool; N],
    next: AtomicPtr<Bucket<T, N>>,
}

impl<T, const N: usize> Bucket<T, N> {
    fn new() -> *mut Bucket<T, N> {
        let boxed = alloc::boxed::Box::new(Bucket {
            entries: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            unavailable: core::array::from_fn(|_| AtomicBool::new(false)),
            occupied: core::array::from_fn(|_| AtomicBool::new(false)),
            next: AtomicPtr::new(core::ptr::null_mut()),
        });
        alloc::boxed::Box::into_raw(boxed)
    }
}

/// A handle to a claimed slot: `(bucket index, slot index)` is not exposed
/// directly; callers instead get a stable [`Handle`] they can use to look
/// the value back up or remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    bucket: usize,
    slot: usize,
}

pub struct BucketArray<T, const N: usize> {
    head: AtomicPtr<Bucket<T, N>>,
}

unsafe impl<T: Send, const N: usize> Sync for BucketArray<T, N> {}
unsafe impl<T: Send, const N: usize> Send for BucketArray<T, N> {}

impl<T, const N: usize> BucketArray<T, N> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn bucket_at(&self, index: usize) -> *mut Bucket<T, N> {
        let mut ptr = self.head.load(Ordering::Acquire);
        if ptr.is_null() {
            let new_head = Bucket::new();
            match self.head.compare_exchange(
                core::ptr::null_mut(),
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => ptr = new_head,
                Err(existing) => {
                    unsafe { drop(alloc::boxed::Box::from_raw(new_head)) };
                    ptr = existing;
                }
            }
        }
        for _ in 0..index {
            unsafe {
                let mut next = (*ptr).next.load(Ordering::Acquire);
                if next.is_null() {
                    let candidate = Bucket::new();
                    match (*ptr).next.compare_exchange(
                        core::ptr::null_mut(),
                        candidate,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => next = candidate,
                        Err(existing) => {
                            drop(alloc::boxed::Box::from_raw(candidate));
                            next = existing;
                        }
                    }
                }
                ptr = next;
            }
        }
        ptr
    }

    /// Claims the first available slot, constructs `value` into it, and
    /// returns a handle. Scans existing buckets first; only allocates a new
    /// bucket once every existing slot is unavailable.
    pub fn insert(&self, value: T) -> Handle {
        let mut bucket_index = 0;
        loop {
            let bucket = self.bucket_at(bucket_index);
            unsafe {
                for slot in 0..N {
                    if (*bucket).unavailable[slot]
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        (*(*bucket).entries[slot].get()).write(value);
                        (*bucket).occupied[slot].store(true, Ordering::Release);
                        return Handle {
                            bucket: bucket_index,
                            slot,
                        };
                    }
                }
            }
            bucket_index += 1;
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let bucket = self.bucket_at(handle.bucket);
        unsafe {
            if (*bucket).occupied[handle.slot].load(Ordering::Acquire) {
                Some((*(*bucket).entries[handle.slot].get()).assume_init_ref())
            } else {
                None
            }
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self, handle: Handle) -> Option<&mut T> {
        let bucket = self.bucket_at(handle.bucket);
        unsafe {
            if (*bucket).occupied[handle.slot].load(Ordering::Acquire) {
                Some((*(*bucket).entries[handle.slot].get()).assume_init_mut())
            } else {
                None
            }
        }
    }

    /// Drops the value at `handle` and marks the slot available for reuse.
    pub fn remove(&self, handle: Handle) {
        let bucket = self.bucket_at(handle.bucket);
        unsafe {
            if (*bucket).occupied[handle.slot].swap(false, Ordering::AcqRel) {
                (*(*bucket).entries[handle.slot].get()).assume_init_drop();
            }
            (*bucket).unavailable[handle.slot].store(false, Ordering::Release);
        }
    }

    /// Iterates every occupied slot across every allocated bucket, skipping
    /// unoccupied ones, as `bucket_array_iterator` does in the original.
    pub fn iter(&self) -> Iter<'_, T, N> {
        Iter {
            array: self,
            bucket_index: 0,
            bucket: self.head.load(Ordering::Acquire),
            slot: 0,
        }
    }
}

pub struct Iter<'a, T, const N: usize> {
    array: &'a BucketArray<T, N>,
    bucket_index: usize,
    bucket: *mut Bucket<T, N>,
    slot: usize,
}

impl<'a, T, const N: usize> Iterator for Iter<'a, T, N> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.bucket.is_null() {
                return None;
            }
            if self.slot >= N {
                self.slot = 0;
                self.bucket_index += 1;
                self.bucket = unsafe { (*self.bucket).next.load(Ordering::Acquire) };
                continue;
            }
            let bucket = self.bucket;
            let slot = self.slot;
            self.slot += 1;
            unsafe {
                if (*bucket).occupied[slot].load(Ordering::Acquire) {
                    let handle = Handle {
                        bucket: self.bucket_index,
                        slot,
                    };
                    let value = (*(*bucket).entries[slot].get()).assume_init_ref();
                    return Some((handle, value));
                }
            }
        }
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a BucketArray<T, N> {
    type Item = (Handle, &'a T);
    type IntoIter = Iter<'a, T, N>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_roundtrip() {
        let arr: BucketArray<u32, 4> = BucketArray::new();
        let h1 = arr.insert(10);
        let h2 = arr.insert(20);
        assert_eq!(*arr.get(h1).unwrap(), 10);
        assert_eq!(*arr.get(h2).unwrap(), 20);
        arr.remove(h1);
        assert!(arr.get(h1).is_none());
        assert_eq!(*arr.get(h2).unwrap(), 20);
    }

    #[test]
    fn insert_spans_multiple_buckets() {
        let arr: BucketArray<u32, 2> = BucketArray::new();
        let handles: alloc::vec::Vec<Handle> = (0..5).map(|i| arr.insert(i)).collect();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(*arr.get(*h).unwrap(), i as u32);
        }
    }

    #[test]
    fn removed_slot_is_reused() {
        let arr: BucketArray<u32, 2> = BucketArray::new();
        let h1 = arr.insert(1);
        let _h2 = arr.insert(2);
        arr.remove(h1);
        let h3 = arr.insert(3);
        assert_eq!(h3, h1);
        assert_eq!(*arr.get(h3).unwrap(), 3);
    }

    #[test]
    fn iter_skips_unoccupied_slots() {
        let arr: BucketArray<u32, 2> = BucketArray::new();
        let h1 = arr.insert(1);
        let _h2 = arr.insert(2);
        arr.remove(h1);
        let values: alloc::vec::Vec<u32> = arr.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, alloc::vec![2]);
    }
}
