//! Bitmap frame allocator.
//!
//! One bit per physical frame, one bit set means the frame is in use. The
//! bitmap itself lives in frames claimed from the region it describes
//! (see [`init`]). There is no coalescing and no buddy structure: the
//! allocator's whole job is answering "is this frame free" and flipping
//! bits, exactly as in `original_source/kernel64/paging.h`'s
//! `bitmap_allocate_frame` / `bitmap_allocate_consecutive_frames` /
//! `bitmap_mark_range` family.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use x86_64::structures::paging::{PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::config::PAGE_SIZE;
use crate::error::OutOfMemory;
use crate::spinlock::SpinLock;

struct Bitmap {
    /// Byte slice covering every frame from frame 0 up to `frame_count`.
    /// Backed by memory claimed out of the usable regions at `init` time.
    bits: &'static mut [u8],
    frame_count: u64,
    /// Search cursor: the single-frame scan starts here and wraps around,
    /// so repeated allocate/free cycles don't always rescan from frame 0.
    cursor: u64,
}

impl Bitmap {
    fn is_set(&self, frame: u64) -> bool {
        let byte = (frame / 8) as usize;
        let bit = (frame % 8) as u8;
        self.bits[byte] & (1 << bit) != 0
    }

    fn set(&mut self, frame: u64) {
        let byte = (frame / 8) as usize;
        let bit = (frame % 8) as u8;
        self.bits[byte] |= 1 << bit;
    }

    fn clear(&mut self, frame: u64) {
        let byte = (frame / 8) as usize;
        let bit = (frame % 8) as u8;
        self.bits[byte] &= !(1 << bit);
    }

    /// Marks `[start, start + count)` with `value`, touching whole bytes in
    /// the middle and doing bit-at-a-time work only for the unaligned
    /// prefix/suffix. Mirrors `bitmap_mark_range` in the original allocator.
    fn mark_range(&mut self, start: u64, count: u64, used: bool) {
        if count == 0 {
            return;
        }
        let end = start + count;
        let mut frame = start;

        while frame < end && frame % 8 != 0 {
            if used {
                self.set(frame);
            } else {
                self.clear(frame);
            }
            frame += 1;
        }

        let whole_bytes_end = frame + ((end - frame) / 8) * 8;
        let fill: u8 = if used { 0xff } else { 0x00 };
        while frame < whole_bytes_end {
            self.bits[(frame / 8) as usize] = fill;
            frame += 8;
        }

        while frame < end {
            if used {
                self.set(frame);
            } else {
                self.clear(frame);
            }
            frame += 1;
        }
    }

    fn allocate_one(&mut self) -> Result<u64, OutOfMemory> {
        let start = self.cursor;
        for offset in 0..self.frame_count {
            let frame = (start + offset) % self.frame_count;
            if !self.is_set(frame) {
                self.set(frame);
                self.cursor = (frame + 1) % self.frame_count;
                return Ok(frame);
            }
        }
        Err(OutOfMemory)
    }

    fn allocate_consecutive(&mut self, count: u64) -> Result<u64, OutOfMemory> {
        if count == 0 || count > self.frame_count {
            return Err(OutOfMemory);
        }
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        for frame in 0..self.frame_count {
            if self.is_set(frame) {
                run_start = frame + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                self.mark_range(run_start, count, true);
                return Ok(run_start);
            }
        }
        Err(OutOfMemory)
    }
}

static BITMAP: SpinLock<Option<Bitmap>> = SpinLock::new(None);

/// Claims frames for the bitmap itself out of the largest usable region,
/// then marks every other non-usable frame (and the bitmap's own frames)
/// as used so the allocator never hands them out.
pub fn init(memory_regions: &'static MemoryRegions) {
    let mut highest_frame = 0u64;
    let mut best_region: Option<(u64, u64)> = None;
    let mut best_len = 0u64;

    for region in memory_regions.iter() {
        let top_frame = region.end / PAGE_SIZE;
        if top_frame > highest_frame {
            highest_frame = top_frame;
        }
        if region.kind == MemoryRegionKind::Usable {
            let len = region.end - region.start;
            if len > best_len {
                best_len = len;
                best_region = Some((region.start, region.end));
            }
        }
    }

    let frame_count = highest_frame;
    let bytes_needed = (frame_count as usize + 7) / 8;

    let (bitmap_region_start, _bitmap_region_end) =
        best_region.expect("no usable memory region to host the frame bitmap");

    let bitmap_phys = bitmap_region_start;
    let bitmap_ptr = bitmap_phys as *mut u8;
    let bits: &'static mut [u8] = unsafe {
        core::ptr::write_bytes(bitmap_ptr, 0xff, bytes_needed);
        core::slice::from_raw_parts_mut(bitmap_ptr, bytes_needed)
    };

    let mut bitmap = Bitmap {
        bits,
        frame_count,
        cursor: 0,
    };

    for region in memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable {
            continue;
        }
        let start_frame = region.start / PAGE_SIZE;
        let end_frame = region.end / PAGE_SIZE;
        bitmap.mark_range(start_frame, end_frame - start_frame, false);
    }

    let bitmap_frames = (bytes_needed as u64 * 8 + PAGE_SIZE - 1) / PAGE_SIZE;
    let bitmap_start_frame = bitmap_phys / PAGE_SIZE;
    bitmap.mark_range(bitmap_start_frame, bitmap_frames, true);

    // Frame 0 is never handed out so a null physical address never looks
    // like a valid allocation.
    bitmap.set(0);

    log::info!(
        "frame allocator: {} frames tracked, bitmap at {:#x} ({} bytes)",
        frame_count,
        bitmap_phys,
        bytes_needed
    );

    *BITMAP.lock() = Some(bitmap);
}

fn frame_to_phys(frame: u64) -> PhysFrame<Size4KiB> {
    PhysFrame::containing_address(PhysAddr::new(frame * PAGE_SIZE))
}

fn phys_to_frame(addr: PhysAddr) -> u64 {
    addr.as_u64() / PAGE_SIZE
}

/// Allocates a single free frame.
pub fn allocate_frame() -> Result<PhysFrame<Size4KiB>, OutOfMemory> {
    let mut guard = BITMAP.lock();
    let bitmap = guard.as_mut().expect("frame allocator not initialized");
    bitmap.allocate_one().map(frame_to_phys)
}

/// Allocates `count` physically consecutive frames, returning the first.
/// Used by `MapFreeConsecutiveMemory` and by PCIe BAR mapping, both of
/// which need a contiguous physical run rather than whatever pages the
/// single-frame allocator happens to hand back.
pub fn allocate_consecutive_frames(count: u64) -> Result<PhysFrame<Size4KiB>, OutOfMemory> {
    let mut guard = BITMAP.lock();
    let bitmap = guard.as_mut().expect("frame allocator not initialized");
    bitmap.allocate_consecutive(count).map(frame_to_phys)
}

/// Returns a frame to the pool.
pub fn deallocate_frame(frame: PhysFrame<Size4KiB>) {
    let mut guard = BITMAP.lock();
    let bitmap = guard.as_mut().expect("frame allocator not initialized");
    bitmap.clear(phys_to_frame(frame.start_address()));
}

/// Returns `count` consecutive frames starting at `frame` to the pool.
pub fn deallocate_consecutive_frames(frame: PhysFrame<Size4KiB>, count: u64) {
    let mut guard = BITMAP.lock();
    let bitmap = guard.as_mut().expect("frame allocator not initialized");
    bitmap.mark_range(phys_to_frame(frame.start_address()), count, false);
}

pub struct FrameStats {
    pub total_frames: u64,
    pub used_frames: u64,
}

pub fn stats() -> FrameStats {
    let guard = BITMAP.lock();
    let bitmap = guard.as_ref().expect("frame allocator not initialized");
    let mut used = 0u64;
    for frame in 0..bitmap.frame_count {
        if bitmap.is_set(frame) {
            used += 1;
        }
    }
    FrameStats {
        total_frames: bitmap.frame_count,
        used_frames: used,
    }
}

/// Adapter so the paging engine's x86_64-crate mapper calls can use this
/// allocator through the `x86_64::structures::paging::FrameAllocator`
/// trait where that's more convenient than calling `allocate_frame`
/// directly.
pub struct GlobalFrameAllocator;

unsafe impl x86_64::structures::paging::FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        allocate_frame().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bitmap(frame_count: u64) -> Bitmap {
        let bytes = vec![0u8; ((frame_count + 7) / 8) as usize].leak();
        Bitmap {
            bits: bytes,
            frame_count,
            cursor: 0,
        }
    }

    #[test]
    fn allocate_one_finds_first_free() {
        let mut bm = test_bitmap(64);
        bm.set(0);
        bm.set(1);
        let f = bm.allocate_one().unwrap();
        assert_eq!(f, 2);
        assert!(bm.is_set(2));
    }

    #[test]
    fn allocate_one_wraps_via_cursor() {
        let mut bm = test_bitmap(8);
        for f in 0..8 {
            bm.set(f);
        }
        bm.clear(3);
        bm.cursor = 5;
        let f = bm.allocate_one().unwrap();
        assert_eq!(f, 3);
    }

    #[test]
    fn allocate_one_reports_out_of_memory() {
        let mut bm = test_bitmap(8);
        for f in 0..8 {
            bm.set(f);
        }
        assert_eq!(bm.allocate_one(), Err(OutOfMemory));
    }

    #[test]
    fn allocate_consecutive_finds_run() {
        let mut bm = test_bitmap(32);
        for f in 0..10 {
            bm.set(f);
        }
        let start = bm.allocate_consecutive(4).unwrap();
        assert_eq!(start, 10);
        for f in 10..14 {
            assert!(bm.is_set(f));
        }
    }

    #[test]
    fn allocate_consecutive_skips_fragmented_holes() {
        let mut bm = test_bitmap(16);
        // Free: 0,1 used:2 free:3,4 used:5 free:6,7,8,9 ...
        bm.set(2);
        bm.set(5);
        let start = bm.allocate_consecutive(4).unwrap();
        assert_eq!(start, 6);
    }

    #[test]
    fn mark_range_handles_subbyte_prefix_and_suffix() {
        let mut bm = test_bitmap(32);
        bm.mark_range(3, 10, true);
        for f in 0..3 {
            assert!(!bm.is_set(f));
        }
        for f in 3..13 {
            assert!(bm.is_set(f));
        }
        for f in 13..32 {
            assert!(!bm.is_set(f));
        }
        bm.mark_range(3, 10, false);
        for f in 0..32 {
            assert!(!bm.is_set(f));
        }
    }
}
