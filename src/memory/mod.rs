pub mod frame_allocator;
pub mod heap;
pub mod paging;

use crate::error::{KernelError, KernelResult};
use crate::hardware::{MAX_PT_LEN, PAGESIZE};
use self::frame_allocator::FramePool;
use spin::Mutex;

/// The machine-wide frame pool, built once boot knows the physical memory
/// size.
pub static FRAME_POOL: Mutex<Option<FramePool>> = Mutex::new(None);

/// Builds the frame pool and claims every frame the kernel image already
/// occupies, read straight out of the region-0 table.
pub fn init(pmem_size: usize) {
    let frames = pmem_size / PAGESIZE;
    let mut pool = FramePool::new(frames);
    {
        let table = paging::KERNEL_PAGE_TABLE.lock();
        for page in 0..MAX_PT_LEN {
            if table[page].is_valid() {
                pool.mark_used(table[page].pfn());
            }
        }
    }
    let used = pool.used_count();
    *FRAME_POOL.lock() = Some(pool);
    crate::log_info!(
        "Frame pool initialized: {} frames, {} held by the kernel image.",
        frames,
        used
    );
}

pub fn alloc_frame() -> KernelResult<usize> {
    let mut guard = FRAME_POOL.lock();
    let pool = guard.as_mut().ok_or(KernelError::OutOfFrames)?;
    pool.alloc().ok_or(KernelError::OutOfFrames)
}

pub fn free_frame(frame: usize) {
    if let Some(pool) = FRAME_POOL.lock().as_mut() {
        pool.free(frame);
    }
}

pub fn used_frames() -> usize {
    FRAME_POOL.lock().as_ref().map_or(0, |p| p.used_count())
}
