//! Kernel break and heap.
//!
//! The kernel heap occupies the pages between the original boot break and
//! the scratch slot below the kernel stack. `set_kernel_brk` moves the
//! mapped frontier; the global allocator is a linked-list heap that extends
//! itself through the break when an allocation does not fit.

use crate::error::{KernelError, KernelResult};
use crate::hardware::{self, Register, TlbScope, PAGESHIFT, PAGESIZE};
use crate::memory::{self, paging};
use crate::memory::paging::{PteProt, SCRATCH_PAGE};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use linked_list_allocator::LockedHeap;
use spin::Mutex;

struct BreakState {
    /// First unmapped page above the heap.
    cur_page: usize,
    /// Break page at boot; the heap never shrinks below it.
    orig_page: usize,
}

static BREAK: Mutex<Option<BreakState>> = Mutex::new(None);

pub fn init_break(orig_page: usize) {
    *BREAK.lock() = Some(BreakState {
        cur_page: orig_page,
        orig_page,
    });
}

pub fn current_break_page() -> usize {
    BREAK.lock().as_ref().map_or(0, |s| s.cur_page)
}

/// Moves the kernel break to cover `addr`.
///
/// Before VM is enabled addresses are physical: the new pages are
/// identity-mapped and shrinking is refused. Afterwards growth takes frames
/// from the pool and shrinking zeroes, unmaps, and returns them. The break
/// may never reach the scratch slot below the kernel stack, nor drop below
/// the boot break.
pub fn set_kernel_brk(addr: usize) -> KernelResult<()> {
    let mut guard = BREAK.lock();
    let state = guard.as_mut().ok_or(KernelError::InvalidArgument)?;
    let page = addr >> PAGESHIFT;

    if hardware::read_register(Register::VmEnable) == 0 {
        if page < state.cur_page {
            return Err(KernelError::InvalidArgument);
        }
        for i in state.cur_page..=page {
            paging::map_kernel_page(i, PteProt::READ | PteProt::WRITE)?;
        }
        state.cur_page = page + 1;
        return Ok(());
    }

    if page >= state.cur_page {
        if page >= SCRATCH_PAGE {
            return Err(KernelError::WouldOverflow);
        }
        for i in state.cur_page..=page {
            paging::map_kernel_page(i, PteProt::READ | PteProt::WRITE)?;
        }
        hardware::flush_tlb(TlbScope::Kernel);
        state.cur_page = page + 1;
    } else {
        if page <= state.orig_page {
            return Err(KernelError::InvalidArgument);
        }
        for i in page..state.cur_page {
            // Scrub while the mapping is still live, then hand the frame back.
            unsafe { hardware::mem_zero_page(i << PAGESHIFT) };
            let pfn = paging::unmap_kernel_page(i)?;
            memory::free_frame(pfn);
        }
        hardware::flush_tlb(TlbScope::Kernel);
        state.cur_page = page;
    }
    Ok(())
}

/* ── Global allocator ───────────────────────────────────────────────── */

const INITIAL_HEAP_PAGES: usize = 16;
const GROWTH_PAGES: usize = 4;

pub struct KernelHeap {
    heap: LockedHeap,
}

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: KernelHeap = KernelHeap {
    heap: LockedHeap::empty(),
};

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let first_try = self.heap.lock().allocate_first_fit(layout);
        if let Ok(p) = first_try {
            return p.as_ptr();
        }
        if grow(layout.size() + layout.align()).is_err() {
            return core::ptr::null_mut();
        }
        match self.heap.lock().allocate_first_fit(layout) {
            Ok(p) => p.as_ptr(),
            Err(()) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.heap.lock().deallocate(NonNull::new_unchecked(ptr), layout);
    }
}

/// Maps the initial heap region and hands it to the allocator. Runs before
/// VM is enabled, so the pages are identity-mapped.
pub fn init_heap() -> KernelResult<()> {
    let bottom_page = current_break_page();
    set_kernel_brk((bottom_page + INITIAL_HEAP_PAGES - 1) << PAGESHIFT)?;
    unsafe {
        ALLOCATOR
            .heap
            .lock()
            .init((bottom_page << PAGESHIFT) as *mut u8, INITIAL_HEAP_PAGES * PAGESIZE);
    }
    crate::log_info!(
        "Kernel heap initialized: {} pages at page {}.",
        INITIAL_HEAP_PAGES,
        bottom_page
    );
    Ok(())
}

fn grow(min_bytes: usize) -> KernelResult<()> {
    let pages = ((min_bytes + PAGESIZE - 1) >> PAGESHIFT).max(GROWTH_PAGES);
    let cur = current_break_page();
    set_kernel_brk((cur + pages - 1) << PAGESHIFT)?;
    unsafe { ALLOCATOR.heap.lock().extend(pages * PAGESIZE) };
    Ok(())
}
