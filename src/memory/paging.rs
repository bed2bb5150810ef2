//! Page tables for both MMU regions.
//!
//! Region 0 is the single kernel table below; region-1 tables are allocated
//! per process and owned by the PCB. A PTE packs valid bit, protection bits,
//! and frame number into one word, which is the layout the MMU walks.

use crate::error::{KernelError, KernelResult};
use crate::hardware::{
    self, TlbScope, KERNEL_STACK_BASE_PAGE, KERNEL_STACK_LIMIT_PAGE, KERNEL_STACK_PAGES,
    MAX_PT_LEN, PAGESHIFT,
};
use crate::memory;
use alloc::boxed::Box;
use bit_field::BitField;
use bitflags::bitflags;
use core::ops::{Index, IndexMut};
use spin::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteProt: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

const VALID_BIT: usize = 0;
const PROT_BITS: core::ops::Range<usize> = 1..4;
const PFN_BITS: core::ops::Range<usize> = 4..24;

/// One page-table entry. When the valid bit is clear the rest of the word is
/// meaningless and the frame, if any, must already be back in the pool.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Pte(u32);

impl Pte {
    pub const fn invalid() -> Self {
        Pte(0)
    }

    pub fn map(prot: PteProt, pfn: usize) -> Self {
        let mut word = 0u32;
        word.set_bit(VALID_BIT, true);
        word.set_bits(PROT_BITS, prot.bits());
        word.set_bits(PFN_BITS, pfn as u32);
        Pte(word)
    }

    pub fn is_valid(&self) -> bool {
        self.0.get_bit(VALID_BIT)
    }

    pub fn prot(&self) -> PteProt {
        PteProt::from_bits_truncate(self.0.get_bits(PROT_BITS))
    }

    pub fn pfn(&self) -> usize {
        self.0.get_bits(PFN_BITS) as usize
    }

    pub fn set_pfn(&mut self, pfn: usize) {
        self.0.set_bits(PFN_BITS, pfn as u32);
    }

    pub fn invalidate(&mut self) {
        self.0 = 0;
    }
}

/// A full page table: one PTE per page of a virtual region.
#[repr(transparent)]
pub struct PageTable([Pte; MAX_PT_LEN]);

impl PageTable {
    pub const fn new() -> Self {
        PageTable([Pte::invalid(); MAX_PT_LEN])
    }

    /// Address handed to the MMU's base register.
    pub fn base_addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn valid_count(&self) -> usize {
        self.0.iter().filter(|e| e.is_valid()).count()
    }

    /// Frees every mapped frame into `pool` and invalidates the entries.
    /// Returns how many frames went back.
    pub fn release_frames(&mut self, pool: &mut super::frame_allocator::FramePool) -> usize {
        let mut freed = 0;
        for entry in self.0.iter_mut() {
            if entry.is_valid() {
                pool.free(entry.pfn());
                entry.invalidate();
                freed += 1;
            }
        }
        freed
    }
}

impl Index<usize> for PageTable {
    type Output = Pte;

    fn index(&self, page: usize) -> &Pte {
        &self.0[page]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, page: usize) -> &mut Pte {
        &mut self.0[page]
    }
}

/// The region-0 table. The MMU's base register points at this for the whole
/// life of the machine.
pub static KERNEL_PAGE_TABLE: Mutex<PageTable> = Mutex::new(PageTable::new());

/// Scratch slot just below the kernel stack, used for short-lived mappings
/// of foreign frames. The kernel break is never allowed to reach it.
pub const SCRATCH_PAGE: usize = KERNEL_STACK_BASE_PAGE - 1;

/// Installs a kernel mapping for `page`. Before VM is enabled addresses are
/// physical, so the page maps to itself; afterwards a frame comes from the
/// pool.
pub fn map_kernel_page(page: usize, prot: PteProt) -> KernelResult<usize> {
    if page >= MAX_PT_LEN {
        return Err(KernelError::InvalidArgument);
    }
    let pfn = if vm_enabled() {
        memory::alloc_frame()?
    } else {
        page
    };
    KERNEL_PAGE_TABLE.lock()[page] = Pte::map(prot, pfn);
    Ok(pfn)
}

/// Invalidates a kernel mapping and returns the frame it held.
pub fn unmap_kernel_page(page: usize) -> KernelResult<usize> {
    let mut table = KERNEL_PAGE_TABLE.lock();
    if page >= MAX_PT_LEN || !table[page].is_valid() {
        return Err(KernelError::InvalidArgument);
    }
    let pfn = table[page].pfn();
    table[page].invalidate();
    Ok(pfn)
}

/// Points the two kernel-stack PTEs at another process's stack frames.
/// `frames[0]` backs the top stack page.
pub fn remap_kernel_stack(frames: &[usize; KERNEL_STACK_PAGES]) {
    {
        let mut table = KERNEL_PAGE_TABLE.lock();
        table[KERNEL_STACK_LIMIT_PAGE - 1].set_pfn(frames[0]);
        table[KERNEL_STACK_BASE_PAGE].set_pfn(frames[1]);
    }
    hardware::flush_tlb(TlbScope::Kernel);
}

/// Maps `frame` at the scratch slot, runs `f` with the scratch virtual
/// address, then tears the mapping down and flushes. The mapping never
/// outlives the call.
pub fn with_temp_mapping<R>(frame: usize, f: impl FnOnce(usize) -> R) -> R {
    {
        let mut table = KERNEL_PAGE_TABLE.lock();
        table[SCRATCH_PAGE] = Pte::map(PteProt::READ | PteProt::WRITE, frame);
    }
    let result = f(SCRATCH_PAGE << PAGESHIFT);
    {
        let mut table = KERNEL_PAGE_TABLE.lock();
        table[SCRATCH_PAGE].invalidate();
    }
    hardware::flush_tlb(TlbScope::Kernel);
    result
}

/// Fresh region-1 table with every entry invalid.
pub fn new_user_page_table() -> Box<PageTable> {
    Box::new(PageTable::new())
}

fn vm_enabled() -> bool {
    hardware::read_register(hardware::Register::VmEnable) != 0
}
