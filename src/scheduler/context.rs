//! Kernel-context switch and copy.
//!
//! Both run as callbacks under the hardware's `KernelContextSwitch`, which
//! hands us the saved kernel context of the caller. A switch saves that
//! context into the outgoing PCB, points the region-0 stack PTEs at the
//! incoming PCB's frames, and resumes the incoming context. A copy gives a
//! fresh PCB a byte-for-byte clone of the caller's kernel stack, so the
//! first switch into it resumes as if it had been the caller.

use super::pcb::Pid;
use super::PROCESS_TABLE;
use crate::error::{KernelError, KernelResult};
use crate::hardware::{
    self, KernelContext, Register, TlbScope, KERNEL_STACK_LIMIT_PAGE, KERNEL_STACK_PAGES,
    MAX_PT_LEN, PAGESHIFT,
};
use crate::memory::paging;
use core::ffi::c_void;

/// Suspends `curr` and resumes `next`. Returns, much later, when something
/// switches back into `curr`. Callers must hold no kernel locks.
pub fn switch_to(curr: Pid, next: Pid) -> KernelResult<()> {
    if curr == next {
        return Ok(());
    }
    let rc = hardware::context_switch(
        switch_entry,
        curr as usize as *mut c_void,
        next as usize as *mut c_void,
    );
    if rc != 0 {
        return Err(KernelError::SwitchFailed);
    }
    Ok(())
}

/// Clones the running kernel stack and context into `target`'s PCB.
pub fn clone_into(target: Pid) -> KernelResult<()> {
    let rc = hardware::context_switch(
        clone_entry,
        target as usize as *mut c_void,
        core::ptr::null_mut(),
    );
    if rc != 0 {
        return Err(KernelError::SwitchFailed);
    }
    Ok(())
}

/// Loads the region-1 registers from the running PCB and flushes its TLB.
/// Every resumption from a switch goes through here before touching user
/// memory.
pub fn activate_current_address_space() {
    let base = {
        let table = PROCESS_TABLE.lock();
        table
            .current()
            .page_table
            .as_ref()
            .expect("running process has no page table")
            .base_addr()
    };
    hardware::write_register(Register::Ptbr1, base);
    hardware::write_register(Register::Ptlr1, MAX_PT_LEN);
    hardware::flush_tlb(TlbScope::User);
}

extern "C" fn switch_entry(
    kc_in: *const KernelContext,
    curr: *mut c_void,
    next: *mut c_void,
) -> *const KernelContext {
    if kc_in.is_null() {
        return core::ptr::null();
    }
    let curr_pid = curr as usize as Pid;
    let next_pid = next as usize as Pid;

    let mut table = PROCESS_TABLE.lock();
    // An exiting process removes its PCB before switching away; there is
    // nothing left to save into then.
    if let Some(pcb) = table.pcb_mut(curr_pid) {
        pcb.kernel_ctx = unsafe { *kc_in };
    }
    let frames = match table.pcb(next_pid) {
        Some(pcb) => pcb.kernel_stack_frames,
        None => return core::ptr::null(),
    };
    paging::remap_kernel_stack(&frames);
    table.set_current(next_pid);
    &table.pcb(next_pid).expect("switch target vanished").kernel_ctx
}

extern "C" fn clone_entry(
    kc_in: *const KernelContext,
    target: *mut c_void,
    _unused: *mut c_void,
) -> *const KernelContext {
    if kc_in.is_null() {
        return core::ptr::null();
    }
    let pid = target as usize as Pid;
    let frames = {
        let mut table = PROCESS_TABLE.lock();
        let pcb = match table.pcb_mut(pid) {
            Some(pcb) => pcb,
            None => return core::ptr::null(),
        };
        pcb.kernel_ctx = unsafe { *kc_in };
        pcb.kernel_stack_frames
    };
    // Copy each live kernel-stack page into the target's frames through the
    // scratch slot.
    for (i, &frame) in frames.iter().enumerate().take(KERNEL_STACK_PAGES) {
        let src_vaddr = (KERNEL_STACK_LIMIT_PAGE - 1 - i) << PAGESHIFT;
        paging::with_temp_mapping(frame, |scratch_vaddr| unsafe {
            hardware::mem_copy_page(scratch_vaddr, src_vaddr);
        });
    }
    kc_in
}
