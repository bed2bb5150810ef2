//! Process-management syscalls.

use super::{set_return, syscall_args};
use crate::error::{KernelError, KernelResult};
use crate::hardware::{
    self, TlbScope, ERROR, MAX_PT_LEN, PAGESHIFT, VMEM_1_BASE, VMEM_1_LIMIT,
};
use crate::loader;
use crate::memory::frame_allocator::FramePool;
use crate::memory::paging::{self, Pte, PteProt};
use crate::memory::{self, FRAME_POOL};
use crate::scheduler::context;
use crate::scheduler::pcb::{BlockReason, Pcb, INIT_PID};
use crate::scheduler::PROCESS_TABLE;
use alloc::vec::Vec;
use core::ffi::c_char;

pub fn sys_getpid() {
    let mut table = PROCESS_TABLE.lock();
    let pid = table.current_pid();
    table.current_mut().user_ctx.regs[0] = pid as usize;
}

/// Moves the user break of `pcb` to cover `addr`, taking and returning
/// frames through `pool`. `Ok(true)` means pages were unmapped and the
/// region-1 TLB needs a flush.
pub(crate) fn apply_user_brk(
    pcb: &mut Pcb,
    pool: &mut FramePool,
    addr: usize,
) -> KernelResult<bool> {
    if addr < VMEM_1_BASE || addr >= VMEM_1_LIMIT {
        return Err(KernelError::InvalidArgument);
    }
    let page = (hardware::up_to_page(addr) >> PAGESHIFT) - MAX_PT_LEN;
    if page <= pcb.last_user_data_page || page >= pcb.last_user_stack_page {
        return Err(KernelError::InvalidArgument);
    }
    let table = pcb
        .page_table
        .as_mut()
        .ok_or(KernelError::InvalidArgument)?;

    if page > pcb.brk_page {
        for i in pcb.brk_page..page {
            match pool.alloc() {
                Some(frame) => table[i] = Pte::map(PteProt::READ | PteProt::WRITE, frame),
                None => {
                    // Keep what was mapped so far consistent and stop.
                    pcb.brk_page = i;
                    return Err(KernelError::OutOfFrames);
                }
            }
        }
        pcb.brk_page = page;
        Ok(false)
    } else if page < pcb.brk_page {
        for i in page..pcb.brk_page {
            if table[i].is_valid() {
                pool.free(table[i].pfn());
                table[i].invalidate();
            }
        }
        pcb.brk_page = page;
        Ok(true)
    } else {
        Ok(false)
    }
}

pub fn sys_brk() {
    let (addr, _, _) = syscall_args();
    let result = {
        let mut table = PROCESS_TABLE.lock();
        let mut pool_guard = FRAME_POOL.lock();
        match pool_guard.as_mut() {
            Some(pool) => apply_user_brk(table.current_mut(), pool, addr),
            None => Err(KernelError::OutOfFrames),
        }
    };
    match result {
        Ok(shrunk) => {
            if shrunk {
                hardware::flush_tlb(TlbScope::User);
            }
            set_return(0);
        }
        Err(e) => {
            crate::log_warn!("brk: {}", e);
            set_return(ERROR as usize);
        }
    }
}

pub fn sys_delay() {
    let (raw_ticks, _, _) = syscall_args();
    let ticks = raw_ticks as isize;
    if ticks == 0 {
        set_return(0);
        return;
    }
    if ticks < 0 {
        crate::log_warn!("delay: negative tick count");
        set_return(ERROR as usize);
        return;
    }

    let (cur, next) = {
        let mut table = PROCESS_TABLE.lock();
        let cur = table.current_pid();
        let next = table.block_current(BlockReason::Delay(ticks as u32));
        (cur, next)
    };
    if context::switch_to(cur, next).is_err() {
        crate::log_error!("delay: could not switch away");
        PROCESS_TABLE.lock().cancel_block(cur);
        set_return(ERROR as usize);
        return;
    }

    // Back on the CPU after the delay elapsed.
    if let Some(pcb) = PROCESS_TABLE.lock().pcb_mut(cur) {
        pcb.user_ctx.regs[0] = 0;
    }
    context::activate_current_address_space();
}

pub fn sys_fork() {
    // Snapshot the parent while nothing can change under us.
    let (parent_pid, parent_uc, brk_page, last_data, last_stack, live_pages) = {
        let table = PROCESS_TABLE.lock();
        let pcb = table.current();
        let pt = pcb
            .page_table
            .as_ref()
            .expect("running process has no page table");
        let mut pages = Vec::new();
        for page in 0..MAX_PT_LEN {
            if pt[page].is_valid() {
                pages.push((page, pt[page].prot()));
            }
        }
        (
            pcb.pid,
            pcb.user_ctx,
            pcb.brk_page,
            pcb.last_user_data_page,
            pcb.last_user_stack_page,
            pages,
        )
    };

    // Mirror the address space into fresh frames.
    let mut child_pt = paging::new_user_page_table();
    let mut claimed: Vec<usize> = Vec::new();
    for &(page, prot) in &live_pages {
        match memory::alloc_frame() {
            Ok(frame) => {
                child_pt[page] = Pte::map(prot, frame);
                claimed.push(frame);
            }
            Err(e) => {
                for frame in claimed {
                    memory::free_frame(frame);
                }
                crate::log_warn!("fork: {}", e);
                set_return(ERROR as usize);
                return;
            }
        }
    }
    for &(page, _) in &live_pages {
        let frame = child_pt[page].pfn();
        let src_vaddr = VMEM_1_BASE + (page << PAGESHIFT);
        paging::with_temp_mapping(frame, |scratch_vaddr| unsafe {
            hardware::mem_copy_page(scratch_vaddr, src_vaddr);
        });
    }

    // Two fresh frames for the child's kernel stack.
    let kstack = match (memory::alloc_frame(), memory::alloc_frame()) {
        (Ok(first), Ok(second)) => [first, second],
        (first, second) => {
            if let Ok(frame) = first {
                memory::free_frame(frame);
            }
            if let Ok(frame) = second {
                memory::free_frame(frame);
            }
            for frame in claimed {
                memory::free_frame(frame);
            }
            crate::log_warn!("fork: no frames for the child kernel stack");
            set_return(ERROR as usize);
            return;
        }
    };

    let mut child = Pcb::new(parent_uc, child_pt, kstack);
    child.brk_page = brk_page;
    child.last_user_data_page = last_data;
    child.last_user_stack_page = last_stack;
    child.parent = Some(parent_pid);
    let child_pid = child.pid;

    {
        let mut table = PROCESS_TABLE.lock();
        table.current_mut().children.push(child_pid);
        table.insert(child);
        table.enqueue_ready(child_pid);
        // The parent's return value; the child overwrites its own copy
        // when it first runs.
        table.current_mut().user_ctx.regs[0] = child_pid as usize;
    }

    if context::clone_into(child_pid).is_err() {
        crate::log_error!("fork: kernel stack clone failed");
        set_return(ERROR as usize);
        return;
    }

    // Both sides of the fork come through here.
    let running = PROCESS_TABLE.lock().current_pid();
    if running != parent_pid {
        context::activate_current_address_space();
        set_return(0);
    }
}

pub fn sys_exec() {
    let (name_arg, argv_arg, _) = syscall_args();
    let name = name_arg as *const c_char;
    let argv = argv_arg as *const *const c_char;

    let result = {
        let mut table = PROCESS_TABLE.lock();
        loader::load_program(name, argv, table.current_mut())
    };
    match result {
        Ok(()) => set_return(0),
        Err(e) => {
            crate::log_error!("exec: {}", e);
            set_return(ERROR as usize);
        }
    }
}

pub fn sys_exit() {
    let mut table = PROCESS_TABLE.lock();
    let pid = table.current_pid();
    if pid == INIT_PID {
        crate::log_info!("init exited; halting the machine");
        hardware::halt();
    }

    // A fault handler may already have forced the status to ERROR;
    // otherwise the user supplied it in the argument register.
    let status = {
        let pcb = table.current();
        if pcb.exit_status == ERROR {
            ERROR
        } else {
            pcb.user_ctx.regs[0] as i32
        }
    };
    table.current_mut().exit_status = status;
    hardware::retire_pid(pid);

    // Return every user frame and drop the page table.
    if let Some(mut pt) = table.current_mut().page_table.take() {
        let mut pool_guard = FRAME_POOL.lock();
        if let Some(pool) = pool_guard.as_mut() {
            pt.release_frames(pool);
        }
        drop(pool_guard);
        hardware::flush_tlb(TlbScope::User);
    }

    // Children keep running without a parent.
    let children = table.current().children.clone();
    for child in children {
        if let Some(pcb) = table.pcb_mut(child) {
            pcb.parent = None;
        }
    }

    // Only a live parent justifies keeping the PCB around for wait().
    let parent_alive = match table.current().parent {
        Some(parent) => table.contains(parent),
        None => false,
    };
    if parent_alive {
        table.make_defunct(pid);
    } else {
        table.remove(pid);
    }

    let next = table.pick_next();
    drop(table);
    if context::switch_to(pid, next).is_err() {
        hardware::abort("exit: no context to switch into");
    }
}

pub fn sys_wait() {
    let (status_arg, _, _) = syscall_args();
    let status_ptr = status_arg as *mut i32;
    let cur = {
        let table = PROCESS_TABLE.lock();
        if table.current().children.is_empty() {
            drop(table);
            set_return(ERROR as usize);
            return;
        }
        table.current_pid()
    };

    loop {
        let reaped = PROCESS_TABLE.lock().reap_child(cur);
        if let Some((child, status)) = reaped {
            unsafe { *status_ptr = status };
            if let Some(pcb) = PROCESS_TABLE.lock().pcb_mut(cur) {
                pcb.user_ctx.regs[0] = child as usize;
            }
            return;
        }

        let next = PROCESS_TABLE.lock().block_current(BlockReason::WaitChild);
        if context::switch_to(cur, next).is_err() {
            crate::log_error!("wait: could not switch away");
            PROCESS_TABLE.lock().cancel_block(cur);
            set_return(ERROR as usize);
            return;
        }
        context::activate_current_address_space();
    }
}
