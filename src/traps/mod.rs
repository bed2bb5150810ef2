//! Trap dispatch.
//!
//! The hardware indexes a vector of handlers by trap kind. Every handler
//! runs to completion: it saves the incoming user context into the running
//! PCB, does its work (possibly switching to another process along the
//! way), then reloads the region-1 registers and copies the now-running
//! PCB's user context back out for the hardware to resume.

use crate::drivers::tty;
use crate::hardware::{
    self, Register, TrapHandler, UserContext, ERROR, MAX_PT_LEN, PAGESHIFT, TRAP_CLOCK,
    TRAP_ILLEGAL, TRAP_KERNEL, TRAP_MATH, TRAP_MEMORY, TRAP_TTY_RECEIVE, TRAP_TTY_TRANSMIT,
    TRAP_VECTOR_SIZE, VMEM_1_BASE, VMEM_1_LIMIT,
};
use crate::ipc::REGISTRY;
use crate::memory;
use crate::memory::paging::{Pte, PteProt};
use crate::scheduler::context;
use crate::scheduler::PROCESS_TABLE;
use crate::syscalls;
use lazy_static::lazy_static;

lazy_static! {
    static ref TRAP_VECTOR: [TrapHandler; TRAP_VECTOR_SIZE] = {
        let mut vector: [TrapHandler; TRAP_VECTOR_SIZE] = [trap_other; TRAP_VECTOR_SIZE];
        vector[TRAP_KERNEL] = trap_kernel;
        vector[TRAP_CLOCK] = trap_clock;
        vector[TRAP_ILLEGAL] = trap_illegal;
        vector[TRAP_MEMORY] = trap_memory;
        vector[TRAP_MATH] = trap_math;
        vector[TRAP_TTY_RECEIVE] = trap_tty_receive;
        vector[TRAP_TTY_TRANSMIT] = trap_tty_transmit;
        vector
    };
}

/// Points the hardware at the vector table.
pub fn init() {
    hardware::write_register(Register::VectorBase, TRAP_VECTOR.as_ptr() as usize);
    crate::log_info!("Trap vector installed.");
}

fn save_user_context(uctxt: *mut UserContext) {
    let uc = unsafe { *uctxt };
    PROCESS_TABLE.lock().current_mut().user_ctx = uc;
}

fn restore_user_context(uctxt: *mut UserContext) {
    context::activate_current_address_space();
    let uc = PROCESS_TABLE.lock().current().user_ctx;
    unsafe { *uctxt = uc };
}

extern "C" fn trap_kernel(uctxt: *mut UserContext) {
    save_user_context(uctxt);
    let code = unsafe { (*uctxt).code };
    syscalls::dispatch(code);
    restore_user_context(uctxt);
}

extern "C" fn trap_clock(uctxt: *mut UserContext) {
    // Wake whoever this tick makes runnable before choosing the next
    // process.
    {
        let mut table = PROCESS_TABLE.lock();
        let registry = REGISTRY.lock();
        table.tick_wakeups(|pipe_id| {
            registry.pipe(pipe_id).map_or(false, |p| !p.is_empty())
        });
    }

    save_user_context(uctxt);
    let (cur, next) = {
        let mut table = PROCESS_TABLE.lock();
        let cur = table.current_pid();
        table.enqueue_ready(cur);
        let next = table.pick_next();
        (cur, next)
    };
    if context::switch_to(cur, next).is_err() {
        crate::log_error!("clock: context switch failed");
    }
    restore_user_context(uctxt);
}

extern "C" fn trap_illegal(uctxt: *mut UserContext) {
    save_user_context(uctxt);
    crate::log_warn!(
        "illegal instruction in pid {}; aborting it",
        PROCESS_TABLE.lock().current_pid()
    );
    PROCESS_TABLE.lock().current_mut().exit_status = ERROR;
    syscalls::process::sys_exit();
}

extern "C" fn trap_math(uctxt: *mut UserContext) {
    save_user_context(uctxt);
    crate::log_warn!(
        "arithmetic fault in pid {}; aborting it",
        PROCESS_TABLE.lock().current_pid()
    );
    PROCESS_TABLE.lock().current_mut().exit_status = ERROR;
    syscalls::process::sys_exit();
}

/// What the memory trap decided to do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultAction {
    /// Map new stack pages down to this page.
    GrowStack(usize),
    Kill,
}

/// A fault grows the stack only when it lands within two pages below the
/// current stack floor and above the heap break.
pub(crate) fn classify_fault(
    addr: usize,
    last_stack_page: usize,
    brk_page: usize,
) -> FaultAction {
    if addr < VMEM_1_BASE || addr >= VMEM_1_LIMIT {
        return FaultAction::Kill;
    }
    let page = (addr >> PAGESHIFT) - MAX_PT_LEN;
    let floor = last_stack_page as isize;
    if (page as isize) >= floor - 2 && page <= last_stack_page && (page as isize) > brk_page as isize
    {
        FaultAction::GrowStack(page)
    } else {
        FaultAction::Kill
    }
}

extern "C" fn trap_memory(uctxt: *mut UserContext) {
    save_user_context(uctxt);
    let addr = unsafe { (*uctxt).addr };

    let action = {
        let table = PROCESS_TABLE.lock();
        let pcb = table.current();
        classify_fault(addr, pcb.last_user_stack_page, pcb.brk_page)
    };

    match action {
        FaultAction::GrowStack(faulting_page) => {
            let grown = {
                let mut table = PROCESS_TABLE.lock();
                let pcb = table.current_mut();
                grow_user_stack(pcb, faulting_page)
            };
            if !grown {
                crate::log_warn!("stack growth failed for address {:#x}; aborting", addr);
                PROCESS_TABLE.lock().current_mut().exit_status = ERROR;
                syscalls::process::sys_exit();
                return;
            }
            restore_user_context(uctxt);
        }
        FaultAction::Kill => {
            crate::log_warn!(
                "memory fault at {:#x} in pid {}; aborting it",
                addr,
                PROCESS_TABLE.lock().current_pid()
            );
            PROCESS_TABLE.lock().current_mut().exit_status = ERROR;
            syscalls::process::sys_exit();
        }
    }
}

/// Maps every invalid page between the faulting page and the current stack
/// floor, then records the new floor. Already-mapped pages keep their
/// frames.
pub(crate) fn grow_user_stack(pcb: &mut crate::scheduler::pcb::Pcb, faulting_page: usize) -> bool {
    let floor = pcb.last_user_stack_page;
    let table = match pcb.page_table.as_mut() {
        Some(table) => table,
        None => return false,
    };
    for page in faulting_page..=floor {
        if table[page].is_valid() {
            continue;
        }
        match memory::alloc_frame() {
            Ok(frame) => table[page] = Pte::map(PteProt::READ | PteProt::WRITE, frame),
            Err(_) => return false,
        }
    }
    pcb.last_user_stack_page = faulting_page;
    true
}

extern "C" fn trap_tty_receive(uctxt: *mut UserContext) {
    save_user_context(uctxt);
    let tty_id = unsafe { (*uctxt).code } as usize;
    tty::handle_receive_trap(tty_id);
    restore_user_context(uctxt);
}

extern "C" fn trap_tty_transmit(uctxt: *mut UserContext) {
    save_user_context(uctxt);
    let tty_id = unsafe { (*uctxt).code } as usize;
    tty::handle_transmit_trap(tty_id);
    restore_user_context(uctxt);
}

extern "C" fn trap_other(_uctxt: *mut UserContext) {
    crate::log_warn!("unhandled trap");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::UserContext;
    use crate::memory::paging;
    use crate::scheduler::pcb::Pcb;

    #[test]
    fn faults_outside_region_one_kill() {
        assert_eq!(classify_fault(0x100, 100, 10), FaultAction::Kill);
        assert_eq!(classify_fault(VMEM_1_LIMIT, 100, 10), FaultAction::Kill);
    }

    #[test]
    fn faults_near_the_stack_grow_it() {
        let stack = 100;
        let brk = 10;
        let one_below = VMEM_1_BASE + (99 << PAGESHIFT);
        assert_eq!(
            classify_fault(one_below, stack, brk),
            FaultAction::GrowStack(99)
        );
        let two_below = VMEM_1_BASE + (98 << PAGESHIFT);
        assert_eq!(
            classify_fault(two_below, stack, brk),
            FaultAction::GrowStack(98)
        );
        // Three pages below the floor is out of the window.
        let three_below = VMEM_1_BASE + (97 << PAGESHIFT);
        assert_eq!(classify_fault(three_below, stack, brk), FaultAction::Kill);
    }

    #[test]
    fn faults_into_the_heap_kill() {
        // Right above the break but not near the stack.
        let addr = VMEM_1_BASE + (50 << PAGESHIFT);
        assert_eq!(classify_fault(addr, 100, 60), FaultAction::Kill);
        // Below the break.
        let addr = VMEM_1_BASE + (59 << PAGESHIFT);
        assert_eq!(classify_fault(addr, 60, 59), FaultAction::Kill);
    }

    #[test]
    fn stack_growth_maps_the_gap_and_moves_the_floor() {
        let _guard = crate::hardware::mock::machine_lock();
        crate::hardware::mock::reset();
        *crate::memory::FRAME_POOL.lock() =
            Some(crate::memory::frame_allocator::FramePool::new(32));

        let mut pt = paging::new_user_page_table();
        pt[100] = Pte::map(PteProt::READ | PteProt::WRITE, 1);
        let mut pcb = Pcb::with_pid(7, UserContext::zeroed(), pt, [0, 0]);
        pcb.last_user_stack_page = 100;
        pcb.brk_page = 10;

        assert!(grow_user_stack(&mut pcb, 98));
        assert_eq!(pcb.last_user_stack_page, 98);
        let table = pcb.page_table.as_ref().unwrap();
        assert!(table[98].is_valid());
        assert!(table[99].is_valid());
        // The page that was already mapped kept its frame.
        assert_eq!(table[100].pfn(), 1);
        assert_eq!(crate::memory::used_frames(), 2);

        *crate::memory::FRAME_POOL.lock() = None;
    }
}
