//! Machine bring-up.
//!
//! Builds the kernel's identity mappings, turns on virtual memory, wires the
//! trap vector and terminals, then constructs the first two processes: init
//! from the boot arguments and the idle process, which inherits a clone of
//! the boot kernel stack.

use crate::drivers;
use crate::hardware::{
    self, Register, TlbScope, UserContext, KERNEL_STACK_BASE_PAGE, KERNEL_STACK_LIMIT_PAGE,
    MAX_PT_LEN,
};
use crate::loader;
use crate::memory;
use crate::memory::heap;
use crate::memory::paging::{self, PteProt};
use crate::scheduler::context;
use crate::scheduler::pcb::Pcb;
use crate::scheduler::PROCESS_TABLE;
use crate::traps;
use core::ffi::{c_char, CStr};

const INIT_PROGRAM: &CStr = c"test/init";
const IDLE_PROGRAM: &CStr = c"test/idle";

pub fn kernel_start(cmd_args: *const *const c_char, pmem_size: usize, uctxt: *mut UserContext) {
    if uctxt.is_null() || cmd_args.is_null() {
        hardware::abort("KernelStart: NULL boot arguments");
    }
    crate::log_info!("Entering KernelStart with {} bytes of physical memory.", pmem_size);

    // First boot argument names the initial program, if present.
    let init_program = unsafe {
        if (*cmd_args).is_null() {
            INIT_PROGRAM.as_ptr()
        } else {
            *cmd_args
        }
    };

    // Identity-map the kernel image while VM is still off: text, data plus
    // the boot heap, and the two kernel-stack pages at the top of region 0.
    let text_start = hardware::first_kernel_text_page();
    let data_start = hardware::first_kernel_data_page();
    let orig_brk = hardware::orig_kernel_brk_page();
    for page in text_start..data_start {
        if paging::map_kernel_page(page, PteProt::READ | PteProt::EXEC).is_err() {
            hardware::abort("KernelStart: could not map kernel text");
        }
    }
    for page in data_start..orig_brk {
        if paging::map_kernel_page(page, PteProt::READ | PteProt::WRITE).is_err() {
            hardware::abort("KernelStart: could not map kernel data");
        }
    }
    for page in KERNEL_STACK_BASE_PAGE..KERNEL_STACK_LIMIT_PAGE {
        if paging::map_kernel_page(page, PteProt::READ | PteProt::WRITE).is_err() {
            hardware::abort("KernelStart: could not map the kernel stack");
        }
    }

    heap::init_break(orig_brk);
    if heap::init_heap().is_err() {
        hardware::abort("KernelStart: could not initialize the kernel heap");
    }
    memory::init(pmem_size);

    // Hand the MMU the kernel table and switch to virtual addressing.
    {
        let table = paging::KERNEL_PAGE_TABLE.lock();
        hardware::write_register(Register::Ptbr0, table.base_addr());
    }
    hardware::write_register(Register::Ptlr0, MAX_PT_LEN);
    hardware::write_register(Register::VmEnable, 1);

    traps::init();
    drivers::init();

    let boot_uc = unsafe { *uctxt };

    // The init process runs on the kernel stack we were booted with, so its
    // stack frames are exactly the identity frames of that window.
    let init_stack = [KERNEL_STACK_LIMIT_PAGE - 1, KERNEL_STACK_BASE_PAGE];
    let mut init_pcb = Pcb::new(boot_uc, paging::new_user_page_table(), init_stack);
    hardware::write_register(
        Register::Ptbr1,
        init_pcb
            .page_table
            .as_ref()
            .expect("fresh PCB has a page table")
            .base_addr(),
    );
    hardware::write_register(Register::Ptlr1, MAX_PT_LEN);
    if loader::load_program(init_program, cmd_args, &mut init_pcb).is_err() {
        hardware::abort("KernelStart: could not load the initial program");
    }
    let init_pid = init_pcb.pid;
    {
        let mut table = PROCESS_TABLE.lock();
        table.insert(init_pcb);
        table.set_current(init_pid);
    }

    // The idle process gets fresh stack frames and the idle program.
    let idle_stack = match (memory::alloc_frame(), memory::alloc_frame()) {
        (Ok(first), Ok(second)) => [first, second],
        _ => hardware::abort("KernelStart: no frames for the idle kernel stack"),
    };
    let mut idle_pcb = Pcb::new(boot_uc, paging::new_user_page_table(), idle_stack);
    hardware::write_register(
        Register::Ptbr1,
        idle_pcb
            .page_table
            .as_ref()
            .expect("fresh PCB has a page table")
            .base_addr(),
    );
    hardware::write_register(Register::Ptlr1, MAX_PT_LEN);
    hardware::flush_tlb(TlbScope::User);
    if loader::load_program(IDLE_PROGRAM.as_ptr(), cmd_args, &mut idle_pcb).is_err() {
        hardware::abort("KernelStart: could not load the idle program");
    }
    let idle_pid = idle_pcb.pid;
    {
        let mut table = PROCESS_TABLE.lock();
        table.insert(idle_pcb);
        table.set_idle(idle_pid);
    }

    // Give idle a private copy of the boot kernel stack so the first switch
    // into it resumes cleanly.
    if context::clone_into(idle_pid).is_err() {
        hardware::abort("KernelStart: could not clone the boot kernel stack");
    }

    // Resume whoever is current (init, until the first clock tick) in user
    // mode.
    context::activate_current_address_space();
    unsafe { *uctxt = PROCESS_TABLE.lock().current().user_ctx };
    crate::log_info!("Leaving KernelStart; pid {} runs first.", {
        PROCESS_TABLE.lock().current_pid()
    });
}
