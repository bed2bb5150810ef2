//! Interface to the simulated machine.
//!
//! Everything the kernel knows about the hardware lives here: the memory
//! geometry, the trap vector layout, the MMU register file, the saved-context
//! types, and the entry points the simulator exposes (context switching,
//! terminal transmit/receive, host helpers). The rest of the kernel never
//! touches an `extern` symbol directly.

#[cfg(test)]
pub mod mock;

use core::ffi::{c_int, c_uint, c_void};

/* ── Machine geometry ───────────────────────────────────────────────── */

pub const PAGESIZE: usize = 0x2000;
pub const PAGESHIFT: usize = 13;

/// Entries per page table; also the page count of each virtual region.
pub const MAX_PT_LEN: usize = 128;

pub const VMEM_0_BASE: usize = 0;
pub const VMEM_0_LIMIT: usize = MAX_PT_LEN << PAGESHIFT;
pub const VMEM_1_BASE: usize = VMEM_0_LIMIT;
pub const VMEM_1_LIMIT: usize = VMEM_1_BASE + (MAX_PT_LEN << PAGESHIFT);

/// The running process's kernel stack: two pages at the top of region 0.
pub const KERNEL_STACK_PAGES: usize = 2;
pub const KERNEL_STACK_LIMIT: usize = VMEM_0_LIMIT;
pub const KERNEL_STACK_BASE: usize = KERNEL_STACK_LIMIT - KERNEL_STACK_PAGES * PAGESIZE;
pub const KERNEL_STACK_BASE_PAGE: usize = KERNEL_STACK_BASE >> PAGESHIFT;
pub const KERNEL_STACK_LIMIT_PAGE: usize = KERNEL_STACK_LIMIT >> PAGESHIFT;

pub const NUM_TERMINALS: usize = 4;
pub const TERMINAL_MAX_LINE: usize = 1024;
pub const PIPE_BUFFER_LEN: usize = 256;

pub const NUM_REGS: usize = 8;
pub const KERNEL_CONTEXT_SIZE: usize = 512;

/// Syscall/trap failure sentinel; user libraries test for exactly this.
pub const ERROR: i32 = -1;

pub const fn up_to_page(addr: usize) -> usize {
    (addr + PAGESIZE - 1) & !(PAGESIZE - 1)
}

/* ── Trap vector ────────────────────────────────────────────────────── */

pub const TRAP_VECTOR_SIZE: usize = 16;

pub const TRAP_KERNEL: usize = 0;
pub const TRAP_CLOCK: usize = 1;
pub const TRAP_ILLEGAL: usize = 2;
pub const TRAP_MEMORY: usize = 3;
pub const TRAP_MATH: usize = 4;
pub const TRAP_TTY_RECEIVE: usize = 5;
pub const TRAP_TTY_TRANSMIT: usize = 6;

pub type TrapHandler = extern "C" fn(*mut UserContext);

/* ── Saved contexts ─────────────────────────────────────────────────── */

/// Register snapshot taken by the hardware at trap entry. `code` carries the
/// trap-specific payload (syscall number, terminal id) and `addr` the
/// faulting address for memory traps. `regs[0..2]` carry syscall arguments;
/// `regs[0]` carries the return value.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserContext {
    pub vector: c_int,
    pub code: c_int,
    pub addr: usize,
    pub pc: usize,
    pub sp: usize,
    pub regs: [usize; NUM_REGS],
}

impl UserContext {
    pub const fn zeroed() -> Self {
        UserContext {
            vector: 0,
            code: 0,
            addr: 0,
            pc: 0,
            sp: 0,
            regs: [0; NUM_REGS],
        }
    }
}

/// Opaque kernel-mode resume state. The hardware hands us one of these at
/// every kernel-context switch; we store it byte-for-byte in the PCB.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KernelContext {
    bytes: [u8; KERNEL_CONTEXT_SIZE],
}

impl KernelContext {
    pub const fn zeroed() -> Self {
        KernelContext {
            bytes: [0; KERNEL_CONTEXT_SIZE],
        }
    }
}

/// Callback protocol of `KernelContextSwitch`: receives the hardware's saved
/// kernel context plus two opaque words, returns the context to resume.
pub type ContextCallback =
    extern "C" fn(*const KernelContext, *mut c_void, *mut c_void) -> *const KernelContext;

/* ── MMU register file ──────────────────────────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Register {
    Ptbr0 = 0,
    Ptlr0 = 1,
    Ptbr1 = 2,
    Ptlr1 = 3,
    VmEnable = 4,
    TlbFlush = 5,
    VectorBase = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbScope {
    All,
    Kernel,
    User,
}

const TLB_FLUSH_ALL: usize = 0xFFFF_FFFF;
const TLB_FLUSH_KERNEL: usize = 0xFFFF_FFFE;
const TLB_FLUSH_USER: usize = 0xFFFF_FFFD;

/* ── Simulator entry points ─────────────────────────────────────────── */

#[cfg(not(test))]
extern "C" {
    fn WriteRegister(reg: c_uint, value: c_uint);
    fn ReadRegister(reg: c_uint) -> c_uint;
    fn KernelContextSwitch(f: ContextCallback, a: *mut c_void, b: *mut c_void) -> c_int;
    fn TtyTransmit(tty_id: c_int, buf: *const u8, len: c_int);
    fn TtyReceive(tty_id: c_int, buf: *mut u8, max_len: c_int) -> c_int;
    fn Halt() -> !;
    fn helper_abort(msg: *const u8) -> !;
    fn helper_new_pid(page_table: *const c_void) -> c_int;
    fn helper_retire_pid(pid: c_int);
    fn helper_trace(buf: *const u8, len: c_int);
    static _first_kernel_text_page: c_uint;
    static _first_kernel_data_page: c_uint;
    static _orig_kernel_brk_page: c_uint;
}

pub fn write_register(reg: Register, value: usize) {
    #[cfg(not(test))]
    unsafe {
        WriteRegister(reg as c_uint, value as c_uint)
    };
    #[cfg(test)]
    mock::write_register(reg, value);
}

pub fn read_register(reg: Register) -> usize {
    #[cfg(not(test))]
    return unsafe { ReadRegister(reg as c_uint) as usize };
    #[cfg(test)]
    return mock::read_register(reg);
}

pub fn flush_tlb(scope: TlbScope) {
    let value = match scope {
        TlbScope::All => TLB_FLUSH_ALL,
        TlbScope::Kernel => TLB_FLUSH_KERNEL,
        TlbScope::User => TLB_FLUSH_USER,
    };
    write_register(Register::TlbFlush, value);
}

/// Runs `f` on the hardware's saved kernel context. Returns the simulator's
/// status code: nonzero means the switch could not be performed.
pub fn context_switch(f: ContextCallback, a: *mut c_void, b: *mut c_void) -> i32 {
    #[cfg(not(test))]
    return unsafe { KernelContextSwitch(f, a, b) };
    #[cfg(test)]
    return mock::context_switch(f, a, b);
}

/// Starts an asynchronous transmit; completion arrives as a transmit trap.
/// The buffer must stay alive until then.
pub fn tty_transmit(tty_id: usize, buf: &[u8]) {
    #[cfg(not(test))]
    unsafe {
        TtyTransmit(tty_id as c_int, buf.as_ptr(), buf.len() as c_int)
    };
    #[cfg(test)]
    mock::tty_transmit(tty_id, buf);
}

/// Pulls the ready input line for `tty_id` into `buf`, returning its length.
pub fn tty_receive(tty_id: usize, buf: &mut [u8]) -> usize {
    #[cfg(not(test))]
    return unsafe { TtyReceive(tty_id as c_int, buf.as_mut_ptr(), buf.len() as c_int) as usize };
    #[cfg(test)]
    return mock::tty_receive(tty_id, buf);
}

pub fn halt() -> ! {
    #[cfg(not(test))]
    unsafe {
        Halt()
    };
    #[cfg(test)]
    panic!("machine halted");
}

/// Aborts the machine through the host. Boot-time failures land here.
pub fn abort(msg: &str) -> ! {
    #[cfg(not(test))]
    {
        // helper_abort wants a NUL-terminated string.
        let mut buf = [0u8; 128];
        let n = msg.len().min(buf.len() - 1);
        buf[..n].copy_from_slice(&msg.as_bytes()[..n]);
        unsafe { helper_abort(buf.as_ptr()) };
    };
    #[cfg(test)]
    panic!("machine aborted: {}", msg);
}

pub fn new_pid(page_table: *const c_void) -> i32 {
    #[cfg(not(test))]
    return unsafe { helper_new_pid(page_table) };
    #[cfg(test)]
    return mock::new_pid(page_table);
}

pub fn retire_pid(pid: i32) {
    #[cfg(not(test))]
    unsafe {
        helper_retire_pid(pid)
    };
    #[cfg(test)]
    mock::retire_pid(pid);
}

pub fn trace_write(buf: &[u8]) {
    #[cfg(not(test))]
    unsafe {
        helper_trace(buf.as_ptr(), buf.len() as c_int)
    };
    #[cfg(test)]
    mock::trace_write(buf);
}

pub fn first_kernel_text_page() -> usize {
    #[cfg(not(test))]
    return unsafe { _first_kernel_text_page as usize };
    #[cfg(test)]
    return mock::FIRST_KERNEL_TEXT_PAGE;
}

pub fn first_kernel_data_page() -> usize {
    #[cfg(not(test))]
    return unsafe { _first_kernel_data_page as usize };
    #[cfg(test)]
    return mock::FIRST_KERNEL_DATA_PAGE;
}

pub fn orig_kernel_brk_page() -> usize {
    #[cfg(not(test))]
    return unsafe { _orig_kernel_brk_page as usize };
    #[cfg(test)]
    return mock::ORIG_KERNEL_BRK_PAGE;
}

/* ── Raw memory through the current mappings ────────────────────────── */

/// Copies one page between virtual addresses through the active mappings.
///
/// # Safety
/// Both addresses must be page-aligned and mapped writable/readable for a
/// full page.
pub unsafe fn mem_copy_page(dst_vaddr: usize, src_vaddr: usize) {
    #[cfg(not(test))]
    core::ptr::copy_nonoverlapping(src_vaddr as *const u8, dst_vaddr as *mut u8, PAGESIZE);
    #[cfg(test)]
    mock::mem_copy_page(dst_vaddr, src_vaddr);
}

/// Zeroes one page through the active mappings.
///
/// # Safety
/// The address must be page-aligned and mapped writable for a full page.
pub unsafe fn mem_zero_page(vaddr: usize) {
    #[cfg(not(test))]
    core::ptr::write_bytes(vaddr as *mut u8, 0, PAGESIZE);
    #[cfg(test)]
    mock::mem_zero_page(vaddr);
}
