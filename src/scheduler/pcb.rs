use crate::hardware::{self, KernelContext, UserContext, KERNEL_STACK_PAGES};
use crate::memory::paging::PageTable;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ffi::c_void;

/// Process identifier, issued and retired by the host.
pub type Pid = i32;

pub const INIT_PID: Pid = 0;

/// The idle process runs only when nothing else is ready and is never
/// queued.
pub const IDLE_PID: Pid = 1;

/// Why a process is off the CPU. A blocked PCB carries exactly one reason;
/// the wakeup source clears it when moving the PCB back to ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Sleeping for this many remaining clock ticks.
    Delay(u32),
    /// Waiting for any child to exit.
    WaitChild,
    /// Waiting for the pipe with this id to become non-empty.
    PipeRead(i32),
    /// Waiting for an input line on this terminal.
    TtyRead(usize),
    /// Waiting for this terminal to go idle before transmitting.
    TtyWriteAwaitIdle(usize),
    /// Waiting for our own transmit on this terminal to complete.
    TtyWriteAwaitDone(usize),
    /// Queued on this lock.
    LockWait(i32),
    /// Queued on this cvar; reacquires the lock on wakeup.
    CvarWait { cvar: i32, lock: i32 },
}

/// Process control block. Lives boxed in the process table so the saved
/// kernel context has a stable address for the switch protocol.
pub struct Pcb {
    pub pid: Pid,
    pub user_ctx: UserContext,
    pub kernel_ctx: KernelContext,
    /// Region-1 table; released at exit, before the PCB itself goes away.
    pub page_table: Option<Box<PageTable>>,
    /// Physical frames backing this process's kernel stack, top page first.
    pub kernel_stack_frames: [usize; KERNEL_STACK_PAGES],
    pub last_user_data_page: usize,
    pub last_user_stack_page: usize,
    pub brk_page: usize,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub exit_status: i32,
    pub block: Option<BlockReason>,
    pub held_lock: Option<i32>,
}

impl Pcb {
    /// Builds a PCB with a host-issued pid.
    pub fn new(
        user_ctx: UserContext,
        page_table: Box<PageTable>,
        kernel_stack_frames: [usize; KERNEL_STACK_PAGES],
    ) -> Box<Pcb> {
        let pid = hardware::new_pid(page_table.base_addr() as *const c_void);
        Self::with_pid(pid, user_ctx, page_table, kernel_stack_frames)
    }

    pub fn with_pid(
        pid: Pid,
        user_ctx: UserContext,
        page_table: Box<PageTable>,
        kernel_stack_frames: [usize; KERNEL_STACK_PAGES],
    ) -> Box<Pcb> {
        Box::new(Pcb {
            pid,
            user_ctx,
            kernel_ctx: KernelContext::zeroed(),
            page_table: Some(page_table),
            kernel_stack_frames,
            last_user_data_page: 0,
            last_user_stack_page: 0,
            brk_page: 0,
            parent: None,
            children: Vec::new(),
            exit_status: 0,
            block: None,
            held_lock: None,
        })
    }
}
