//! Software stand-in for the simulator, compiled only into test builds.
//!
//! Registers become a plain array, TLB flushes are counted, terminal input is
//! scripted by the test, transmits are captured, and a kernel-context switch
//! invokes the callback immediately and returns. Tests that touch the boot
//! globals serialize through [`machine_lock`].

use super::{ContextCallback, KernelContext, Register, TlbScope};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::{Mutex, MutexGuard};

pub const FIRST_KERNEL_TEXT_PAGE: usize = 1;
pub const FIRST_KERNEL_DATA_PAGE: usize = 4;
pub const ORIG_KERNEL_BRK_PAGE: usize = 8;

static TEST_MUTEX: Mutex<()> = Mutex::new(());

static REGISTERS: Mutex<[usize; 8]> = Mutex::new([0; 8]);
static FLUSHES: Mutex<[usize; 3]> = Mutex::new([0; 3]);
static TTY_INPUT: Mutex<Vec<VecDeque<Vec<u8>>>> = Mutex::new(Vec::new());
static TRANSMITS: Mutex<Vec<(usize, Vec<u8>)>> = Mutex::new(Vec::new());
static TRACE_LOG: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static NEXT_PID: AtomicI32 = AtomicI32::new(0);

/// Serializes tests that mutate the crate-wide boot state (frame pool,
/// kernel page table, process table, registries).
pub fn machine_lock() -> MutexGuard<'static, ()> {
    TEST_MUTEX.lock()
}

pub fn reset() {
    *REGISTERS.lock() = [0; 8];
    *FLUSHES.lock() = [0; 3];
    TTY_INPUT.lock().clear();
    TRANSMITS.lock().clear();
    TRACE_LOG.lock().clear();
    NEXT_PID.store(0, Ordering::SeqCst);
}

pub fn write_register(reg: Register, value: usize) {
    if reg == Register::TlbFlush {
        let idx = match value {
            super::TLB_FLUSH_ALL => 0,
            super::TLB_FLUSH_KERNEL => 1,
            _ => 2,
        };
        FLUSHES.lock()[idx] += 1;
        return;
    }
    REGISTERS.lock()[reg as usize] = value;
}

pub fn read_register(reg: Register) -> usize {
    REGISTERS.lock()[reg as usize]
}

pub fn flush_count(scope: TlbScope) -> usize {
    let idx = match scope {
        TlbScope::All => 0,
        TlbScope::Kernel => 1,
        TlbScope::User => 2,
    };
    FLUSHES.lock()[idx]
}

pub fn context_switch(f: ContextCallback, a: *mut c_void, b: *mut c_void) -> i32 {
    let kc = KernelContext::zeroed();
    let returned = f(&kc, a, b);
    if returned.is_null() {
        return super::ERROR;
    }
    0
}

pub fn push_tty_input(tty_id: usize, line: &[u8]) {
    let mut input = TTY_INPUT.lock();
    while input.len() <= tty_id {
        input.push(VecDeque::new());
    }
    input[tty_id].push_back(line.to_vec());
}

pub fn tty_receive(tty_id: usize, buf: &mut [u8]) -> usize {
    let mut input = TTY_INPUT.lock();
    let queue = match input.get_mut(tty_id) {
        Some(q) => q,
        None => return 0,
    };
    let line = match queue.pop_front() {
        Some(l) => l,
        None => return 0,
    };
    let n = line.len().min(buf.len());
    buf[..n].copy_from_slice(&line[..n]);
    n
}

pub fn tty_transmit(tty_id: usize, buf: &[u8]) {
    TRANSMITS.lock().push((tty_id, buf.to_vec()));
}

pub fn take_transmits() -> Vec<(usize, Vec<u8>)> {
    core::mem::take(&mut *TRANSMITS.lock())
}

pub fn new_pid(_page_table: *const c_void) -> i32 {
    NEXT_PID.fetch_add(1, Ordering::SeqCst)
}

pub fn retire_pid(_pid: i32) {}

pub fn trace_write(buf: &[u8]) {
    TRACE_LOG.lock().extend_from_slice(buf);
}

pub fn mem_copy_page(_dst_vaddr: usize, _src_vaddr: usize) {}

pub fn mem_zero_page(_vaddr: usize) {}
