//! Terminal syscalls.
//!
//! Reads are line-oriented against the terminal's receive buffer. Writes
//! chop the caller's buffer into transmit-sized chunks and ride the busy
//! flag: wait for the terminal, own it for one hardware transmit, sleep
//! until the completion trap, repeat.

use super::{set_return, syscall_args};
use crate::drivers::tty::TERMINALS;
use crate::hardware::{ERROR, NUM_TERMINALS, TERMINAL_MAX_LINE};
use crate::scheduler::context;
use crate::scheduler::pcb::BlockReason;
use crate::scheduler::PROCESS_TABLE;
use alloc::boxed::Box;

pub fn sys_tty_read() {
    let (tty_arg, buf_arg, len_arg) = syscall_args();
    let tty_id = tty_arg;
    if tty_id >= NUM_TERMINALS {
        crate::log_warn!("tty_read: no terminal {}", tty_id);
        set_return(ERROR as usize);
        return;
    }

    let cur = PROCESS_TABLE.lock().current_pid();
    let has_input = TERMINALS.lock()[tty_id].has_input();
    if !has_input {
        // Sleep until the receive trap buffers a line for this terminal.
        let next = PROCESS_TABLE
            .lock()
            .block_current(BlockReason::TtyRead(tty_id));
        if context::switch_to(cur, next).is_err() {
            crate::log_error!("tty_read: could not switch away");
            PROCESS_TABLE.lock().cancel_block(cur);
            set_return(ERROR as usize);
            return;
        }
        context::activate_current_address_space();
    }

    let out = unsafe { core::slice::from_raw_parts_mut(buf_arg as *mut u8, len_arg) };
    let copied = TERMINALS.lock()[tty_id].read_line(out);
    if let Some(pcb) = PROCESS_TABLE.lock().pcb_mut(cur) {
        pcb.user_ctx.regs[0] = copied;
    }
}

pub fn sys_tty_write() {
    let (tty_arg, buf_arg, len_arg) = syscall_args();
    let tty_id = tty_arg;
    if tty_id >= NUM_TERMINALS {
        crate::log_warn!("tty_write: no terminal {}", tty_id);
        set_return(ERROR as usize);
        return;
    }

    let cur = PROCESS_TABLE.lock().current_pid();
    let mut offset = 0;
    while offset < len_arg {
        if TERMINALS.lock()[tty_id].is_busy() {
            // Someone else's transmit is in flight; queue up for the
            // terminal. The completion trap re-reserves it for us.
            let next = PROCESS_TABLE
                .lock()
                .block_current(BlockReason::TtyWriteAwaitIdle(tty_id));
            if context::switch_to(cur, next).is_err() {
                crate::log_error!("tty_write: could not switch away");
                PROCESS_TABLE.lock().cancel_block(cur);
                set_return(ERROR as usize);
                return;
            }
            context::activate_current_address_space();
        }

        // Copy the next chunk out of user memory; the terminal owns it
        // until the transmit completes.
        let chunk_len = (len_arg - offset).min(TERMINAL_MAX_LINE);
        let chunk: Box<[u8]> = unsafe {
            core::slice::from_raw_parts((buf_arg as *const u8).add(offset), chunk_len)
        }
        .into();
        TERMINALS.lock()[tty_id].begin_transmit(chunk);

        let next = PROCESS_TABLE
            .lock()
            .block_current(BlockReason::TtyWriteAwaitDone(tty_id));
        if context::switch_to(cur, next).is_err() {
            crate::log_error!("tty_write: could not switch away");
            PROCESS_TABLE.lock().cancel_block(cur);
            set_return(ERROR as usize);
            return;
        }
        context::activate_current_address_space();
        offset += chunk_len;
    }

    if let Some(pcb) = PROCESS_TABLE.lock().pcb_mut(cur) {
        pcb.user_ctx.regs[0] = len_arg;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::tty::{self, Terminal};
    use crate::hardware::mock;
    use crate::hardware::UserContext;
    use crate::memory::paging;
    use crate::scheduler::pcb::{Pcb, IDLE_PID};
    use crate::scheduler::ProcessTable;
    use alloc::vec::Vec;

    fn setup(pids: &[i32], current: i32) {
        mock::reset();
        let mut table = ProcessTable::new();
        for &pid in pids {
            table.insert(Pcb::with_pid(
                pid,
                UserContext::zeroed(),
                paging::new_user_page_table(),
                [0, 0],
            ));
        }
        table.set_current(current);
        *PROCESS_TABLE.lock() = table;
        let mut terminals = Vec::new();
        for tty_id in 0..NUM_TERMINALS {
            terminals.push(Terminal::new(tty_id));
        }
        *TERMINALS.lock() = terminals;
    }

    fn set_args(pid: i32, args: [usize; 3]) {
        let mut table = PROCESS_TABLE.lock();
        let pcb = table.pcb_mut(pid).unwrap();
        pcb.user_ctx.regs[0] = args[0];
        pcb.user_ctx.regs[1] = args[1];
        pcb.user_ctx.regs[2] = args[2];
    }

    fn return_value(pid: i32) -> usize {
        PROCESS_TABLE.lock().pcb(pid).unwrap().user_ctx.regs[0]
    }

    #[test]
    fn buffered_line_is_read_without_blocking() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2], 2);
        mock::push_tty_input(1, b"input line\n");
        crate::drivers::tty::handle_receive_trap(1);

        let mut out = [0u8; 64];
        set_args(2, [1, out.as_mut_ptr() as usize, out.len()]);
        sys_tty_read();

        assert_eq!(return_value(2), 11);
        assert_eq!(&out[..11], b"input line\n");
        assert!(!TERMINALS.lock()[1].has_input());
    }

    #[test]
    fn receive_trap_wakes_a_blocked_reader() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2, 3], 3);
        {
            let mut table = PROCESS_TABLE.lock();
            table.block_current(BlockReason::TtyRead(0));
            table.set_current(2);
        }

        mock::push_tty_input(0, b"wake\n");
        tty::handle_receive_trap(0);

        let table = PROCESS_TABLE.lock();
        assert_eq!(table.ready_pids(), alloc::vec![3]);
        assert!(table.blocked_pids().is_empty());
    }

    #[test]
    fn write_transmits_whole_chunks_in_order() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2], 2);

        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        set_args(2, [0, data.as_ptr() as usize, data.len()]);
        sys_tty_write();

        assert_eq!(return_value(2), 1500);
        let transmits = mock::take_transmits();
        assert_eq!(transmits.len(), 2);
        assert_eq!(transmits[0].0, 0);
        assert_eq!(transmits[0].1.len(), TERMINAL_MAX_LINE);
        assert_eq!(&transmits[0].1[..], &data[..TERMINAL_MAX_LINE]);
        assert_eq!(&transmits[1].1[..], &data[TERMINAL_MAX_LINE..]);
    }

    #[test]
    fn bad_terminal_ids_are_rejected() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2], 2);

        let mut out = [0u8; 8];
        set_args(2, [NUM_TERMINALS, out.as_mut_ptr() as usize, out.len()]);
        sys_tty_read();
        assert_eq!(return_value(2), ERROR as usize);

        set_args(2, [NUM_TERMINALS, out.as_ptr() as usize, out.len()]);
        sys_tty_write();
        assert_eq!(return_value(2), ERROR as usize);
    }
}
