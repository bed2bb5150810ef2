//! Terminal engine.
//!
//! Each hardware tty gets a growable line buffer fed by the receive trap and
//! a single transmit slot guarded by the busy flag: one in-flight transmit
//! per terminal, with the completion trap handing the terminal to the next
//! waiting writer.

use crate::hardware::{self, NUM_TERMINALS, TERMINAL_MAX_LINE};
use crate::scheduler::pcb::BlockReason;
use crate::scheduler::{ProcessTable, PROCESS_TABLE};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Starting size of a terminal's receive buffer; doubles on demand.
pub const INITIAL_LINE_BUFFER: usize = 1024;

pub struct Terminal {
    tty_id: usize,
    buffer: Vec<u8>,
    next_write: usize,
    busy: bool,
    inflight: Option<Box<[u8]>>,
}

impl Terminal {
    pub fn new(tty_id: usize) -> Self {
        Terminal {
            tty_id,
            buffer: vec![0; INITIAL_LINE_BUFFER],
            next_write: 0,
            busy: false,
            inflight: None,
        }
    }

    pub fn tty_id(&self) -> usize {
        self.tty_id
    }

    pub fn has_input(&self) -> bool {
        self.next_write > 0
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Doubles the buffer whenever the next full-length line would not fit.
    fn ensure_line_capacity(&mut self) {
        if self.next_write + TERMINAL_MAX_LINE >= self.buffer.len() {
            let new_len = self.buffer.len() * 2;
            self.buffer.resize(new_len, 0);
            crate::log_info!("Expanded terminal {} buffer to {} bytes.", self.tty_id, new_len);
        }
    }

    /// Pulls the ready input line from the hardware into the buffer.
    /// Returns how many bytes arrived.
    pub fn pull_hardware_line(&mut self) -> usize {
        self.ensure_line_capacity();
        let start = self.next_write;
        let n = hardware::tty_receive(self.tty_id, &mut self.buffer[start..start + TERMINAL_MAX_LINE]);
        self.next_write += n;
        n
    }

    /// Copies the first buffered line (through its newline, bounded by
    /// `out`) into `out`, shifts the remainder down, and zeroes the tail.
    /// Returns the bytes copied.
    pub fn read_line(&mut self, out: &mut [u8]) -> usize {
        if self.next_write == 0 || out.is_empty() {
            return 0;
        }
        let mut n = 1;
        while n < out.len() && n < self.next_write && self.buffer[n - 1] != b'\n' {
            n += 1;
        }
        out[..n].copy_from_slice(&self.buffer[..n]);

        self.buffer.copy_within(n..self.next_write, 0);
        for slot in &mut self.buffer[self.next_write - n..self.next_write] {
            *slot = 0;
        }
        self.next_write -= n;
        n
    }

    /// Marks the terminal busy and starts an asynchronous transmit. The
    /// chunk stays owned here until the completion trap releases it.
    pub fn begin_transmit(&mut self, chunk: Box<[u8]>) {
        self.busy = true;
        self.inflight = Some(chunk);
        let buf = self.inflight.as_ref().expect("transmit buffer just stored");
        hardware::tty_transmit(self.tty_id, buf);
    }

    pub fn finish_transmit(&mut self) {
        self.busy = false;
        self.inflight = None;
    }
}

pub static TERMINALS: Mutex<Vec<Terminal>> = Mutex::new(Vec::new());

pub fn init() {
    let mut terminals = TERMINALS.lock();
    for tty_id in 0..NUM_TERMINALS {
        terminals.push(Terminal::new(tty_id));
    }
    drop(terminals);
    crate::log_info!("Terminal subsystem initialized for {} ttys.", NUM_TERMINALS);
}

/// Receive trap: buffer the incoming line, then wake one blocked reader of
/// this terminal.
pub fn handle_receive_trap(tty_id: usize) {
    if tty_id >= NUM_TERMINALS {
        return;
    }
    {
        let mut terminals = TERMINALS.lock();
        terminals[tty_id].pull_hardware_line();
    }
    let mut table = PROCESS_TABLE.lock();
    if let Some(pid) = table.first_blocked_where(|r| *r == BlockReason::TtyRead(tty_id)) {
        table.wake(pid);
    }
}

/// Transmit-complete trap.
pub fn handle_transmit_trap(tty_id: usize) {
    if tty_id >= NUM_TERMINALS {
        return;
    }
    let mut terminals = TERMINALS.lock();
    let mut table = PROCESS_TABLE.lock();
    transmit_wakeups(&mut table, &mut terminals[tty_id]);
}

/// Releases the finished transmit, wakes the writer it belonged to, then
/// hands the terminal to the next writer waiting for it to go idle. Marking
/// the terminal busy at wakeup reserves it until that writer runs.
pub(crate) fn transmit_wakeups(table: &mut ProcessTable, terminal: &mut Terminal) {
    terminal.finish_transmit();
    let tty_id = terminal.tty_id();

    if let Some(pid) = table.first_blocked_where(|r| *r == BlockReason::TtyWriteAwaitDone(tty_id)) {
        table.wake(pid);
    }
    if let Some(pid) = table.first_blocked_where(|r| *r == BlockReason::TtyWriteAwaitIdle(tty_id)) {
        terminal.set_busy(true);
        table.wake(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock;
    use crate::hardware::UserContext;
    use crate::memory::paging;
    use crate::scheduler::pcb::{Pcb, IDLE_PID};
    use alloc::vec;

    fn table_with(pids: &[i32]) -> ProcessTable {
        let mut table = ProcessTable::new();
        for &pid in pids {
            table.insert(Pcb::with_pid(
                pid,
                UserContext::zeroed(),
                paging::new_user_page_table(),
                [0, 0],
            ));
        }
        table
    }

    #[test]
    fn read_line_returns_one_line_and_shifts_the_rest() {
        let mut terminal = Terminal::new(0);
        terminal.buffer[..10].copy_from_slice(b"abc\ndefgh\n");
        terminal.next_write = 10;

        let mut out = [0u8; 64];
        assert_eq!(terminal.read_line(&mut out), 4);
        assert_eq!(&out[..4], b"abc\n");
        assert_eq!(terminal.next_write, 6);
        assert_eq!(&terminal.buffer[..6], b"defgh\n");
        assert_eq!(&terminal.buffer[6..10], &[0, 0, 0, 0]);

        assert_eq!(terminal.read_line(&mut out), 6);
        assert_eq!(&out[..6], b"defgh\n");
        assert!(!terminal.has_input());
    }

    #[test]
    fn read_line_honors_a_short_caller_buffer() {
        let mut terminal = Terminal::new(0);
        terminal.buffer[..6].copy_from_slice(b"abcde\n");
        terminal.next_write = 6;

        let mut out = [0u8; 3];
        assert_eq!(terminal.read_line(&mut out), 3);
        assert_eq!(&out, b"abc");
        // The rest of the line is still there for the next read.
        assert_eq!(terminal.next_write, 3);
        assert_eq!(&terminal.buffer[..3], b"de\n");
    }

    #[test]
    fn receive_grows_the_buffer_by_doubling() {
        let _guard = mock::machine_lock();
        mock::reset();

        let mut terminal = Terminal::new(1);
        assert_eq!(terminal.buffer.len(), INITIAL_LINE_BUFFER);
        // Park enough unread input that the next line cannot fit.
        terminal.next_write = INITIAL_LINE_BUFFER - 10;

        mock::push_tty_input(1, b"hello\n");
        assert_eq!(terminal.pull_hardware_line(), 6);
        assert_eq!(terminal.buffer.len(), INITIAL_LINE_BUFFER * 2);
        let start = INITIAL_LINE_BUFFER - 10;
        assert_eq!(&terminal.buffer[start..start + 6], b"hello\n");
    }

    #[test]
    fn transmit_completion_hands_the_terminal_to_the_next_writer() {
        let mut table = table_with(&[IDLE_PID, 2, 3]);
        let mut terminal = Terminal::new(0);

        // Pid 2 owns the in-flight transmit; pid 3 waits for idle.
        terminal.set_busy(true);
        table.set_current(2);
        table.block_current(BlockReason::TtyWriteAwaitDone(0));
        table.set_current(3);
        table.block_current(BlockReason::TtyWriteAwaitIdle(0));

        transmit_wakeups(&mut table, &mut terminal);

        // Both writers are runnable again and the terminal is reserved for
        // pid 3's upcoming transmit.
        let mut ready = table.ready_pids();
        ready.sort_unstable();
        assert_eq!(ready, vec![2, 3]);
        assert!(table.blocked_pids().is_empty());
        assert!(terminal.is_busy());
    }

    #[test]
    fn transmit_completion_with_no_waiters_leaves_the_terminal_idle() {
        let mut table = table_with(&[IDLE_PID]);
        let mut terminal = Terminal::new(2);
        terminal.set_busy(true);

        transmit_wakeups(&mut table, &mut terminal);
        assert!(!terminal.is_busy());
    }
}
