pub mod context;
pub mod pcb;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use self::pcb::{BlockReason, Pcb, Pid, IDLE_PID};
use spin::Mutex;

/// All PCBs plus the queues that give each one its single residence:
/// running, ready, blocked, defunct, or parked on some object's wait queue.
///
/// The ready queue is FIFO worn sideways: arrivals push the front, the
/// scheduler takes the back. The blocked and defunct lists keep the newest
/// entry first.
pub struct ProcessTable {
    procs: BTreeMap<Pid, Box<Pcb>>,
    current: Pid,
    idle: Pid,
    ready: VecDeque<Pid>,
    blocked: Vec<Pid>,
    defunct: Vec<Pid>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        ProcessTable {
            procs: BTreeMap::new(),
            current: 0,
            idle: IDLE_PID,
            ready: VecDeque::new(),
            blocked: Vec::new(),
            defunct: Vec::new(),
        }
    }

    pub fn insert(&mut self, pcb: Box<Pcb>) -> Pid {
        let pid = pcb.pid;
        self.procs.insert(pid, pcb);
        pid
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Box<Pcb>> {
        self.procs.remove(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn pcb(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.get(&pid).map(|b| &**b)
    }

    pub fn pcb_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.procs.get_mut(&pid).map(|b| &mut **b)
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    pub fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    pub fn set_idle(&mut self, pid: Pid) {
        self.idle = pid;
    }

    pub fn current(&self) -> &Pcb {
        self.pcb(self.current).expect("running PCB missing from table")
    }

    pub fn current_mut(&mut self) -> &mut Pcb {
        let pid = self.current;
        self.pcb_mut(pid).expect("running PCB missing from table")
    }

    /// Puts a runnable process at the head of the ready queue. The idle
    /// process is never queued.
    pub fn enqueue_ready(&mut self, pid: Pid) {
        if pid == self.idle {
            return;
        }
        self.ready.push_front(pid);
    }

    /// Takes the next process to run: the tail of the ready queue, or idle.
    pub fn pick_next(&mut self) -> Pid {
        self.ready.pop_back().unwrap_or(self.idle)
    }

    /// Moves the running process onto the blocked list with `reason` and
    /// returns the pid to switch into.
    pub fn block_current(&mut self, reason: BlockReason) -> Pid {
        let pid = self.current;
        if let Some(pcb) = self.pcb_mut(pid) {
            pcb.block = Some(reason);
        }
        self.blocked.insert(0, pid);
        self.pick_next()
    }

    /// Like `block_current`, but the caller parks the pid on an object's
    /// wait queue instead of the global blocked list.
    pub fn park_current(&mut self, reason: BlockReason) -> Pid {
        let pid = self.current;
        if let Some(pcb) = self.pcb_mut(pid) {
            pcb.block = Some(reason);
        }
        self.pick_next()
    }

    /// Makes a blocked or parked process runnable again.
    pub fn wake(&mut self, pid: Pid) {
        self.blocked.retain(|&p| p != pid);
        if let Some(pcb) = self.pcb_mut(pid) {
            pcb.block = None;
        }
        self.enqueue_ready(pid);
    }

    /// Backs out a block that never led to a switch: the pid stays running.
    pub fn cancel_block(&mut self, pid: Pid) {
        self.blocked.retain(|&p| p != pid);
        if let Some(pcb) = self.pcb_mut(pid) {
            pcb.block = None;
        }
    }

    /// Newest blocked pid whose reason satisfies `pred`.
    pub fn first_blocked_where(&self, pred: impl Fn(&BlockReason) -> bool) -> Option<Pid> {
        self.blocked
            .iter()
            .copied()
            .find(|&pid| match self.pcb(pid).and_then(|p| p.block.as_ref()) {
                Some(reason) => pred(reason),
                None => false,
            })
    }

    /// Every blocked pid whose reason satisfies `pred`, newest first.
    pub fn blocked_where(&self, pred: impl Fn(&BlockReason) -> bool) -> Vec<Pid> {
        self.blocked
            .iter()
            .copied()
            .filter(|&pid| match self.pcb(pid).and_then(|p| p.block.as_ref()) {
                Some(reason) => pred(reason),
                None => false,
            })
            .collect()
    }

    /// One clock tick's worth of wakeups over the blocked list: delays count
    /// down, child-waiters check the defunct list, pipe readers check for
    /// data.
    pub fn tick_wakeups(&mut self, pipe_has_data: impl Fn(i32) -> bool) {
        let snapshot: Vec<Pid> = self.blocked.clone();
        let mut to_wake = Vec::new();
        for pid in snapshot {
            let reason = match self.pcb(pid) {
                Some(pcb) => pcb.block,
                None => continue,
            };
            match reason {
                Some(BlockReason::Delay(ticks)) => {
                    let left = ticks.saturating_sub(1);
                    if let Some(pcb) = self.pcb_mut(pid) {
                        pcb.block = Some(BlockReason::Delay(left));
                    }
                    if left == 0 {
                        to_wake.push(pid);
                    }
                }
                Some(BlockReason::WaitChild) => {
                    if self.has_defunct_child(pid) {
                        to_wake.push(pid);
                    }
                }
                Some(BlockReason::PipeRead(pipe_id)) => {
                    if pipe_has_data(pipe_id) {
                        to_wake.push(pid);
                    }
                }
                _ => {}
            }
        }
        for pid in to_wake {
            self.wake(pid);
        }
    }

    pub fn has_defunct_child(&self, parent: Pid) -> bool {
        self.defunct
            .iter()
            .any(|&d| self.pcb(d).map_or(false, |p| p.parent == Some(parent)))
    }

    /// Moves an exited process onto the defunct list for its parent to reap.
    pub fn make_defunct(&mut self, pid: Pid) {
        self.defunct.insert(0, pid);
    }

    /// Consumes one defunct child of `parent`: drops the PCB, prunes the
    /// parent's child list, and returns the child's pid and exit status.
    pub fn reap_child(&mut self, parent: Pid) -> Option<(Pid, i32)> {
        let pos = self
            .defunct
            .iter()
            .position(|&d| self.pcb(d).map_or(false, |p| p.parent == Some(parent)))?;
        let child = self.defunct.remove(pos);
        let pcb = self.procs.remove(&child)?;
        if let Some(parent_pcb) = self.pcb_mut(parent) {
            parent_pcb.children.retain(|&c| c != child);
        }
        Some((child, pcb.exit_status))
    }

    pub fn ready_pids(&self) -> Vec<Pid> {
        self.ready.iter().copied().collect()
    }

    pub fn blocked_pids(&self) -> Vec<Pid> {
        self.blocked.clone()
    }

    pub fn defunct_pids(&self) -> Vec<Pid> {
        self.defunct.clone()
    }
}

pub static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
