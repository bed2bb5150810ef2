//! Pipe syscalls.

use super::{set_return, syscall_args};
use crate::hardware::ERROR;
use crate::ipc::REGISTRY;
use crate::scheduler::context;
use crate::scheduler::pcb::BlockReason;
use crate::scheduler::PROCESS_TABLE;

pub fn sys_pipe_init() {
    let (id_arg, _, _) = syscall_args();
    let id_ptr = id_arg as *mut i32;
    if id_ptr.is_null() {
        set_return(ERROR as usize);
        return;
    }
    let pipe_id = REGISTRY.lock().create_pipe();
    unsafe { *id_ptr = pipe_id };
    crate::log_info!("created pipe {}", pipe_id);
    set_return(0);
}

pub fn sys_pipe_read() {
    let (id_arg, buf_arg, len_arg) = syscall_args();
    let pipe_id = id_arg as i32;

    let empty = match REGISTRY.lock().pipe(pipe_id) {
        Some(pipe) => pipe.is_empty(),
        None => {
            crate::log_warn!("pipe_read: no pipe {}", pipe_id);
            set_return(ERROR as usize);
            return;
        }
    };

    let cur = PROCESS_TABLE.lock().current_pid();
    if empty {
        // Nothing buffered: sleep until a writer or clock tick wakes us.
        let next = PROCESS_TABLE
            .lock()
            .block_current(BlockReason::PipeRead(pipe_id));
        if context::switch_to(cur, next).is_err() {
            crate::log_error!("pipe_read: could not switch away");
            PROCESS_TABLE.lock().cancel_block(cur);
            set_return(ERROR as usize);
            return;
        }
        context::activate_current_address_space();
    }

    let out = unsafe { core::slice::from_raw_parts_mut(buf_arg as *mut u8, len_arg) };
    let copied = match REGISTRY.lock().pipe_mut(pipe_id) {
        Some(pipe) => pipe.read(out),
        None => {
            set_return(ERROR as usize);
            return;
        }
    };
    if let Some(pcb) = PROCESS_TABLE.lock().pcb_mut(cur) {
        pcb.user_ctx.regs[0] = copied;
    }
}

pub fn sys_pipe_write() {
    let (id_arg, buf_arg, len_arg) = syscall_args();
    let pipe_id = id_arg as i32;
    let data = unsafe { core::slice::from_raw_parts(buf_arg as *const u8, len_arg) };

    let written = {
        let mut registry = REGISTRY.lock();
        match registry.pipe_mut(pipe_id) {
            Some(pipe) => pipe.write(data),
            None => {
                crate::log_warn!("pipe_write: no pipe {}", pipe_id);
                set_return(ERROR as usize);
                return;
            }
        }
    };

    match written {
        Ok(count) => {
            // Fresh bytes: release everyone blocked reading this pipe.
            let mut table = PROCESS_TABLE.lock();
            let readers =
                table.blocked_where(|r| *r == BlockReason::PipeRead(pipe_id));
            for pid in readers {
                table.wake(pid);
            }
            drop(table);
            set_return(count);
        }
        Err(e) => {
            crate::log_warn!("pipe_write: {}", e);
            set_return(ERROR as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock;
    use crate::hardware::UserContext;
    use crate::ipc::Registry;
    use crate::memory::paging;
    use crate::scheduler::pcb::{Pcb, IDLE_PID};
    use crate::scheduler::ProcessTable;

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
        *REGISTRY.lock() = Registry::new();
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
    fn init_writes_a_negative_id_out() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2], 2);

        let mut pipe_id: i32 = 0;
        set_args(2, [&mut pipe_id as *mut i32 as usize, 0, 0]);
        sys_pipe_init();

        assert_eq!(return_value(2), 0);
        assert_eq!(pipe_id, -1);
        assert!(REGISTRY.lock().pipe(pipe_id).is_some());
    }

    #[test]
    fn write_then_read_round_trips_through_the_syscalls() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2], 2);
        let pipe_id = REGISTRY.lock().create_pipe();

        let payload = *b"hello";
        set_args(2, [pipe_id as usize, payload.as_ptr() as usize, 5]);
        sys_pipe_write();
        assert_eq!(return_value(2), 5);

        // A read for more than is buffered returns what is there.
        let mut out = [0u8; 10];
        set_args(2, [pipe_id as usize, out.as_mut_ptr() as usize, 10]);
        sys_pipe_read();
        assert_eq!(return_value(2), 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn write_wakes_blocked_readers() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2, 3], 3);
        let pipe_id = REGISTRY.lock().create_pipe();

        // Pid 3 is blocked mid-read the way an empty-pipe read leaves it.
        {
            let mut table = PROCESS_TABLE.lock();
            table.block_current(BlockReason::PipeRead(pipe_id));
            table.set_current(2);
        }

        let payload = *b"ping";
        set_args(2, [pipe_id as usize, payload.as_ptr() as usize, 4]);
        sys_pipe_write();

        assert_eq!(return_value(2), 4);
        let table = PROCESS_TABLE.lock();
        assert_eq!(table.ready_pids(), alloc::vec![3]);
        assert!(table.blocked_pids().is_empty());
    }

    #[test]
    fn operations_on_unknown_pipes_fail() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2], 2);

        let mut out = [0u8; 4];
        set_args(2, [(-9i32) as usize, out.as_mut_ptr() as usize, 4]);
        sys_pipe_read();
        assert_eq!(return_value(2), ERROR as usize);

        set_args(2, [(-9i32) as usize, out.as_ptr() as usize, 4]);
        sys_pipe_write();
        assert_eq!(return_value(2), ERROR as usize);
    }

    #[test]
    fn full_pipe_write_fails_without_partial_effect() {
        let _guard = mock::machine_lock();
        setup(&[IDLE_PID, 2], 2);
        let pipe_id = REGISTRY.lock().create_pipe();

        let big = [9u8; crate::hardware::PIPE_BUFFER_LEN];
        set_args(2, [pipe_id as usize, big.as_ptr() as usize, big.len()]);
        sys_pipe_write();
        assert_eq!(return_value(2), ERROR as usize);
        assert!(REGISTRY.lock().pipe(pipe_id).unwrap().is_empty());
    }
}
