//! Synchronization syscalls: locks, condition variables, reclaim.

use super::{set_return, syscall_args};
use crate::error::{KernelError, KernelResult};
use crate::hardware::ERROR;
use crate::ipc::{self, ObjectKind, REGISTRY};
use crate::scheduler::context;
use crate::scheduler::pcb::BlockReason;
use crate::scheduler::PROCESS_TABLE;

pub fn sys_lock_init() {
    let (id_arg, _, _) = syscall_args();
    let id_ptr = id_arg as *mut i32;
    if id_ptr.is_null() {
        set_return(ERROR as usize);
        return;
    }
    let lock_id = REGISTRY.lock().create_lock();
    unsafe { *id_ptr = lock_id };
    crate::log_info!("created lock {}", lock_id);
    set_return(0);
}

pub fn sys_lock_acquire() {
    let (id_arg, _, _) = syscall_args();
    match acquire_or_wait(id_arg as i32) {
        Ok(()) => set_return(0),
        Err(e) => {
            crate::log_warn!("lock_acquire: {}", e);
            set_return(ERROR as usize);
        }
    }
}

/// Takes the lock now if it is free, otherwise parks the caller on the
/// lock's wait queue until a release hands it over. Shared with the
/// reacquisition path of `cvar_wait`.
pub(crate) fn acquire_or_wait(lock_id: i32) -> KernelResult<()> {
    let (cur, next) = {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        let lock = registry.lock_mut(lock_id).ok_or(KernelError::NotFound)?;
        if !lock.is_held() {
            lock.set_held(true);
            table.current_mut().held_lock = Some(lock_id);
            return Ok(());
        }
        let cur = table.current_pid();
        lock.push_waiter(cur);
        let next = table.park_current(BlockReason::LockWait(lock_id));
        (cur, next)
    };

    if let Err(e) = context::switch_to(cur, next) {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        if let Some(lock) = registry.lock_mut(lock_id) {
            lock.remove_waiter(cur);
        }
        table.cancel_block(cur);
        return Err(e);
    }

    // The releaser already took us off the wait queue; claim the lock
    // outright. Unconditional on one logical CPU, where nothing can race
    // the handoff.
    {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        if let Some(lock) = registry.lock_mut(lock_id) {
            lock.set_held(true);
        }
        if let Some(pcb) = table.pcb_mut(cur) {
            pcb.held_lock = Some(lock_id);
        }
    }
    context::activate_current_address_space();
    Ok(())
}

pub fn sys_lock_release() {
    let (id_arg, _, _) = syscall_args();
    let lock_id = id_arg as i32;
    let result = (|| -> KernelResult<()> {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        if table.current().held_lock != Some(lock_id) {
            return Err(KernelError::NotOwner);
        }
        let lock = registry.lock_mut(lock_id).ok_or(KernelError::NotFound)?;
        lock.set_held(false);
        table.current_mut().held_lock = None;
        if let Some(waiter) = lock.take_earliest_waiter() {
            table.wake(waiter);
        }
        Ok(())
    })();
    match result {
        Ok(()) => set_return(0),
        Err(e) => {
            crate::log_warn!("lock_release: {}", e);
            set_return(ERROR as usize);
        }
    }
}

pub fn sys_cvar_init() {
    let (id_arg, _, _) = syscall_args();
    let id_ptr = id_arg as *mut i32;
    if id_ptr.is_null() {
        set_return(ERROR as usize);
        return;
    }
    let cvar_id = REGISTRY.lock().create_cvar();
    unsafe { *id_ptr = cvar_id };
    crate::log_info!("created cvar {}", cvar_id);
    set_return(0);
}

pub fn sys_cvar_signal() {
    let (id_arg, _, _) = syscall_args();
    let cvar_id = id_arg as i32;
    let result = (|| -> KernelResult<()> {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        let cvar = registry.cvar_mut(cvar_id).ok_or(KernelError::NotFound)?;
        if let Some(waiter) = cvar.take_newest_waiter() {
            table.wake(waiter);
        }
        Ok(())
    })();
    match result {
        Ok(()) => set_return(0),
        Err(e) => {
            crate::log_warn!("cvar_signal: {}", e);
            set_return(ERROR as usize);
        }
    }
}

pub fn sys_cvar_broadcast() {
    let (id_arg, _, _) = syscall_args();
    let cvar_id = id_arg as i32;
    let result = (|| -> KernelResult<()> {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        let cvar = registry.cvar_mut(cvar_id).ok_or(KernelError::NotFound)?;
        for waiter in cvar.drain_waiters() {
            table.wake(waiter);
        }
        Ok(())
    })();
    match result {
        Ok(()) => set_return(0),
        Err(e) => {
            crate::log_warn!("cvar_broadcast: {}", e);
            set_return(ERROR as usize);
        }
    }
}

pub fn sys_cvar_wait() {
    let (cvar_arg, lock_arg, _) = syscall_args();
    let cvar_id = cvar_arg as i32;
    let lock_id = lock_arg as i32;

    let prepared = (|| -> KernelResult<(i32, i32)> {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        if table.current().held_lock != Some(lock_id) {
            return Err(KernelError::NotOwner);
        }
        // Hand the lock back without waking any queued acquirer; whoever is
        // queued gets it at the next release.
        let lock = registry.lock_mut(lock_id).ok_or(KernelError::NotFound)?;
        lock.set_held(false);
        table.current_mut().held_lock = None;

        let cur = table.current_pid();
        let cvar = registry.cvar_mut(cvar_id).ok_or(KernelError::NotFound)?;
        cvar.push_waiter(cur);
        let next = table.park_current(BlockReason::CvarWait {
            cvar: cvar_id,
            lock: lock_id,
        });
        Ok((cur, next))
    })();

    let (cur, next) = match prepared {
        Ok(pair) => pair,
        Err(e) => {
            crate::log_warn!("cvar_wait: {}", e);
            set_return(ERROR as usize);
            return;
        }
    };

    if context::switch_to(cur, next).is_err() {
        let mut table = PROCESS_TABLE.lock();
        let mut registry = REGISTRY.lock();
        if let Some(cvar) = registry.cvar_mut(cvar_id) {
            cvar.remove_waiter(cur);
        }
        table.cancel_block(cur);
        drop(registry);
        drop(table);
        set_return(ERROR as usize);
        return;
    }

    // Signaled: take the lock back before returning to the caller.
    context::activate_current_address_space();
    match acquire_or_wait(lock_id) {
        Ok(()) => {
            if let Some(pcb) = PROCESS_TABLE.lock().pcb_mut(cur) {
                pcb.user_ctx.regs[0] = 0;
            }
        }
        Err(e) => {
            crate::log_warn!("cvar_wait: reacquire: {}", e);
            if let Some(pcb) = PROCESS_TABLE.lock().pcb_mut(cur) {
                pcb.user_ctx.regs[0] = ERROR as usize;
            }
        }
    }
}

pub fn sys_reclaim() {
    let (id_arg, _, _) = syscall_args();
    let object_id = id_arg as i32;

    let result = match ipc::classify(object_id) {
        None => Err(KernelError::InvalidArgument),
        Some(ObjectKind::Pipe) => {
            let has_reader = PROCESS_TABLE
                .lock()
                .first_blocked_where(|r| *r == BlockReason::PipeRead(object_id))
                .is_some();
            REGISTRY.lock().reclaim_pipe(object_id, has_reader)
        }
        Some(ObjectKind::Lock) => {
            let mut table = PROCESS_TABLE.lock();
            let holds = table.current().held_lock == Some(object_id);
            let result = REGISTRY.lock().reclaim_lock(object_id, holds);
            if result.is_ok() {
                table.current_mut().held_lock = None;
            }
            result
        }
        Some(ObjectKind::Cvar) => REGISTRY.lock().reclaim_cvar(object_id),
    };

    match result {
        Ok(()) => set_return(0),
        Err(e) => {
            crate::log_warn!("reclaim({}): {}", object_id, e);
            set_return(ERROR as usize);
        }
    }
}
