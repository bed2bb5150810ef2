//! Interface to the external program loader.
//!
//! The loader parses an executable, lays out text/data/stack frames in the
//! region-1 table it is handed, and fills in the entry user context. It
//! draws and returns physical frames through the two exported hooks below
//! and reports the resulting segment pages back through `LoadImage`.

use crate::error::{KernelError, KernelResult};
use crate::hardware::ERROR;
use crate::memory;
use crate::memory::paging::Pte;
use crate::scheduler::pcb::Pcb;
use crate::hardware::UserContext;
use core::ffi::{c_char, c_int};

/// The view of a process the loader works on.
#[repr(C)]
pub struct LoadImage {
    pub page_table: *mut Pte,
    pub page_table_len: usize,
    pub user_context: *mut UserContext,
    /// Segment geometry, in region-1 page numbers. In: the current layout.
    /// Out: the layout of the freshly loaded program.
    pub last_user_data_page: c_int,
    pub last_user_stack_page: c_int,
    pub brk_page: c_int,
}

#[cfg(not(test))]
extern "C" {
    fn LoadProgram(name: *const c_char, args: *const *const c_char, image: *mut LoadImage)
        -> c_int;
}

#[cfg(test)]
#[allow(non_snake_case)]
unsafe fn LoadProgram(
    name: *const c_char,
    _args: *const *const c_char,
    image: *mut LoadImage,
) -> c_int {
    if name.is_null() || image.is_null() {
        return ERROR;
    }
    (*(*image).user_context).pc = crate::hardware::VMEM_1_BASE;
    (*(*image).user_context).sp = crate::hardware::VMEM_1_LIMIT - 1;
    (*image).last_user_data_page = 2;
    (*image).last_user_stack_page = (crate::hardware::MAX_PT_LEN - 1) as c_int;
    (*image).brk_page = 3;
    0
}

/// Loads `name` into `pcb`'s address space. A NULL argv is forwarded as a
/// one-element vector holding the program path. On success the PCB's user
/// context and segment pages describe the new program; the loader has
/// already reclaimed whatever frames the old image held.
pub fn load_program(
    name: *const c_char,
    args: *const *const c_char,
    pcb: &mut Pcb,
) -> KernelResult<()> {
    if name.is_null() {
        return Err(KernelError::InvalidArgument);
    }
    let default_args: [*const c_char; 2] = [name, core::ptr::null()];
    let argv = if args.is_null() {
        default_args.as_ptr()
    } else {
        args
    };

    let table = pcb
        .page_table
        .as_mut()
        .ok_or(KernelError::InvalidArgument)?;
    let mut image = LoadImage {
        page_table: &mut table[0] as *mut Pte,
        page_table_len: crate::hardware::MAX_PT_LEN,
        user_context: &mut pcb.user_ctx,
        last_user_data_page: pcb.last_user_data_page as c_int,
        last_user_stack_page: pcb.last_user_stack_page as c_int,
        brk_page: pcb.brk_page as c_int,
    };

    let rc = unsafe { LoadProgram(name, argv, &mut image) };
    if rc != 0 {
        return Err(KernelError::LoadFailed);
    }
    pcb.last_user_data_page = image.last_user_data_page as usize;
    pcb.last_user_stack_page = image.last_user_stack_page as usize;
    pcb.brk_page = image.brk_page as usize;
    Ok(())
}

/// Frame hook for the loader: one frame from the pool, or `ERROR`.
#[no_mangle]
pub extern "C" fn KernelAllocFrame() -> c_int {
    match memory::alloc_frame() {
        Ok(frame) => frame as c_int,
        Err(_) => ERROR,
    }
}

/// Frame hook for the loader: returns a frame to the pool.
#[no_mangle]
pub extern "C" fn KernelFreeFrame(frame: c_int) {
    if frame >= 0 {
        memory::free_frame(frame as usize);
    }
}
