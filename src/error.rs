use core::fmt;

/// Kernel-internal error type. Syscall handlers convert any of these into
/// the `ERROR` sentinel at the trap boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfFrames,
    OutOfMemory,
    InvalidArgument,
    NotFound,
    Busy,
    NotOwner,
    WouldOverflow,
    LoadFailed,
    SwitchFailed,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfFrames => write!(f, "No free physical frames"),
            KernelError::OutOfMemory => write!(f, "Kernel allocation failed"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::NotFound => write!(f, "No such object"),
            KernelError::Busy => write!(f, "Object in use"),
            KernelError::NotOwner => write!(f, "Caller does not hold the object"),
            KernelError::WouldOverflow => write!(f, "Buffer capacity exceeded"),
            KernelError::LoadFailed => write!(f, "Program load failed"),
            KernelError::SwitchFailed => write!(f, "Kernel context switch failed"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
