//! Kernel error codes.
//!
//! Every fallible operation in the runtime reports one of these codes. The
//! syscall layer additionally flattens them into the classic `-1` + errno-slot
//! convention via [`Errno::as_raw`].

/// Kernel error code. `EOK` is represented by `Ok(..)` on [`KResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Errno {
    /// Invalid argument
    #[error("invalid argument")]
    Inval,
    /// Object is still in use
    #[error("resource busy")]
    Busy,
    /// Target object has been terminated
    #[error("terminated")]
    Terminated,
    /// No such VCPU, item or handle
    #[error("no such entity")]
    Srch,
    /// Wait was woken by a signal matching the wait set
    #[error("interrupted")]
    Intr,
    /// Wait deadline elapsed
    #[error("timed out")]
    TimedOut,
    /// Allocation failed and no cached object was available
    #[error("out of memory")]
    NoMem,
    /// Operation not permitted on this object
    #[error("operation not permitted")]
    Perm,
    /// Bad descriptor/handle
    #[error("bad handle")]
    BadF,
    /// Result does not fit the caller-supplied buffer or range
    #[error("result out of range")]
    Range,
    /// Unknown syscall number
    #[error("not implemented")]
    NoSys,
}

pub type KResult<T> = Result<T, Errno>;

impl Errno {
    /// Raw code as stored in a VCPU's errno slot.
    pub const fn as_raw(self) -> i32 {
        match self {
            Errno::Inval => 22,
            Errno::Busy => 16,
            Errno::Terminated => 240,
            Errno::Srch => 3,
            Errno::Intr => 4,
            Errno::TimedOut => 60,
            Errno::NoMem => 12,
            Errno::Perm => 1,
            Errno::BadF => 9,
            Errno::Range => 34,
            Errno::NoSys => 38,
        }
    }

    pub const fn from_raw(raw: i32) -> Option<Errno> {
        match raw {
            22 => Some(Errno::Inval),
            16 => Some(Errno::Busy),
            240 => Some(Errno::Terminated),
            3 => Some(Errno::Srch),
            4 => Some(Errno::Intr),
            60 => Some(Errno::TimedOut),
            12 => Some(Errno::NoMem),
            1 => Some(Errno::Perm),
            9 => Some(Errno::BadF),
            34 => Some(Errno::Range),
            38 => Some(Errno::NoSys),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for e in [
            Errno::Inval,
            Errno::Busy,
            Errno::Terminated,
            Errno::Srch,
            Errno::Intr,
            Errno::TimedOut,
            Errno::NoMem,
            Errno::Perm,
            Errno::BadF,
            Errno::Range,
            Errno::NoSys,
        ] {
            assert_eq!(Errno::from_raw(e.as_raw()), Some(e));
        }
        assert_eq!(Errno::from_raw(0), None);
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(Errno::TimedOut.to_string(), "timed out");
    }
}
