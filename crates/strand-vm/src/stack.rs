//! Native stack bounds and headroom checks.
//!
//! Every execution context records where its native stack started and how
//! much of it the interpreter may use. Deep recursion probes the current
//! stack address against those bounds before it runs out of real stack.

use crate::error::{ProtocolViolation, VmError};

/// Bounds of a thread's native stack as reported by the platform.
#[derive(Debug, Clone, Copy)]
pub struct NativeStack {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

impl NativeStack {
    /// Total size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.bottom - self.top
    }
}

/// Retrieve the native stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
#[must_use]
pub fn native_stack() -> Option<NativeStack> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: `attr` is initialized by `pthread_getattr_np` before it is read
    // and destroyed exactly once on every path after that.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        Some(NativeStack {
            bottom: (stackaddr as usize) + stacksize,
            top: stackaddr as usize,
        })
    }
}

/// Retrieve the native stack bounds for the current thread (unsupported platform).
#[cfg(any(not(target_os = "linux"), miri))]
#[must_use]
pub fn native_stack() -> Option<NativeStack> {
    None
}

/// Address of a local in the caller's frame; a cheap stack-depth probe.
#[inline(never)]
#[must_use]
pub fn stack_address() -> usize {
    let marker = 0_u8;
    std::hint::black_box(&raw const marker) as usize
}

/// The usable stack region of one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLimits {
    start: usize,
    size: usize,
    cushion: usize,
}

impl StackLimits {
    /// Limits anchored at `start` with `total` bytes of which `cushion` are
    /// held back.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolViolation::StackTooSmall`] if `total <= cushion`.
    pub const fn new(start: usize, total: usize, cushion: usize) -> Result<Self, ProtocolViolation> {
        if total <= cushion {
            return Err(ProtocolViolation::StackTooSmall {
                size: total,
                cushion,
            });
        }
        Ok(Self {
            start,
            size: total - cushion,
            cushion,
        })
    }

    /// Where the stack was anchored.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Usable bytes (total minus cushion).
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bytes held back from the interpreter.
    #[must_use]
    pub const fn cushion(&self) -> usize {
        self.cushion
    }

    /// Signed headroom left at `address`.
    ///
    /// The distance is taken as an absolute value so the check works whichever
    /// way the platform grows its stack.
    #[must_use]
    pub const fn remaining(&self, address: usize) -> isize {
        let used = self.start.abs_diff(address);
        #[allow(clippy::cast_possible_wrap)]
        let remaining = (self.size as isize).saturating_sub(used as isize);
        remaining
    }

    /// Fail with [`VmError::StackOverflow`] when no headroom is left at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::StackOverflow`] iff the headroom is non-positive.
    pub const fn check(&self, address: usize) -> Result<(), VmError> {
        let remaining = self.remaining(address);
        if remaining <= 0 {
            return Err(VmError::StackOverflow { remaining });
        }
        Ok(())
    }
}
