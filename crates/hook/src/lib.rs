//! Function hooking for `frame-overlay`.
//!
//! This crate is intended to be used only as `frame-overlay`'s internal dependency.
//! It wraps `retour` generic detours into a hook that is installed once and
//! toggled afterwards, so a trampoline stays callable for the lifetime of the process.

use core::{
    error::Error,
    fmt::{self, Display, Formatter},
};

#[cfg(windows)]
pub use detour::DetourHook;
#[cfg(windows)]
pub use retour::Function;

/// Detour operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetourOp {
    Attach,
    Enable,
    Disable,
}

impl DetourOp {
    const fn as_str(self) -> &'static str {
        match self {
            DetourOp::Attach => "attach",
            DetourOp::Enable => "enable",
            DetourOp::Disable => "disable",
        }
    }
}

/// Detour error.
#[derive(Debug, Clone)]
pub struct DetourError {
    op: DetourOp,
    reason: String,
}

impl DetourError {
    pub fn new(op: DetourOp, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }

    pub const fn op(&self) -> DetourOp {
        self.op
    }
}

impl Display for DetourError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Detour {} error: {}", self.op.as_str(), self.reason)
    }
}

impl Error for DetourError {}

pub type DetourResult<T> = Result<T, DetourError>;

#[cfg(windows)]
mod detour {
    use core::fmt::{self, Debug, Formatter};

    use retour::{Function, GenericDetour};
    use tracing::debug;

    use super::{DetourError, DetourOp, DetourResult};

    /// A detour function hook.
    ///
    /// The hook starts disabled. Dropping it restores the target function.
    pub struct DetourHook<F: Function> {
        detour: GenericDetour<F>,
        original: F,
    }

    impl<F: Function> DetourHook<F> {
        /// Attach a hook to the target function without activating it.
        ///
        /// # Safety
        /// func and detour should be valid function pointers with same signature.
        #[tracing::instrument(skip_all)]
        pub unsafe fn attach(func: F, detour: F) -> DetourResult<Self> {
            let detour = unsafe { GenericDetour::new(func, detour) }
                .map_err(|err| DetourError::new(DetourOp::Attach, err.to_string()))?;
            let original = unsafe { F::from_ptr(detour.trampoline()) };
            debug!("hook attached to {:p}", func.to_ptr());

            Ok(DetourHook { detour, original })
        }

        /// Activate the hook. Enabling an active hook is a no-op.
        pub fn enable(&self) -> DetourResult<()> {
            if self.detour.is_enabled() {
                return Ok(());
            }

            unsafe { self.detour.enable() }
                .map_err(|err| DetourError::new(DetourOp::Enable, err.to_string()))
        }

        /// Deactivate the hook. The trampoline stays valid.
        pub fn disable(&self) -> DetourResult<()> {
            if !self.detour.is_enabled() {
                return Ok(());
            }

            unsafe { self.detour.disable() }
                .map_err(|err| DetourError::new(DetourOp::Disable, err.to_string()))
        }

        pub fn set_enabled(&self, enabled: bool) -> DetourResult<()> {
            if enabled {
                self.enable()
            } else {
                self.disable()
            }
        }

        #[inline]
        pub fn is_enabled(&self) -> bool {
            self.detour.is_enabled()
        }

        /// Get the original function pointer.
        #[inline(always)]
        pub fn original_fn(&self) -> F {
            self.original
        }
    }

    impl<F: Function> Debug for DetourHook<F> {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.debug_struct("DetourHook")
                .field("original", &self.original.to_ptr())
                .field("enabled", &self.detour.is_enabled())
                .finish()
        }
    }
}
