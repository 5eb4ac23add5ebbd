//! Reentrancy guards for intercepted entry points.
//!
//! The overlay library may call back into an entry point that is already being intercepted
//! (a swap from inside the render callback, a device release from inside shutdown).
//! While the guard of an entry point is held, its interception body only forwards.

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};

/// Where a guard is considered held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardScope {
    /// Held only for the thread that entered. Other threads keep intercepting.
    #[default]
    Thread,

    /// Held for every thread while any thread is inside.
    Shared,
}

impl GuardScope {
    const fn to_raw(self) -> u8 {
        match self {
            GuardScope::Thread => 0,
            GuardScope::Shared => 1,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => GuardScope::Shared,
            _ => GuardScope::Thread,
        }
    }
}

thread_local! {
    static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
pub(crate) struct ReentrancyGuard {
    scope: AtomicU8,
    shared: AtomicBool,
}

impl ReentrancyGuard {
    pub const fn new() -> Self {
        Self {
            scope: AtomicU8::new(GuardScope::Thread.to_raw()),
            shared: AtomicBool::new(false),
        }
    }

    pub fn set_scope(&self, scope: GuardScope) {
        self.scope.store(scope.to_raw(), Ordering::Relaxed);
    }

    pub fn scope(&self) -> GuardScope {
        GuardScope::from_raw(self.scope.load(Ordering::Relaxed))
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Enter the guarded section. Returns [`None`] if it is already held.
    #[must_use]
    pub fn enter(&self) -> Option<Entered<'_>> {
        let scope = self.scope();
        let entered = match scope {
            GuardScope::Thread => ENTERED.with_borrow_mut(|entered| {
                if entered.contains(&self.key()) {
                    false
                } else {
                    entered.push(self.key());
                    true
                }
            }),
            GuardScope::Shared => self
                .shared
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        };

        entered.then_some(Entered { guard: self, scope })
    }

    /// Run `body` inside the guard, or `forward` if the guard is already held.
    #[inline]
    pub fn run<R>(&self, forward: impl FnOnce() -> R, body: impl FnOnce() -> R) -> R {
        match self.enter() {
            Some(_entered) => body(),
            None => forward(),
        }
    }

    pub fn is_held(&self) -> bool {
        match self.scope() {
            GuardScope::Thread => ENTERED.with_borrow(|entered| entered.contains(&self.key())),
            GuardScope::Shared => self.shared.load(Ordering::Acquire),
        }
    }
}

/// Held guard. Released on drop, including unwinding.
#[derive(Debug)]
pub(crate) struct Entered<'a> {
    guard: &'a ReentrancyGuard,
    scope: GuardScope,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        match self.scope {
            GuardScope::Thread => ENTERED.with_borrow_mut(|entered| {
                if let Some(position) = entered.iter().rposition(|&key| key == self.guard.key()) {
                    entered.swap_remove(position);
                }
            }),
            GuardScope::Shared => self.guard.shared.store(false, Ordering::Release),
        }
    }
}
