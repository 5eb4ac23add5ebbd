//! Common types used in many modules internally.

use core::fmt::{self, Display, Formatter};

use dashmap::DashMap;
use nohash_hasher::BuildNoHashHasher;

/// Fast integer [`DashMap`]
pub type IntDashMap<K, V> = DashMap<K, V, BuildNoHashHasher<K>>;

/// Latest value recorded per address. Each value is handed out at most once.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) struct Captures<V>(IntDashMap<usize, V>);

#[cfg_attr(not(windows), allow(dead_code))]
impl<V> Captures<V> {
    pub fn new() -> Self {
        Self(IntDashMap::default())
    }

    /// Record `value` for `key`, returning the one it replaces.
    pub fn record(&self, key: usize, value: V) -> Option<V> {
        self.0.insert(key, value)
    }

    pub fn take(&self, key: usize) -> Option<V> {
        self.0.remove(&key).map(|(_, value)| value)
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

/// Native window handle, stored by address.
///
/// A zero value is the null handle. The overlay never owns the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct WindowHandle(usize);

impl WindowHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[cfg(windows)]
    #[inline]
    pub fn hwnd(self) -> windows::Win32::Foundation::HWND {
        windows::Win32::Foundation::HWND(self.0 as _)
    }
}

impl Display for WindowHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(windows)]
impl From<windows::Win32::Foundation::HWND> for WindowHandle {
    #[inline]
    fn from(hwnd: windows::Win32::Foundation::HWND) -> Self {
        Self(hwnd.0 as usize)
    }
}

/// Result of an original entry point call.
pub(crate) trait CallOutcome {
    fn succeeded(&self) -> bool;

    /// Raw status code, for logging.
    fn code(&self) -> i32;
}

impl CallOutcome for i32 {
    #[inline]
    fn succeeded(&self) -> bool {
        *self >= 0
    }

    #[inline]
    fn code(&self) -> i32 {
        *self
    }
}

#[cfg(windows)]
impl CallOutcome for windows::core::HRESULT {
    #[inline]
    fn succeeded(&self) -> bool {
        self.is_ok()
    }

    #[inline]
    fn code(&self) -> i32 {
        self.0
    }
}
