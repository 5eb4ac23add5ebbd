//! Window procedure interception.
//!
//! A single interception per process, attached to the window the session binds.
//! Messages are fed to the overlay first, then forwarded unless filtered.

use core::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{types::WindowHandle, ui::WindowMessage};

pub(crate) const WM_ACTIVATE: u32 = 0x0006;
pub(crate) const WM_KILLFOCUS: u32 = 0x0008;
pub(crate) const WM_ACTIVATEAPP: u32 = 0x001C;
const WA_INACTIVE: u16 = 0;

/// Native side of the interception.
pub(crate) struct WindowProcOps {
    /// Install the interception on the procedure of `window`, or on `custom` if given, and activate it.
    pub attach: fn(window: WindowHandle, custom: Option<usize>) -> anyhow::Result<()>,

    pub set_enabled: fn(bool) -> anyhow::Result<()>,
}

/// Session owned interceptor state.
pub(crate) struct WindowProcInterceptor {
    ops: &'static WindowProcOps,
    attached: Mutex<Option<WindowHandle>>,
    enabled: AtomicBool,
}

impl WindowProcInterceptor {
    pub fn new(ops: &'static WindowProcOps) -> Self {
        Self {
            ops,
            attached: Mutex::new(None),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn attached(&self) -> Option<WindowHandle> {
        *self.attached.lock()
    }

    /// Attach to `window` unless already attached to it.
    #[tracing::instrument(skip(self))]
    pub fn attach(&self, window: WindowHandle, custom: Option<usize>) -> anyhow::Result<()> {
        let mut attached = self.attached.lock();
        if *attached == Some(window) {
            return Ok(());
        }

        (self.ops.attach)(window, custom)?;
        debug!("window procedure of {} intercepted", window);
        *attached = Some(window);

        if !self.enabled.load(Ordering::Acquire) {
            (self.ops.set_enabled)(false)?;
        }

        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        let attached = self.attached.lock();
        self.enabled.store(enabled, Ordering::Release);
        if attached.is_some() {
            (self.ops.set_enabled)(enabled)?;
        }

        Ok(())
    }

    /// Deactivate the interception and forget the window. The native hook stays installed.
    pub fn detach(&self) -> anyhow::Result<()> {
        let mut attached = self.attached.lock();
        if attached.take().is_some() {
            (self.ops.set_enabled)(false)?;
            debug!("window procedure released");
        }

        Ok(())
    }
}

/// Result to return instead of forwarding, if the message must not reach the host.
pub(crate) fn filter_message(message: &WindowMessage, suppress_deactivation: bool) -> Option<isize> {
    if !suppress_deactivation {
        return None;
    }

    let suppressed = match message.msg {
        WM_KILLFOCUS => true,
        WM_ACTIVATE => {
            let [state, _] = bytemuck::cast::<_, [u16; 2]>(message.wparam as u32);
            state == WA_INACTIVE
        }
        WM_ACTIVATEAPP => message.wparam == 0,
        _ => false,
    };

    if suppressed {
        trace!("suppressed deactivation message {:#06x}", message.msg);
    }
    suppressed.then_some(0)
}

#[cfg(windows)]
pub(crate) fn platform_ops() -> &'static WindowProcOps {
    &crate::hook::proc::OPS
}

#[cfg(not(windows))]
pub(crate) fn platform_ops() -> &'static WindowProcOps {
    static UNSUPPORTED: WindowProcOps = WindowProcOps {
        attach: |_, _| anyhow::bail!("window procedure interception is only available on Windows"),
        set_enabled: |_| Ok(()),
    };

    &UNSUPPORTED
}

#[cfg(test)]
mod tests {
    use crate::testing::{ProcEvent, proc_events, RECORDING_PROC_OPS};

    use super::*;

    const WINDOW: WindowHandle = WindowHandle::new(0x1000);

    fn message(msg: u32, wparam: usize) -> WindowMessage {
        WindowMessage {
            window: WINDOW,
            msg,
            wparam,
            lparam: 0,
        }
    }

    #[test]
    fn deactivation_is_suppressed_when_configured() {
        assert_eq!(filter_message(&message(WM_KILLFOCUS, 0), true), Some(0));
        assert_eq!(filter_message(&message(WM_ACTIVATEAPP, 0), true), Some(0));
        assert_eq!(filter_message(&message(WM_ACTIVATE, 0), true), Some(0));
        // minimized flag in the high word
        assert_eq!(
            filter_message(&message(WM_ACTIVATE, 0x0001_0000), true),
            Some(0)
        );
    }

    #[test]
    fn activation_is_forwarded() {
        assert_eq!(filter_message(&message(WM_ACTIVATEAPP, 1), true), None);
        assert_eq!(filter_message(&message(WM_ACTIVATE, 1), true), None);
        assert_eq!(filter_message(&message(WM_ACTIVATE, 2), true), None);
        assert_eq!(filter_message(&message(0x0100, 0), true), None);
    }

    #[test]
    fn nothing_is_suppressed_by_default() {
        assert_eq!(filter_message(&message(WM_KILLFOCUS, 0), false), None);
        assert_eq!(filter_message(&message(WM_ACTIVATEAPP, 0), false), None);
    }

    #[test]
    fn attaches_once_per_window() {
        let interceptor = WindowProcInterceptor::new(&RECORDING_PROC_OPS);
        proc_events();

        interceptor.attach(WINDOW, None).unwrap();
        interceptor.attach(WINDOW, None).unwrap();
        assert_eq!(interceptor.attached(), Some(WINDOW));
        assert_eq!(proc_events(), vec![ProcEvent::Attach(WINDOW, None)]);

        interceptor.detach().unwrap();
        assert_eq!(interceptor.attached(), None);
        interceptor
            .attach(WindowHandle::new(0x2000), Some(0xdead))
            .unwrap();
        assert_eq!(
            proc_events(),
            vec![
                ProcEvent::Enabled(false),
                ProcEvent::Attach(WindowHandle::new(0x2000), Some(0xdead)),
            ]
        );
    }

    #[test]
    fn disabled_interceptor_attaches_inactive() {
        let interceptor = WindowProcInterceptor::new(&RECORDING_PROC_OPS);
        proc_events();

        interceptor.set_enabled(false).unwrap();
        assert!(proc_events().is_empty());

        interceptor.attach(WINDOW, None).unwrap();
        assert_eq!(
            proc_events(),
            vec![ProcEvent::Attach(WINDOW, None), ProcEvent::Enabled(false)]
        );

        interceptor.set_enabled(true).unwrap();
        assert_eq!(proc_events(), vec![ProcEvent::Enabled(true)]);
    }
}
