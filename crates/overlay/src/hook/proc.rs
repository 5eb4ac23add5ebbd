//! Window procedure detours.
//!
//! Only one procedure is intercepted at a time. Class procedures are shared by every window
//! of the class, so messages for windows other than the attached one are forwarded untouched.
//! Detours of previously attached procedures stay alive, disabled, and are reused when the
//! same procedure is attached again.

use core::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::Arc;

use anyhow::bail;
use arc_swap::ArcSwapOption;
use frame_overlay_hook::DetourHook;
use parking_lot::Mutex;
use tracing::{debug, trace};
use windows::Win32::{
    Foundation::{HWND, LPARAM, LRESULT, WPARAM},
    UI::WindowsAndMessaging::{DefWindowProcW, GWLP_WNDPROC, IsWindowUnicode},
};

use crate::{session, types::WindowHandle, ui::WindowMessage, wndproc::WindowProcOps};

pub(crate) static OPS: WindowProcOps = WindowProcOps {
    attach,
    set_enabled,
};

type WndProcFn = unsafe extern "system" fn(HWND, u32, WPARAM, LPARAM) -> LRESULT;

struct ProcHook {
    target: usize,
    window: AtomicUsize,
    hook: DetourHook<WndProcFn>,
}

impl ProcHook {
    #[inline]
    fn window(&self) -> WindowHandle {
        WindowHandle::new(self.window.load(Ordering::Acquire))
    }
}

static CURRENT: ArcSwapOption<ProcHook> = ArcSwapOption::const_empty();

// every detour ever attached, by target
static HOOKS: Mutex<Vec<Arc<ProcHook>>> = Mutex::new(Vec::new());

#[cfg(target_pointer_width = "64")]
fn window_proc_address(hwnd: HWND) -> usize {
    use windows::Win32::UI::WindowsAndMessaging::{GetWindowLongPtrA, GetWindowLongPtrW};

    unsafe {
        if IsWindowUnicode(hwnd).as_bool() {
            GetWindowLongPtrW(hwnd, GWLP_WNDPROC) as usize
        } else {
            GetWindowLongPtrA(hwnd, GWLP_WNDPROC) as usize
        }
    }
}

#[cfg(target_pointer_width = "32")]
fn window_proc_address(hwnd: HWND) -> usize {
    use windows::Win32::UI::WindowsAndMessaging::{GetWindowLongA, GetWindowLongW};

    unsafe {
        if IsWindowUnicode(hwnd).as_bool() {
            GetWindowLongW(hwnd, GWLP_WNDPROC) as u32 as usize
        } else {
            GetWindowLongA(hwnd, GWLP_WNDPROC) as u32 as usize
        }
    }
}

#[tracing::instrument]
fn attach(window: WindowHandle, custom: Option<usize>) -> anyhow::Result<()> {
    let target = match custom {
        Some(address) => address,
        None => window_proc_address(window.hwnd()),
    };
    if target == 0 {
        bail!("window {} has no window procedure", window);
    }

    let mut hooks = HOOKS.lock();
    if let Some(current) = CURRENT.load_full() {
        if current.target != target {
            current.hook.disable()?;
        }
    }

    let hook = match hooks.iter().find(|hook| hook.target == target) {
        Some(hook) => hook.clone(),
        None => {
            debug!("hooking window procedure {:#x}", target);
            let hook = unsafe {
                DetourHook::attach(
                    mem::transmute::<usize, WndProcFn>(target),
                    hooked_window_proc as _,
                )?
            };
            let hook = Arc::new(ProcHook {
                target,
                window: AtomicUsize::new(0),
                hook,
            });
            hooks.push(hook.clone());
            hook
        }
    };

    hook.window.store(window.raw(), Ordering::Release);
    CURRENT.store(Some(hook.clone()));
    hook.hook.enable()?;

    Ok(())
}

fn set_enabled(enabled: bool) -> anyhow::Result<()> {
    let _hooks = HOOKS.lock();
    if let Some(current) = CURRENT.load_full() {
        current.hook.set_enabled(enabled)?;
    }

    Ok(())
}

#[tracing::instrument(level = "trace")]
extern "system" fn hooked_window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    let Some(hook) = CURRENT.load_full() else {
        trace!("window procedure called without detour");
        return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
    };
    let original = || unsafe { hook.hook.original_fn()(hwnd, msg, wparam, lparam) };

    let window = WindowHandle::from(hwnd);
    if hook.window() != window {
        return original();
    }

    if let Some(session) = session::current() {
        let message = WindowMessage {
            window,
            msg,
            wparam: wparam.0,
            lparam: lparam.0,
        };

        if let Some(result) = session.dispatch_window_message(&message) {
            return LRESULT(result);
        }
    }

    original()
}
