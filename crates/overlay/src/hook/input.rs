use frame_overlay_hook::DetourHook;
use once_cell::sync::OnceCell;
use tracing::{debug, trace};
use windows::{
    Win32::{
        Foundation::HWND,
        UI::WindowsAndMessaging::{MSG, PM_REMOVE, TranslateMessage},
    },
    core::BOOL,
};

use crate::input::{WM_NULL, current_flags, should_block};

windows_link::link!("user32.dll" "system" fn PeekMessageA(lpmsg : *mut MSG, hwnd : HWND, wmsgfiltermin : u32, wmsgfiltermax : u32, wremovemsg : u32) -> BOOL);
windows_link::link!("user32.dll" "system" fn PeekMessageW(lpmsg : *mut MSG, hwnd : HWND, wmsgfiltermin : u32, wmsgfiltermax : u32, wremovemsg : u32) -> BOOL);

type PeekMessageFn = unsafe extern "system" fn(*mut MSG, HWND, u32, u32, u32) -> BOOL;

struct Hook {
    peek_message_a: DetourHook<PeekMessageFn>,
    peek_message_w: DetourHook<PeekMessageFn>,
}

static HOOK: OnceCell<Hook> = OnceCell::new();

pub fn hook() -> anyhow::Result<()> {
    HOOK.get_or_try_init(|| unsafe {
        debug!("hooking PeekMessageA");
        let peek_message_a = DetourHook::attach(PeekMessageA as _, hooked_peek_message_a as _)?;
        peek_message_a.enable()?;

        debug!("hooking PeekMessageW");
        let peek_message_w = DetourHook::attach(PeekMessageW as _, hooked_peek_message_w as _)?;
        peek_message_w.enable()?;

        Ok::<_, anyhow::Error>(Hook {
            peek_message_a,
            peek_message_w,
        })
    })?;

    Ok(())
}

/// Hide a peeked input message from the host if blocked.
fn filter(msg: *mut MSG, remove: u32) {
    let Some(msg) = (unsafe { msg.as_mut() }) else {
        return;
    };
    if !should_block(msg.message, current_flags()) {
        return;
    }

    trace!("blocked input message {:#06x}", msg.message);
    // translate once, when the message leaves the queue
    if remove & PM_REMOVE.0 != 0 {
        unsafe {
            _ = TranslateMessage(msg);
        }
    }
    msg.message = WM_NULL;
}

#[tracing::instrument(level = "trace")]
extern "system" fn hooked_peek_message_a(
    msg: *mut MSG,
    hwnd: HWND,
    filter_min: u32,
    filter_max: u32,
    remove: u32,
) -> BOOL {
    let result = unsafe {
        HOOK.wait().peek_message_a.original_fn()(msg, hwnd, filter_min, filter_max, remove)
    };
    if result.as_bool() {
        filter(msg, remove);
    }

    result
}

#[tracing::instrument(level = "trace")]
extern "system" fn hooked_peek_message_w(
    msg: *mut MSG,
    hwnd: HWND,
    filter_min: u32,
    filter_max: u32,
    remove: u32,
) -> BOOL {
    let result = unsafe {
        HOOK.wait().peek_message_w.original_fn()(msg, hwnd, filter_min, filter_max, remove)
    };
    if result.as_bool() {
        filter(msg, remove);
    }

    result
}
