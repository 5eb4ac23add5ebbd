use std::path::{Path, PathBuf};

use anyhow::bail;
use scopeguard::defer;
use windows::{
    Win32::{
        Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, WPARAM},
        System::LibraryLoader::GetModuleHandleW,
        UI::WindowsAndMessaging::{
            CS_OWNDC, CreateWindowExW, DefWindowProcW, DestroyWindow, RegisterClassW,
            UnregisterClassW, WINDOW_EX_STYLE, WNDCLASSW, WS_POPUP,
        },
    },
    core::{HSTRING, w},
};

use crate::{backend::BackendKind, error::BootstrapFailed};

#[inline]
pub fn module_loaded(name: &str) -> bool {
    unsafe { GetModuleHandleW(&HSTRING::from(name)) }.is_ok()
}

fn executable_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(Path::to_path_buf)
}

pub fn is_supported(kind: BackendKind) -> bool {
    let dir = executable_dir();
    kind.probe(module_loaded, |file| {
        dir.as_deref().is_some_and(|dir| dir.join(file).exists())
    })
}

/// Run `f` with a hidden throwaway window, for devices created only to read dispatch tables.
///
/// Failures, including those of `f`, are reported as [`BootstrapFailed`].
pub fn with_dummy_hwnd<R>(f: impl FnOnce(HWND) -> anyhow::Result<R>) -> anyhow::Result<R> {
    extern "system" fn window_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
    }

    let inner = || -> anyhow::Result<R> {
        unsafe {
            let hinstance: HINSTANCE = GetModuleHandleW(None)?.into();
            let class_name = w!("frame-overlay dummy window class");
            if RegisterClassW(&WNDCLASSW {
                style: CS_OWNDC,
                hInstance: hinstance,
                lpszClassName: class_name,
                lpfnWndProc: Some(window_proc),
                ..Default::default()
            }) == 0
            {
                bail!("RegisterClassW call failed");
            }
            defer!({
                _ = UnregisterClassW(class_name, Some(hinstance));
            });

            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE(0),
                class_name,
                w!("frame-overlay dummy window"),
                WS_POPUP,
                0,
                0,
                2,
                2,
                None,
                None,
                Some(hinstance),
                None,
            )?;
            defer!({
                _ = DestroyWindow(hwnd);
            });

            f(hwnd)
        }
    };

    inner().map_err(|err| BootstrapFailed(err).into())
}
