//! DXGI swapchain entry points shared by the Direct3D 11 and 12 candidates.
//!
//! The hooks are installed by whichever candidate initializes first and stay
//! active while either candidate is enabled. Each call is routed by the device
//! type behind the swapchain.

use core::{
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use frame_overlay_hook::DetourHook;
use once_cell::sync::OnceCell;
use tracing::{debug, trace};
use windows::{
    Win32::{
        Foundation::{HMODULE, HWND},
        Graphics::{
            Direct3D10::{
                D3D10_DRIVER_TYPE_HARDWARE, D3D10_SDK_VERSION, D3D10CreateDeviceAndSwapChain,
            },
            Direct3D11::ID3D11Device,
            Direct3D12::ID3D12Device,
            Dxgi::{
                Common::{DXGI_FORMAT, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_MODE_DESC, DXGI_SAMPLE_DESC},
                CreateDXGIFactory1, DXGI_ERROR_INVALID_CALL, DXGI_PRESENT, DXGI_PRESENT_PARAMETERS,
                DXGI_PRESENT_TEST, DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_EFFECT_DISCARD,
                DXGI_USAGE_RENDER_TARGET_OUTPUT, IDXGIFactory1, IDXGISwapChain, IDXGISwapChain1,
            },
        },
    },
    core::{BOOL, HRESULT, Interface},
};

use crate::{
    backend::BackendKind, config::OverlayOptions, guard::ReentrancyGuard, session,
    types::WindowHandle,
};

use super::{dx11, dx12, util::with_dummy_hwnd};

pub type PresentFn = unsafe extern "system" fn(*mut c_void, u32, DXGI_PRESENT) -> HRESULT;
pub type Present1Fn = unsafe extern "system" fn(
    *mut c_void,
    u32,
    DXGI_PRESENT,
    *const DXGI_PRESENT_PARAMETERS,
) -> HRESULT;
pub type ResizeBuffersFn =
    unsafe extern "system" fn(*mut c_void, u32, u32, u32, DXGI_FORMAT, u32) -> HRESULT;

struct Hook {
    present: DetourHook<PresentFn>,
    present1: Option<DetourHook<Present1Fn>>,
    resize_buffers: DetourHook<ResizeBuffersFn>,
}

impl Hook {
    fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.present.set_enabled(enabled)?;
        if let Some(ref present1) = self.present1 {
            present1.set_enabled(enabled)?;
        }
        self.resize_buffers.set_enabled(enabled)?;

        Ok(())
    }
}

static HOOK: OnceCell<Hook> = OnceCell::new();

// Present and Present1 share a guard, some runtimes implement one with the other.
static PRESENT_GUARD: ReentrancyGuard = ReentrancyGuard::new();
static RESIZE_GUARD: ReentrancyGuard = ReentrancyGuard::new();

static DX11_ENABLED: AtomicBool = AtomicBool::new(false);
static DX12_ENABLED: AtomicBool = AtomicBool::new(false);

fn enabled_flag(kind: BackendKind) -> &'static AtomicBool {
    match kind {
        BackendKind::Dx12 => &DX12_ENABLED,
        _ => &DX11_ENABLED,
    }
}

/// Install the shared hooks if needed and activate them for `kind`.
#[tracing::instrument(skip(options))]
pub fn install(kind: BackendKind, options: &OverlayOptions) -> anyhow::Result<()> {
    PRESENT_GUARD.set_scope(options.guard_scope);
    RESIZE_GUARD.set_scope(options.guard_scope);

    let hook = HOOK.get_or_try_init(|| {
        let addrs = with_dummy_hwnd(get_addr).context("failed to load dxgi addrs")?;

        unsafe {
            debug!("hooking IDXGISwapChain::Present");
            let present = DetourHook::attach(addrs.present, hooked_present as _)?;

            let present1 = match addrs.present1 {
                Some(present1) => {
                    debug!("hooking IDXGISwapChain1::Present1");
                    Some(DetourHook::attach(present1, hooked_present1 as _)?)
                }
                None => None,
            };

            debug!("hooking IDXGISwapChain::ResizeBuffers");
            let resize_buffers =
                DetourHook::attach(addrs.resize_buffers, hooked_resize_buffers as _)?;

            Ok::<_, anyhow::Error>(Hook {
                present,
                present1,
                resize_buffers,
            })
        }
    })?;

    enabled_flag(kind).store(true, Ordering::Release);
    hook.set_enabled(true)
}

/// Toggle the hooks for `kind`. They stay active while the other candidate is enabled.
pub fn set_enabled(kind: BackendKind, enabled: bool) -> anyhow::Result<()> {
    enabled_flag(kind).store(enabled, Ordering::Release);

    let Some(hook) = HOOK.get() else {
        return Ok(());
    };
    hook.set_enabled(DX11_ENABLED.load(Ordering::Acquire) || DX12_ENABLED.load(Ordering::Acquire))
}

#[inline]
pub fn swapchain_window(swapchain: &IDXGISwapChain) -> WindowHandle {
    unsafe { swapchain.GetDesc() }
        .map(|desc| WindowHandle::from(desc.OutputWindow))
        .unwrap_or_default()
}

fn present(swapchain: &IDXGISwapChain, original: impl FnOnce() -> HRESULT) -> HRESULT {
    let Some(session) = session::current() else {
        return original();
    };

    if let Ok(device) = unsafe { swapchain.GetDevice::<ID3D12Device>() } {
        if !DX12_ENABLED.load(Ordering::Acquire) {
            return original();
        }

        dx12::present(&session, swapchain, device, original)
    } else if let Ok(device) = unsafe { swapchain.GetDevice::<ID3D11Device>() } {
        if !DX11_ENABLED.load(Ordering::Acquire) {
            return original();
        }

        dx11::present(&session, swapchain, device, original)
    } else {
        original()
    }
}

fn resize(swapchain: &IDXGISwapChain, original: impl FnOnce() -> HRESULT) -> HRESULT {
    let Some(session) = session::current() else {
        return original();
    };

    if let Ok(device) = unsafe { swapchain.GetDevice::<ID3D12Device>() } {
        dx12::resize(&session, swapchain, device, original)
    } else if let Ok(device) = unsafe { swapchain.GetDevice::<ID3D11Device>() } {
        dx11::resize(&session, swapchain, device, original)
    } else {
        original()
    }
}

#[tracing::instrument]
extern "system" fn hooked_present(
    this: *mut c_void,
    sync_interval: u32,
    flags: DXGI_PRESENT,
) -> HRESULT {
    trace!("Present called");

    let original = || unsafe { HOOK.wait().present.original_fn()(this, sync_interval, flags) };
    if flags.contains(DXGI_PRESENT_TEST) {
        return original();
    }

    PRESENT_GUARD.run(original, || {
        match unsafe { IDXGISwapChain::from_raw_borrowed(&this) } {
            Some(swapchain) => present(swapchain, original),
            None => original(),
        }
    })
}

#[tracing::instrument]
extern "system" fn hooked_present1(
    this: *mut c_void,
    sync_interval: u32,
    flags: DXGI_PRESENT,
    present_params: *const DXGI_PRESENT_PARAMETERS,
) -> HRESULT {
    trace!("Present1 called");

    let original = || unsafe {
        match HOOK.wait().present1 {
            Some(ref present1) => {
                present1.original_fn()(this, sync_interval, flags, present_params)
            }
            None => DXGI_ERROR_INVALID_CALL,
        }
    };
    if flags.contains(DXGI_PRESENT_TEST) {
        return original();
    }

    PRESENT_GUARD.run(original, || {
        match unsafe { IDXGISwapChain::from_raw_borrowed(&this) } {
            Some(swapchain) => present(swapchain, original),
            None => original(),
        }
    })
}

#[tracing::instrument]
extern "system" fn hooked_resize_buffers(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: DXGI_FORMAT,
    flags: u32,
) -> HRESULT {
    trace!("ResizeBuffers called");

    let original = || unsafe {
        HOOK.wait().resize_buffers.original_fn()(this, buffer_count, width, height, format, flags)
    };

    RESIZE_GUARD.run(original, || {
        match unsafe { IDXGISwapChain::from_raw_borrowed(&this) } {
            Some(swapchain) => resize(swapchain, original),
            None => original(),
        }
    })
}

struct DxgiFunctions {
    present: PresentFn,
    present1: Option<Present1Fn>,
    resize_buffers: ResizeBuffersFn,
}

/// Read swapchain functions from a throwaway Direct3D 10 swapchain.
#[tracing::instrument]
fn get_addr(dummy_hwnd: HWND) -> anyhow::Result<DxgiFunctions> {
    unsafe {
        let factory = CreateDXGIFactory1::<IDXGIFactory1>()?;
        let adapter = factory.EnumAdapters1(0)?;

        let desc = DXGI_SWAP_CHAIN_DESC {
            BufferCount: 2,
            BufferDesc: DXGI_MODE_DESC {
                Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                ..Default::default()
            },
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                ..Default::default()
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            OutputWindow: dummy_hwnd,
            Windowed: BOOL(1),
            SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
            ..Default::default()
        };

        let mut swapchain = None;
        let mut device = None;
        D3D10CreateDeviceAndSwapChain(
            &adapter,
            D3D10_DRIVER_TYPE_HARDWARE,
            HMODULE(ptr::null_mut()),
            0,
            D3D10_SDK_VERSION,
            Some(&desc),
            Some(&mut swapchain),
            Some(&mut device),
        )?;
        let swapchain = swapchain.context("SwapChain creation failed")?;

        let vtable = Interface::vtable(&swapchain);
        let present = vtable.Present;
        debug!("IDXGISwapChain::Present found: {:p}", present);
        let resize_buffers = vtable.ResizeBuffers;
        debug!("IDXGISwapChain::ResizeBuffers found: {:p}", resize_buffers);

        let present1 = swapchain.cast::<IDXGISwapChain1>().ok().map(|swapchain1| {
            let present1 = Interface::vtable(&swapchain1).Present1;
            debug!("IDXGISwapChain1::Present1 found: {:p}", present1);
            present1
        });

        Ok(DxgiFunctions {
            present,
            present1,
            resize_buffers,
        })
    }
}
