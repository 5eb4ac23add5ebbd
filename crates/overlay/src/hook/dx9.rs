//! Direct3D 9 candidate.
//!
//! Draws at `EndScene`, rebuilds around `Reset` and shuts down when the bound device is
//! released for the last time. `CreateDevice` is watched so the overlay sticks to the
//! device the host created last.

use core::{
    ffi::c_void,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, bail};
use frame_overlay_hook::DetourHook;
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, trace};
use windows::{
    Win32::{
        Foundation::HWND,
        Graphics::Direct3D9::{
            D3D_SDK_VERSION, D3DADAPTER_DEFAULT, D3DCREATE_HARDWARE_VERTEXPROCESSING,
            D3DDEVICE_CREATION_PARAMETERS, D3DDEVTYPE, D3DDEVTYPE_HAL, D3DPRESENT_PARAMETERS,
            D3DSWAPEFFECT_DISCARD, Direct3DCreate9, IDirect3DDevice9,
        },
    },
    core::{BOOL, HRESULT, Interface},
};

use crate::{
    backend::{
        BackendKind, CandidateOps,
        state::{FrameState, SwapchainTarget},
    },
    config::OverlayOptions,
    guard::ReentrancyGuard,
    session::{self, SessionCore},
    types::WindowHandle,
    ui::{DrawTarget, OverlayUi, RendererInit},
};

use super::util::{self, with_dummy_hwnd};

pub(super) static OPS: CandidateOps = CandidateOps {
    is_supported: || util::is_supported(BackendKind::Dx9),
    initialize: install,
    set_enabled: |enabled| match HOOK.get() {
        Some(hook) => hook.set_enabled(enabled),
        None => Ok(()),
    },
    deactivate: || {
        // devices may be released unseen from now on
        LEARNED_DEVICE.store(0, Ordering::Release);
        match HOOK.get() {
            Some(hook) => hook.disable_all(),
            None => Ok(()),
        }
    },
    shutdown: |session| {
        BOUND_DEVICE.store(0, Ordering::Release);
        FRAMES.shutdown(session);
    },
};

pub type EndSceneFn = unsafe extern "system" fn(*mut c_void) -> HRESULT;
pub type ResetFn = unsafe extern "system" fn(*mut c_void, *mut D3DPRESENT_PARAMETERS) -> HRESULT;
pub type ReleaseFn = unsafe extern "system" fn(*mut c_void) -> u32;
pub type CreateDeviceFn = unsafe extern "system" fn(
    *mut c_void,
    u32,
    D3DDEVTYPE,
    HWND,
    u32,
    *mut D3DPRESENT_PARAMETERS,
    *mut *mut c_void,
) -> HRESULT;

struct Hook {
    end_scene: DetourHook<EndSceneFn>,
    reset: DetourHook<ResetFn>,
    release: DetourHook<ReleaseFn>,
    create_device: DetourHook<CreateDeviceFn>,
}

impl Hook {
    // Release and CreateDevice keep tracking devices while disabled
    fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.end_scene.set_enabled(enabled)?;
        self.reset.set_enabled(enabled)?;

        Ok(())
    }

    fn disable_all(&self) -> anyhow::Result<()> {
        self.set_enabled(false)?;
        self.release.disable()?;
        self.create_device.disable()?;

        Ok(())
    }
}

static HOOK: OnceCell<Hook> = OnceCell::new();

static END_SCENE_GUARD: ReentrancyGuard = ReentrancyGuard::new();
static RESET_GUARD: ReentrancyGuard = ReentrancyGuard::new();
static RELEASE_GUARD: ReentrancyGuard = ReentrancyGuard::new();

// last device returned by CreateDevice
static LEARNED_DEVICE: AtomicUsize = AtomicUsize::new(0);
// device the overlay renders with
static BOUND_DEVICE: AtomicUsize = AtomicUsize::new(0);

static FRAMES: Lazy<FrameState<Dx9Resources>> = Lazy::new(|| FrameState::new(BackendKind::Dx9));

pub struct Dx9Resources {
    device: usize,
}

struct Dx9Device<'a> {
    device: &'a IDirect3DDevice9,
    window: WindowHandle,
}

impl SwapchainTarget for Dx9Device<'_> {
    type Resources = Dx9Resources;

    fn window(&self) -> WindowHandle {
        self.window
    }

    fn create(&self, ui: &mut dyn OverlayUi) -> anyhow::Result<Dx9Resources> {
        ui.renderer_init(RendererInit::Dx9 {
            device: self.device.as_raw(),
        })?;

        let device = self.device.as_raw() as usize;
        BOUND_DEVICE.store(device, Ordering::Release);
        Ok(Dx9Resources { device })
    }

    fn invalidate(&self, _: &mut Dx9Resources, ui: &mut dyn OverlayUi) {
        ui.invalidate_device_objects(BackendKind::Dx9);
    }

    fn rebuild(&self, _: &mut Dx9Resources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        if !ui.create_device_objects(BackendKind::Dx9) {
            bail!("device object creation failed");
        }

        Ok(())
    }

    fn draw(&self, resources: &mut Dx9Resources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        if resources.device != self.device.as_raw() as usize {
            bail!("scene of another device");
        }

        ui.render_draw_data(BackendKind::Dx9, DrawTarget::Immediate);
        Ok(())
    }
}

/// Focus window of the device, or the window of its implicit swapchain.
fn device_window(device: &IDirect3DDevice9) -> WindowHandle {
    let mut creation = D3DDEVICE_CREATION_PARAMETERS::default();
    if unsafe { device.GetCreationParameters(&mut creation) }.is_ok()
        && !creation.hFocusWindow.is_invalid()
    {
        return creation.hFocusWindow.into();
    }

    let Ok(swapchain) = (unsafe { device.GetSwapChain(0) }) else {
        return WindowHandle::NULL;
    };
    let mut params = D3DPRESENT_PARAMETERS::default();
    match unsafe { swapchain.GetPresentParameters(&mut params) } {
        Ok(()) => params.hDeviceWindow.into(),
        Err(_) => WindowHandle::NULL,
    }
}

#[tracing::instrument(skip(options))]
fn install(options: &OverlayOptions) -> anyhow::Result<()> {
    END_SCENE_GUARD.set_scope(options.guard_scope);
    RESET_GUARD.set_scope(options.guard_scope);
    RELEASE_GUARD.set_scope(options.guard_scope);

    let hook = HOOK.get_or_try_init(|| {
        let addrs = with_dummy_hwnd(get_addr).context("failed to load dx9 addrs")?;

        unsafe {
            debug!("hooking IDirect3DDevice9::EndScene");
            let end_scene = DetourHook::attach(addrs.end_scene, hooked_end_scene as _)?;

            debug!("hooking IDirect3DDevice9::Reset");
            let reset = DetourHook::attach(addrs.reset, hooked_reset as _)?;

            debug!("hooking IDirect3DDevice9::Release");
            let release = DetourHook::attach(addrs.release, hooked_release as _)?;

            debug!("hooking IDirect3D9::CreateDevice");
            let create_device = DetourHook::attach(addrs.create_device, hooked_create_device as _)?;

            Ok::<_, anyhow::Error>(Hook {
                end_scene,
                reset,
                release,
                create_device,
            })
        }
    })?;

    hook.release.enable()?;
    hook.create_device.enable()?;
    hook.set_enabled(true)
}

fn end_scene(
    session: &SessionCore,
    device: &IDirect3DDevice9,
    original: impl FnOnce() -> HRESULT,
) -> HRESULT {
    let learned = LEARNED_DEVICE.load(Ordering::Acquire);
    if learned != 0 && learned != device.as_raw() as usize {
        trace!("ignoring scene of unknown device");
        return original();
    }

    let target = Dx9Device {
        device,
        window: device_window(device),
    };
    FRAMES.present(session, &target, original)
}

fn reset(
    session: &SessionCore,
    device: &IDirect3DDevice9,
    params: *mut D3DPRESENT_PARAMETERS,
    original: impl FnOnce() -> HRESULT,
) -> HRESULT {
    let mut window = device_window(device);
    if window.is_null() && !params.is_null() {
        window = unsafe { (*params).hDeviceWindow }.into();
    }

    FRAMES.resize(session, &Dx9Device { device, window }, original)
}

#[tracing::instrument]
extern "system" fn hooked_end_scene(this: *mut c_void) -> HRESULT {
    trace!("EndScene called");

    let original = || unsafe { HOOK.wait().end_scene.original_fn()(this) };
    END_SCENE_GUARD.run(original, || {
        let Some(session) = session::current() else {
            return original();
        };

        match unsafe { IDirect3DDevice9::from_raw_borrowed(&this) } {
            Some(device) => end_scene(&session, device, original),
            None => original(),
        }
    })
}

#[tracing::instrument]
extern "system" fn hooked_reset(this: *mut c_void, params: *mut D3DPRESENT_PARAMETERS) -> HRESULT {
    trace!("Reset called");

    let original = || unsafe { HOOK.wait().reset.original_fn()(this, params) };
    RESET_GUARD.run(original, || {
        let Some(session) = session::current() else {
            return original();
        };

        match unsafe { IDirect3DDevice9::from_raw_borrowed(&this) } {
            Some(device) => reset(&session, device, params, original),
            None => original(),
        }
    })
}

#[tracing::instrument(level = "trace")]
extern "system" fn hooked_release(this: *mut c_void) -> u32 {
    let original = || unsafe { HOOK.wait().release.original_fn()(this) };

    RELEASE_GUARD.run(original, || {
        let count = original();
        if count != 0 {
            return count;
        }

        let device = this as usize;
        _ = LEARNED_DEVICE.compare_exchange(device, 0, Ordering::AcqRel, Ordering::Acquire);
        if BOUND_DEVICE
            .compare_exchange(device, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("bound device {:#x} destroyed", device);
            if let Some(session) = session::current() {
                FRAMES.shutdown(&session);
                session.release_window();
            }
        }

        count
    })
}

#[tracing::instrument]
extern "system" fn hooked_create_device(
    this: *mut c_void,
    adapter: u32,
    device_type: D3DDEVTYPE,
    focus_window: HWND,
    behavior_flags: u32,
    params: *mut D3DPRESENT_PARAMETERS,
    returned_device: *mut *mut c_void,
) -> HRESULT {
    trace!("CreateDevice called");

    let result = unsafe {
        HOOK.wait().create_device.original_fn()(
            this,
            adapter,
            device_type,
            focus_window,
            behavior_flags,
            params,
            returned_device,
        )
    };

    if result.is_ok() && !returned_device.is_null() {
        let device = unsafe { *returned_device } as usize;
        debug!("learned device {:#x} for window {:?}", device, focus_window);
        LEARNED_DEVICE.store(device, Ordering::Release);
    }

    result
}

struct Dx9Functions {
    end_scene: EndSceneFn,
    reset: ResetFn,
    release: ReleaseFn,
    create_device: CreateDeviceFn,
}

/// Read device functions from a throwaway device.
#[tracing::instrument]
fn get_addr(dummy_hwnd: HWND) -> anyhow::Result<Dx9Functions> {
    unsafe {
        let d3d9 = Direct3DCreate9(D3D_SDK_VERSION).context("cannot create IDirect3D9")?;

        let mut device = None;
        d3d9.CreateDevice(
            D3DADAPTER_DEFAULT,
            D3DDEVTYPE_HAL,
            dummy_hwnd,
            D3DCREATE_HARDWARE_VERTEXPROCESSING as _,
            &mut D3DPRESENT_PARAMETERS {
                Windowed: BOOL(1),
                SwapEffect: D3DSWAPEFFECT_DISCARD,
                hDeviceWindow: dummy_hwnd,
                ..Default::default()
            },
            &mut device,
        )?;
        let device = device.context("cannot create IDirect3DDevice9")?;

        let vtable = Interface::vtable(&device);
        let end_scene = vtable.EndScene;
        debug!("IDirect3DDevice9::EndScene found: {:p}", end_scene);
        let reset = vtable.Reset;
        debug!("IDirect3DDevice9::Reset found: {:p}", reset);
        let release = vtable.base__.Release;
        debug!("IDirect3DDevice9::Release found: {:p}", release);

        let create_device = Interface::vtable(&d3d9).CreateDevice;
        debug!("IDirect3D9::CreateDevice found: {:p}", create_device);

        Ok(Dx9Functions {
            end_scene,
            reset,
            release,
            create_device,
        })
    }
}
