use core::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, bail};
use frame_overlay_hook::DetourHook;
use once_cell::sync::{Lazy, OnceCell};
use scopeguard::defer;
use tracing::{debug, trace};
use windows::{
    Win32::{
        Graphics::{
            Gdi::{GetDC, HDC, ReleaseDC, WindowFromDC},
            OpenGL::{HGLRC, wglGetCurrentContext, wglGetCurrentDC, wglMakeCurrent},
        },
        System::LibraryLoader::{GetModuleHandleA, GetProcAddress},
    },
    core::{BOOL, s},
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

use super::util;

const GLSL_VERSION: &str = "#version 130";

#[link(name = "gdi32.dll", kind = "raw-dylib", modifiers = "+verbatim")]
unsafe extern "system" {
    fn SwapBuffers(hdc: HDC) -> BOOL;
}

pub(super) static OPS: CandidateOps = CandidateOps {
    is_supported: || util::is_supported(BackendKind::OpenGl),
    initialize: install,
    set_enabled: |enabled| match HOOK.get() {
        Some(hook) => hook.set_enabled(enabled),
        None => Ok(()),
    },
    deactivate: || match HOOK.get() {
        Some(hook) => {
            hook.set_enabled(false)?;
            hook.wgl_delete_context.disable()?;
            Ok(())
        }
        None => Ok(()),
    },
    shutdown: |session| {
        BOUND_CONTEXT.store(0, Ordering::Release);
        FRAMES.shutdown(session);
    },
};

type SwapBuffersFn = unsafe extern "system" fn(HDC) -> BOOL;
type WglSwapBuffersFn = unsafe extern "system" fn(HDC) -> BOOL;
type WglDeleteContextFn = unsafe extern "system" fn(HGLRC) -> BOOL;

struct Hook {
    wgl_swap_buffers: DetourHook<WglSwapBuffersFn>,
    swap_buffers: DetourHook<SwapBuffersFn>,
    wgl_delete_context: DetourHook<WglDeleteContextFn>,
}

impl Hook {
    fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.wgl_swap_buffers.set_enabled(enabled)?;
        self.swap_buffers.set_enabled(enabled)?;

        Ok(())
    }
}

static HOOK: OnceCell<Hook> = OnceCell::new();

static WGL_SWAP_GUARD: ReentrancyGuard = ReentrancyGuard::new();
static GDI_SWAP_GUARD: ReentrancyGuard = ReentrancyGuard::new();
// one entry point may call the other
static RENDER_GUARD: ReentrancyGuard = ReentrancyGuard::new();

static BOUND_CONTEXT: AtomicUsize = AtomicUsize::new(0);

static FRAMES: Lazy<FrameState<GlResources>> =
    Lazy::new(|| FrameState::new(BackendKind::OpenGl));

pub struct GlResources {
    context: usize,
}

struct GlSurface {
    window: WindowHandle,
    context: HGLRC,
}

impl SwapchainTarget for GlSurface {
    type Resources = GlResources;

    fn window(&self) -> WindowHandle {
        self.window
    }

    fn create(&self, ui: &mut dyn OverlayUi) -> anyhow::Result<GlResources> {
        ui.renderer_init(RendererInit::OpenGl {
            glsl_version: GLSL_VERSION,
        })?;

        let context = self.context.0 as usize;
        BOUND_CONTEXT.store(context, Ordering::Release);
        Ok(GlResources { context })
    }

    fn invalidate(&self, _: &mut GlResources, ui: &mut dyn OverlayUi) {
        ui.invalidate_device_objects(BackendKind::OpenGl);
    }

    fn rebuild(&self, _: &mut GlResources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        if !ui.create_device_objects(BackendKind::OpenGl) {
            bail!("device object creation failed");
        }

        Ok(())
    }

    fn draw(&self, resources: &mut GlResources, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        if resources.context != self.context.0 as usize {
            bail!("swap on another gl context");
        }

        ui.render_draw_data(BackendKind::OpenGl, DrawTarget::Immediate);
        Ok(())
    }
}

#[tracing::instrument(skip(options))]
fn install(options: &OverlayOptions) -> anyhow::Result<()> {
    for guard in [&WGL_SWAP_GUARD, &GDI_SWAP_GUARD, &RENDER_GUARD] {
        guard.set_scope(options.guard_scope);
    }

    let hook = HOOK.get_or_try_init(|| {
        let addrs = get_wgl_addrs().context("failed to load wgl addrs")?;

        unsafe {
            debug!("hooking wglSwapBuffers");
            let wgl_swap_buffers =
                DetourHook::attach(addrs.swap_buffers, hooked_wgl_swap_buffers as _)?;

            debug!("hooking SwapBuffers");
            let swap_buffers =
                DetourHook::attach(SwapBuffers as SwapBuffersFn, hooked_swap_buffers as _)?;

            debug!("hooking wglDeleteContext");
            let wgl_delete_context =
                DetourHook::attach(addrs.delete_context, hooked_wgl_delete_context as _)?;

            Ok::<_, anyhow::Error>(Hook {
                wgl_swap_buffers,
                swap_buffers,
                wgl_delete_context,
            })
        }
    })?;

    hook.wgl_delete_context.enable()?;
    hook.set_enabled(true)
}

fn swap(session: &SessionCore, hdc: HDC, original: impl FnOnce() -> BOOL) -> BOOL {
    let context = unsafe { wglGetCurrentContext() };
    if context.is_invalid() {
        return original();
    }

    let target = GlSurface {
        window: unsafe { WindowFromDC(hdc) }.into(),
        context,
    };
    FRAMES.present(session, &target, original)
}

fn intercept_swap(
    guard: &ReentrancyGuard,
    hdc: HDC,
    original: impl FnOnce() -> BOOL + Copy,
) -> BOOL {
    guard.run(original, || {
        RENDER_GUARD.run(original, || match session::current() {
            Some(session) => swap(&session, hdc, original),
            None => original(),
        })
    })
}

#[tracing::instrument]
extern "system" fn hooked_wgl_swap_buffers(hdc: HDC) -> BOOL {
    trace!("wglSwapBuffers called");

    intercept_swap(&WGL_SWAP_GUARD, hdc, || unsafe {
        HOOK.wait().wgl_swap_buffers.original_fn()(hdc)
    })
}

#[tracing::instrument]
extern "system" fn hooked_swap_buffers(hdc: HDC) -> BOOL {
    trace!("SwapBuffers called");

    intercept_swap(&GDI_SWAP_GUARD, hdc, || unsafe {
        HOOK.wait().swap_buffers.original_fn()(hdc)
    })
}

#[tracing::instrument]
extern "system" fn hooked_wgl_delete_context(hglrc: HGLRC) -> BOOL {
    trace!("wglDeleteContext called");

    if BOUND_CONTEXT
        .compare_exchange(hglrc.0 as usize, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        debug!("bound gl context {:?} deleted", hglrc);
        if let Some(session) = session::current() {
            shutdown_on(&session, hglrc);
        }
    }

    unsafe { HOOK.wait().wgl_delete_context.original_fn()(hglrc) }
}

/// Shut the candidate down with `hglrc` current, so the renderer can free its objects.
fn shutdown_on(session: &SessionCore, hglrc: HGLRC) {
    let shutdown = || {
        FRAMES.shutdown(session);
        session.release_window();
    };

    let last_hdc = unsafe { wglGetCurrentDC() };
    let last_context = unsafe { wglGetCurrentContext() };
    if last_context == hglrc {
        return shutdown();
    }

    let Some(window) = FRAMES.window() else {
        return shutdown();
    };
    let hwnd = window.hwnd();
    let hdc = unsafe { GetDC(Some(hwnd)) };
    defer!(unsafe {
        ReleaseDC(Some(hwnd), hdc);
    });

    if let Err(err) = unsafe { wglMakeCurrent(hdc, hglrc) } {
        debug!("cannot make deleted context current. err: {:?}", err);
        return shutdown();
    }
    defer!(unsafe {
        _ = wglMakeCurrent(last_hdc, last_context);
    });

    shutdown();
}

struct WglAddrs {
    swap_buffers: WglSwapBuffersFn,
    delete_context: WglDeleteContextFn,
}

#[tracing::instrument]
fn get_wgl_addrs() -> anyhow::Result<WglAddrs> {
    let opengl32module = unsafe { GetModuleHandleA(s!("opengl32.dll"))? };

    let func = unsafe {
        GetProcAddress(opengl32module, s!("wglSwapBuffers")).context("wglSwapBuffers not found")?
    };
    debug!("wglSwapBuffers found: {:p}", func);
    let swap_buffers =
        unsafe { mem::transmute::<unsafe extern "system" fn() -> isize, WglSwapBuffersFn>(func) };

    let func = unsafe {
        GetProcAddress(opengl32module, s!("wglDeleteContext"))
            .context("wglDeleteContext not found")?
    };
    debug!("wglDeleteContext found: {:p}", func);
    let delete_context =
        unsafe { mem::transmute::<unsafe extern "system" fn() -> isize, WglDeleteContextFn>(func) };

    Ok(WglAddrs {
        swap_buffers,
        delete_context,
    })
}
