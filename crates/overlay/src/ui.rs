//! Seam between the overlay and the immediate mode UI library drawing it.

use core::ffi::c_void;

use crate::{backend::BackendKind, types::WindowHandle};

/// Native objects handed to the UI library renderer backend on initialization.
///
/// Pointers are borrowed COM or driver objects owned by the host or by the overlay backend.
#[derive(Debug, Clone, Copy)]
pub enum RendererInit<'a> {
    Dx9 {
        device: *mut c_void,
    },
    Dx11 {
        device: *mut c_void,
        context: *mut c_void,
    },
    Dx12 {
        device: *mut c_void,
        frames_in_flight: u32,
        /// `DXGI_FORMAT` of the swapchain buffers.
        format: i32,
        srv_heap: *mut c_void,
        srv_cpu_handle: usize,
        srv_gpu_handle: u64,
    },
    OpenGl {
        glsl_version: &'a str,
    },
}

impl RendererInit<'_> {
    pub const fn kind(&self) -> BackendKind {
        match self {
            RendererInit::Dx9 { .. } => BackendKind::Dx9,
            RendererInit::Dx11 { .. } => BackendKind::Dx11,
            RendererInit::Dx12 { .. } => BackendKind::Dx12,
            RendererInit::OpenGl { .. } => BackendKind::OpenGl,
        }
    }
}

/// Where composed draw data is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawTarget {
    /// The device's current immediate context and render target.
    Immediate,

    /// An open graphics command list (`ID3D12GraphicsCommandList`).
    CommandList(*mut c_void),
}

/// A window message as received by the intercepted window procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowMessage {
    pub window: WindowHandle,
    pub msg: u32,
    pub wparam: usize,
    pub lparam: isize,
}

/// The overlay drawing context and its platform and renderer backends.
///
/// Implemented on top of the UI library by the embedder. Calls are made from the host's
/// rendering and message threads, serialized by the session.
pub trait OverlayUi: Send {
    fn create_context(&mut self) -> anyhow::Result<()>;

    fn destroy_context(&mut self);

    /// Turn on multi-viewport support. Called once after the context is created.
    fn enable_viewports(&mut self) {}

    fn platform_init(&mut self, window: WindowHandle) -> anyhow::Result<()>;

    fn platform_shutdown(&mut self);

    fn platform_new_frame(&mut self);

    /// Feed a window message to the UI library input translation.
    fn handle_message(&mut self, message: &WindowMessage) -> isize;

    fn new_frame(&mut self);

    /// Finish the frame and compose its draw data.
    fn end_frame(&mut self);

    /// Update and render additional platform windows.
    fn update_platform_windows(&mut self) {}

    fn renderer_init(&mut self, init: RendererInit<'_>) -> anyhow::Result<()>;

    fn renderer_new_frame(&mut self, kind: BackendKind);

    fn render_draw_data(&mut self, kind: BackendKind, target: DrawTarget);

    fn invalidate_device_objects(&mut self, kind: BackendKind);

    fn create_device_objects(&mut self, kind: BackendKind) -> bool;

    fn renderer_shutdown(&mut self, kind: BackendKind);
}
