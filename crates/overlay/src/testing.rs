//! Recording fakes shared by unit tests.

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::sync::Arc;

use anyhow::bail;
use parking_lot::Mutex;

use crate::{
    backend::{
        BackendKind, CandidateOps,
        frames::BufferContexts,
        state::{FrameState, SwapchainTarget},
    },
    config::OverlayOptions,
    session::SessionCore,
    types::WindowHandle,
    ui::{DrawTarget, OverlayUi, RendererInit, WindowMessage},
    wndproc::WindowProcOps,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    CreateContext,
    DestroyContext,
    EnableViewports,
    PlatformInit(WindowHandle),
    PlatformShutdown,
    PlatformNewFrame,
    Message(u32),
    NewFrame,
    Render,
    EndFrame,
    UpdatePlatformWindows,
    RendererInit(BackendKind),
    RendererNewFrame(BackendKind),
    RenderDrawData(BackendKind),
    Invalidate(BackendKind),
    CreateDeviceObjects(BackendKind),
    RendererShutdown(BackendKind),
}

#[derive(Debug, Clone, Default)]
pub struct UiLog(Arc<Mutex<Vec<UiEvent>>>);

impl UiLog {
    pub fn push(&self, event: UiEvent) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.0.lock().clone()
    }
}

pub struct RecordingUi {
    log: UiLog,
}

impl RecordingUi {
    pub fn new(log: UiLog) -> Self {
        Self { log }
    }
}

impl OverlayUi for RecordingUi {
    fn create_context(&mut self) -> anyhow::Result<()> {
        self.log.push(UiEvent::CreateContext);
        Ok(())
    }

    fn destroy_context(&mut self) {
        self.log.push(UiEvent::DestroyContext);
    }

    fn enable_viewports(&mut self) {
        self.log.push(UiEvent::EnableViewports);
    }

    fn platform_init(&mut self, window: WindowHandle) -> anyhow::Result<()> {
        self.log.push(UiEvent::PlatformInit(window));
        Ok(())
    }

    fn platform_shutdown(&mut self) {
        self.log.push(UiEvent::PlatformShutdown);
    }

    fn platform_new_frame(&mut self) {
        self.log.push(UiEvent::PlatformNewFrame);
    }

    fn handle_message(&mut self, message: &WindowMessage) -> isize {
        self.log.push(UiEvent::Message(message.msg));
        0
    }

    fn new_frame(&mut self) {
        self.log.push(UiEvent::NewFrame);
    }

    fn end_frame(&mut self) {
        self.log.push(UiEvent::EndFrame);
    }

    fn update_platform_windows(&mut self) {
        self.log.push(UiEvent::UpdatePlatformWindows);
    }

    fn renderer_init(&mut self, init: RendererInit<'_>) -> anyhow::Result<()> {
        self.log.push(UiEvent::RendererInit(init.kind()));
        Ok(())
    }

    fn renderer_new_frame(&mut self, kind: BackendKind) {
        self.log.push(UiEvent::RendererNewFrame(kind));
    }

    fn render_draw_data(&mut self, kind: BackendKind, _: DrawTarget) {
        self.log.push(UiEvent::RenderDrawData(kind));
    }

    fn invalidate_device_objects(&mut self, kind: BackendKind) {
        self.log.push(UiEvent::Invalidate(kind));
    }

    fn create_device_objects(&mut self, kind: BackendKind) -> bool {
        self.log.push(UiEvent::CreateDeviceObjects(kind));
        true
    }

    fn renderer_shutdown(&mut self, kind: BackendKind) {
        self.log.push(UiEvent::RendererShutdown(kind));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainEvent {
    Create(usize),
    Invalidate,
    Rebuild(usize),
    Draw,
}

#[derive(Debug)]
pub struct FakeContext {
    buffer: Option<usize>,
}

/// Per buffer resources of [`FakeSwapchain`].
#[derive(Debug)]
pub struct FakeFrames {
    contexts: BufferContexts<FakeContext>,
}

impl FakeFrames {
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Number of contexts bound to a buffer.
    pub fn bound(&mut self) -> usize {
        self.contexts
            .iter_mut()
            .filter(|context| context.buffer.is_some())
            .count()
    }
}

/// A swapchain of a configurable number of buffers.
pub struct FakeSwapchain {
    window: WindowHandle,
    kind: BackendKind,
    buffer_count: AtomicUsize,
    fail_create: AtomicBool,
    fail_rebuild: AtomicBool,
    events: Mutex<Vec<SwapchainEvent>>,
}

impl FakeSwapchain {
    pub fn new(window: WindowHandle, buffer_count: usize) -> Self {
        Self {
            window,
            kind: BackendKind::Dx11,
            buffer_count: AtomicUsize::new(buffer_count),
            fail_create: AtomicBool::new(false),
            fail_rebuild: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_buffer_count(&self, count: usize) {
        self.buffer_count.store(count, Ordering::Relaxed);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::Relaxed);
    }

    pub fn fail_rebuild(&self, fail: bool) {
        self.fail_rebuild.store(fail, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<SwapchainEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: SwapchainEvent) {
        self.events.lock().push(event);
    }

    fn bind(&self, frames: &mut FakeFrames) -> anyhow::Result<()> {
        let count = self.buffer_count.load(Ordering::Relaxed);
        frames
            .contexts
            .resize_with(count, |_| Ok(FakeContext { buffer: None }))?;
        frames.contexts.bind_each(|index, context| {
            context.buffer = Some(index);
            Ok(())
        })
    }
}

impl SwapchainTarget for FakeSwapchain {
    type Resources = FakeFrames;

    fn window(&self) -> WindowHandle {
        self.window
    }

    fn create(&self, ui: &mut dyn OverlayUi) -> anyhow::Result<FakeFrames> {
        let count = self.buffer_count.load(Ordering::Relaxed);
        self.record(SwapchainEvent::Create(count));
        if self.fail_create.load(Ordering::Relaxed) {
            bail!("device lost");
        }

        ui.renderer_init(RendererInit::Dx11 {
            device: core::ptr::null_mut(),
            context: core::ptr::null_mut(),
        })?;
        let mut frames = FakeFrames {
            contexts: BufferContexts::new(),
        };
        self.bind(&mut frames)?;
        Ok(frames)
    }

    fn invalidate(&self, frames: &mut FakeFrames, ui: &mut dyn OverlayUi) {
        self.record(SwapchainEvent::Invalidate);
        for context in frames.contexts.iter_mut() {
            context.buffer = None;
        }
        ui.invalidate_device_objects(self.kind);
    }

    fn rebuild(&self, frames: &mut FakeFrames, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        self.record(SwapchainEvent::Rebuild(
            self.buffer_count.load(Ordering::Relaxed),
        ));
        if self.fail_rebuild.load(Ordering::Relaxed) {
            bail!("out of memory");
        }

        self.bind(frames)?;
        ui.create_device_objects(self.kind);
        Ok(())
    }

    fn draw(&self, _: &mut FakeFrames, ui: &mut dyn OverlayUi) -> anyhow::Result<()> {
        self.record(SwapchainEvent::Draw);
        ui.render_draw_data(self.kind, DrawTarget::Immediate);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEvent {
    Attach(WindowHandle, Option<usize>),
    Enabled(bool),
}

thread_local! {
    static PROC_EVENTS: RefCell<Vec<ProcEvent>> = const { RefCell::new(Vec::new()) };
}

pub static RECORDING_PROC_OPS: WindowProcOps = WindowProcOps {
    attach: |window, custom| {
        PROC_EVENTS.with_borrow_mut(|events| events.push(ProcEvent::Attach(window, custom)));
        Ok(())
    },
    set_enabled: |enabled| {
        PROC_EVENTS.with_borrow_mut(|events| events.push(ProcEvent::Enabled(enabled)));
        Ok(())
    },
};

/// Drain window procedure events recorded on this thread.
pub fn proc_events() -> Vec<ProcEvent> {
    PROC_EVENTS.with_borrow_mut(core::mem::take)
}

/// View of the window procedure events recorded on this thread.
pub struct ProcRecorder;

impl ProcRecorder {
    /// Windows attached to so far, without draining.
    pub fn attached(&self) -> Vec<WindowHandle> {
        PROC_EVENTS.with_borrow(|events| {
            events
                .iter()
                .filter_map(|event| match *event {
                    ProcEvent::Attach(window, _) => Some(window),
                    ProcEvent::Enabled(_) => None,
                })
                .collect()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateEvent {
    Initialize,
    Enabled(bool),
    Deactivate,
    Shutdown,
}

thread_local! {
    static CANDIDATE_EVENTS: RefCell<Vec<CandidateEvent>> = const { RefCell::new(Vec::new()) };
    static CANDIDATE_FRAMES: FrameState<FakeFrames> = FrameState::new(BackendKind::Dx11);
}

fn record_candidate(event: CandidateEvent) {
    CANDIDATE_EVENTS.with_borrow_mut(|events| events.push(event));
}

/// Candidate whose hooks drive the frame state returned by [`with_candidate_frames`].
pub static RECORDING_CANDIDATE_OPS: CandidateOps = CandidateOps {
    is_supported: || true,
    initialize: |_| {
        record_candidate(CandidateEvent::Initialize);
        Ok(())
    },
    set_enabled: |enabled| {
        record_candidate(CandidateEvent::Enabled(enabled));
        Ok(())
    },
    deactivate: || {
        record_candidate(CandidateEvent::Deactivate);
        Ok(())
    },
    shutdown: |session| {
        record_candidate(CandidateEvent::Shutdown);
        CANDIDATE_FRAMES.with(|frames| frames.shutdown(session));
    },
};

pub static FAILING_CANDIDATE_OPS: CandidateOps = CandidateOps {
    is_supported: || true,
    initialize: |_| bail!("entry point is not patchable"),
    set_enabled: |_| Ok(()),
    deactivate: || Ok(()),
    shutdown: |_| {},
};

pub fn candidate_events() -> Vec<CandidateEvent> {
    CANDIDATE_EVENTS.with_borrow_mut(core::mem::take)
}

pub fn with_candidate_frames<T>(f: impl FnOnce(&FrameState<FakeFrames>) -> T) -> T {
    CANDIDATE_FRAMES.with(f)
}

type RenderHook = Box<dyn FnMut() + Send>;

/// A session that is not published, with recording collaborators.
pub struct Fixture {
    pub session: Arc<SessionCore>,
    pub window_proc: ProcRecorder,
    log: UiLog,
    renders: Arc<AtomicUsize>,
    render_hook: Arc<Mutex<Option<RenderHook>>>,
}

impl Fixture {
    pub fn ui_events(&self) -> Vec<UiEvent> {
        self.log.events()
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::Relaxed)
    }

    pub fn draw_count(&self) -> usize {
        self.log
            .events()
            .iter()
            .filter(|event| matches!(event, UiEvent::RenderDrawData(_)))
            .count()
    }

    /// Run `hook` at the end of every render callback.
    pub fn set_render_hook(&self, hook: RenderHook) {
        *self.render_hook.lock() = Some(hook);
    }
}

pub fn fixture(window: WindowHandle) -> Fixture {
    fixture_with(window, OverlayOptions::default())
}

pub fn fixture_with(window: WindowHandle, options: OverlayOptions) -> Fixture {
    proc_events();

    let log = UiLog::default();
    let renders = Arc::new(AtomicUsize::new(0));
    let render_hook = Arc::new(Mutex::new(None::<RenderHook>));

    let render = {
        let log = log.clone();
        let renders = renders.clone();
        let render_hook = render_hook.clone();
        move || {
            renders.fetch_add(1, Ordering::Relaxed);
            log.push(UiEvent::Render);
            if let Some(hook) = render_hook.lock().as_mut() {
                hook();
            }
        }
    };

    let session = SessionCore::new(
        Box::new(RecordingUi::new(log.clone())),
        Box::new(render),
        window,
        options,
        Vec::new(),
        &RECORDING_PROC_OPS,
    );

    Fixture {
        session: Arc::new(session),
        window_proc: ProcRecorder,
        log,
        renders,
        render_hook,
    }
}
