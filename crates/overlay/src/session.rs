//! Overlay session.
//!
//! [`Overlay`] is the caller owned handle. While created, its state is published in a
//! process wide slot so native trampolines, which carry no user data, can reach it.
//! Only one session can be published at a time.

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use std::sync::Arc;

use anyhow::anyhow;
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, warn};

use crate::{
    backend::{BackendCandidate, BackendKind},
    config::OverlayOptions,
    error::OverlayError,
    selector::select_supported,
    types::WindowHandle,
    ui::{OverlayUi, WindowMessage},
    wndproc::{self, WindowProcInterceptor, WindowProcOps, filter_message},
};

static ACTIVE: ArcSwapOption<SessionCore> = ArcSwapOption::const_empty();

// Serializes publishing and retracting sessions.
static ACTIVATION: Mutex<()> = Mutex::new(());

/// Currently published session.
#[inline]
pub(crate) fn current() -> Option<Arc<SessionCore>> {
    ACTIVE.load_full()
}

struct RenderCallback(Box<dyn FnMut() + Send>);

impl RenderCallback {
    #[inline]
    fn call(&mut self) {
        (self.0)()
    }
}

/// Session state shared with the trampolines.
pub(crate) struct SessionCore {
    options: OverlayOptions,
    candidates: Vec<BackendCandidate>,

    ui: ReentrantMutex<RefCell<Box<dyn OverlayUi>>>,
    render: Mutex<RenderCallback>,

    active: AtomicBool,
    window: AtomicUsize,
    fixed_window: bool,
    platform_ready: AtomicBool,
    teardown_pending: AtomicBool,
    suppress_deactivation: AtomicBool,
    window_proc: WindowProcInterceptor,
}

impl SessionCore {
    pub fn new(
        ui: Box<dyn OverlayUi>,
        render: Box<dyn FnMut() + Send>,
        window: WindowHandle,
        options: OverlayOptions,
        candidates: Vec<BackendCandidate>,
        proc_ops: &'static WindowProcOps,
    ) -> Self {
        Self {
            suppress_deactivation: AtomicBool::new(options.suppress_deactivation),
            options,
            candidates,
            ui: ReentrantMutex::new(RefCell::new(ui)),
            render: Mutex::new(RenderCallback(render)),
            active: AtomicBool::new(true),
            window: AtomicUsize::new(window.raw()),
            fixed_window: !window.is_null(),
            platform_ready: AtomicBool::new(false),
            teardown_pending: AtomicBool::new(false),
            window_proc: WindowProcInterceptor::new(proc_ops),
        }
    }

    pub fn options(&self) -> &OverlayOptions {
        &self.options
    }

    pub fn candidates(&self) -> &[BackendCandidate] {
        &self.candidates
    }

    /// Bound window, if any.
    pub fn window(&self) -> Option<WindowHandle> {
        let window = WindowHandle::new(self.window.load(Ordering::Acquire));
        (!window.is_null()).then_some(window)
    }

    /// Whether a call for `window` may be intercepted.
    ///
    /// True while unbound, or if `window` is the bound window.
    pub fn check_window_handle(&self, window: WindowHandle) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }

        let bound = self.window.load(Ordering::Acquire);
        bound == 0 || bound == window.raw()
    }

    /// Bind `window` if unbound. Returns true if `window` is the bound window afterwards.
    pub fn bind_window(&self, window: WindowHandle) -> bool {
        if window.is_null() || !self.active.load(Ordering::Acquire) {
            return false;
        }

        match self
            .window
            .compare_exchange(0, window.raw(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!("overlay bound to window {}", window);
                true
            }
            Err(bound) => bound == window.raw(),
        }
    }

    /// Forget the bound window after its device went away, permitting rebinding.
    ///
    /// A window given by the caller stays bound.
    pub fn release_window(&self) {
        if self.fixed_window {
            return;
        }

        let previous = self.window.swap(0, Ordering::AcqRel);
        if previous == 0 {
            return;
        }

        if let Err(err) = self.window_proc.detach() {
            warn!("window procedure detach failed. err: {:?}", err);
        }
        if self.platform_ready.swap(false, Ordering::AcqRel) {
            self.with_ui(|ui| ui.platform_shutdown());
        }
        debug!("window {} released", WindowHandle::new(previous));
    }

    /// Run `f` on the drawing context.
    ///
    /// Returns [`None`] if the context is already in use further up the current thread's stack.
    pub fn with_ui<R>(&self, f: impl FnOnce(&mut dyn OverlayUi) -> R) -> Option<R> {
        let lock = self.ui.lock();
        let Ok(mut ui) = lock.try_borrow_mut() else {
            trace!("overlay context busy");
            return None;
        };

        Some(f(&mut **ui))
    }

    /// Initialize the platform backend and intercept the window procedure, once per window.
    pub fn prepare_window(&self, window: WindowHandle, ui: &mut dyn OverlayUi) {
        if !self.platform_ready.load(Ordering::Acquire) {
            match ui.platform_init(window) {
                Ok(()) => {
                    self.platform_ready.store(true, Ordering::Release);
                    debug!("platform backend initialized for {}", window);
                }
                Err(err) => debug!("platform backend init failed. err: {:?}", err),
            }
        }

        if let Err(err) = self
            .window_proc
            .attach(window, self.options.custom_window_procedure)
        {
            debug!("window procedure attach failed. err: {:?}", err);
        }
    }

    /// Drive one overlay frame and run the render callback.
    pub fn new_frame(&self, ui: &mut dyn OverlayUi) {
        if let Some(window) = self.window() {
            self.prepare_window(window, ui);
        }

        ui.platform_new_frame();
        ui.new_frame();
        match self.render.try_lock() {
            Some(mut render) => render.call(),
            None => trace!("render callback already running"),
        }
        ui.end_frame();

        if self.options.enable_viewports {
            ui.update_platform_windows();
        }
    }

    /// Handle a message received by the intercepted window procedure.
    ///
    /// Returns the result to use instead of forwarding to the original procedure.
    pub fn dispatch_window_message(&self, message: &WindowMessage) -> Option<isize> {
        if self.window() != Some(message.window) {
            return None;
        }

        self.with_ui(|ui| ui.handle_message(message));
        self.finish_teardown();
        filter_message(message, self.suppress_deactivation.load(Ordering::Relaxed))
    }

    pub fn set_suppress_deactivation(&self, suppress: bool) {
        self.suppress_deactivation.store(suppress, Ordering::Relaxed);
    }

    fn create_context(&self) -> Result<(), OverlayError> {
        self.with_ui(|ui| {
            ui.create_context()?;
            if self.options.enable_viewports {
                ui.enable_viewports();
            }

            Ok(())
        })
        .unwrap_or_else(|| Err(anyhow!("overlay context busy")))
        .map_err(|err| OverlayError::Context(err.into()))
    }

    fn initialize_candidates(&self) -> Result<(), OverlayError> {
        for candidate in &self.candidates {
            candidate.initialize(&self.options)?;
        }

        Ok(())
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), OverlayError> {
        if let Err(err) = self.window_proc.set_enabled(enabled) {
            warn!("window procedure toggle failed. err: {:?}", err);
        }

        self.set_candidates_enabled(enabled)
    }

    fn set_candidates_enabled(&self, enabled: bool) -> Result<(), OverlayError> {
        let mut result = Ok(());
        for candidate in &self.candidates {
            if let Err(err) = candidate.set_enabled(enabled) {
                warn!("{} hook toggle failed. err: {:?}", candidate.kind(), err);
                if result.is_ok() {
                    result = Err(OverlayError::HookToggle {
                        kind: candidate.kind(),
                        source: err.into(),
                    });
                }
            }
        }

        result
    }

    /// Deactivate every hook and release device objects and the drawing context.
    ///
    /// If the drawing context is in use further up this thread's stack, as when destroyed
    /// from the render callback, the release is left to [`SessionCore::finish_teardown`].
    fn teardown(&self) {
        self.active.store(false, Ordering::Release);
        for candidate in &self.candidates {
            if let Err(err) = candidate.deactivate() {
                warn!("{} hook deactivation failed. err: {:?}", candidate.kind(), err);
            }
        }

        if let Err(err) = self.window_proc.detach() {
            warn!("window procedure detach failed. err: {:?}", err);
        }

        self.teardown_pending.store(true, Ordering::Release);
        self.finish_teardown();
    }

    #[inline]
    fn ui_in_use(&self) -> bool {
        self.ui.lock().try_borrow_mut().is_err()
    }

    /// Release what a teardown left behind, once the drawing context is free.
    ///
    /// Called whenever an intercepted frame unwinds. Does nothing unless torn down.
    pub fn finish_teardown(&self) {
        if !self.teardown_pending.load(Ordering::Acquire) {
            return;
        }
        if self.ui_in_use() {
            debug!("torn down inside a frame, releasing once it ends");
            return;
        }
        if !self.teardown_pending.swap(false, Ordering::AcqRel) {
            return;
        }

        if self.platform_ready.swap(false, Ordering::AcqRel) {
            self.with_ui(|ui| ui.platform_shutdown());
        }

        for candidate in &self.candidates {
            candidate.shutdown(self);
        }

        if self.with_ui(|ui| ui.destroy_context()).is_none() {
            warn!("overlay context destroyed while in use");
        }
        self.window.store(0, Ordering::Release);
        debug!("session resources released");
    }
}

/// An overlay drawn into the frames of the host application.
///
/// Dropping a created overlay destroys it.
#[derive(Default)]
pub struct Overlay {
    core: Option<Arc<SessionCore>>,
}

impl Overlay {
    pub const fn new() -> Self {
        Self { core: None }
    }

    pub fn is_created(&self) -> bool {
        self.core.is_some()
    }

    /// Create the overlay.
    ///
    /// `render` is called once per intercepted frame between the overlay's new frame and end frame.
    /// If `window` is given, only frames presented to it are intercepted. Otherwise the first
    /// window presented to is bound.
    ///
    /// Does nothing if this overlay is already created.
    pub async fn create<U, F>(
        &mut self,
        ui: U,
        render: F,
        window: Option<WindowHandle>,
        options: OverlayOptions,
    ) -> Result<(), OverlayError>
    where
        U: OverlayUi + 'static,
        F: FnMut() + Send + 'static,
    {
        if self.core.is_some() {
            debug!("overlay already created");
            return Ok(());
        }
        if current().is_some() {
            return Err(OverlayError::AlreadyActive);
        }

        let candidates = match options.candidates {
            Some(ref kinds) => kinds.iter().copied().map(BackendCandidate::new).collect(),
            None => {
                let candidates = BackendKind::ALL.map(BackendCandidate::new).to_vec();
                select_supported(candidates, &options.selector).await?
            }
        };

        self.start(
            Box::new(ui),
            Box::new(render),
            window.unwrap_or_default(),
            options,
            candidates,
            wndproc::platform_ops(),
        )
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn start(
        &mut self,
        ui: Box<dyn OverlayUi>,
        render: Box<dyn FnMut() + Send>,
        window: WindowHandle,
        options: OverlayOptions,
        candidates: Vec<BackendCandidate>,
        proc_ops: &'static WindowProcOps,
    ) -> Result<(), OverlayError> {
        if self.core.is_some() {
            return Ok(());
        }
        if candidates.is_empty() {
            return Err(OverlayError::NoSupportedBackend {
                waited: Duration::ZERO,
            });
        }

        let _activation = ACTIVATION.lock();
        if ACTIVE.load().is_some() {
            return Err(OverlayError::AlreadyActive);
        }

        let core = Arc::new(SessionCore::new(
            ui, render, window, options, candidates, proc_ops,
        ));
        core.create_context()?;

        ACTIVE.store(Some(core.clone()));
        if let Err(err) = core.initialize_candidates() {
            debug!("candidate initialization failed, rolling back");
            ACTIVE.store(None);
            core.teardown();
            return Err(err);
        }

        debug!(
            "overlay created with backends: {:?}",
            core.candidates()
                .iter()
                .map(BackendCandidate::kind)
                .collect::<Vec<_>>()
        );
        self.core = Some(core);
        Ok(())
    }

    /// Destroy the overlay, releasing device objects and the drawing context.
    ///
    /// Hooks are deactivated but stay installed so a later [`Overlay::create`] can reuse them.
    #[tracing::instrument(skip_all)]
    pub fn destroy(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };

        let _activation = ACTIVATION.lock();
        if ACTIVE
            .load()
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &core))
        {
            ACTIVE.store(None);
        }
        core.teardown();
        debug!("overlay destroyed");
    }

    /// Resume interception.
    pub fn enable(&self) -> Result<(), OverlayError> {
        match self.core {
            Some(ref core) => core.set_enabled(true),
            None => Ok(()),
        }
    }

    /// Suspend interception. Device resources are kept.
    pub fn disable(&self) -> Result<(), OverlayError> {
        match self.core {
            Some(ref core) => core.set_enabled(false),
            None => Ok(()),
        }
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        self.core.as_ref().map_or_else(Vec::new, |core| {
            core.candidates()
                .iter()
                .map(BackendCandidate::kind)
                .collect()
        })
    }

    /// Window the overlay is bound to.
    pub fn window(&self) -> Option<WindowHandle> {
        self.core.as_ref().and_then(|core| core.window())
    }

    pub fn set_suppress_deactivation(&self, suppress: bool) {
        if let Some(ref core) = self.core {
            core.set_suppress_deactivation(suppress);
        }
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.destroy();
    }
}
