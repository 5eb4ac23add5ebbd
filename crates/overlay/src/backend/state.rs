//! Per candidate present / resize state machine.
//!
//! Native trampolines hold the entry point guard, describe the call with a
//! [`SwapchainTarget`] and hand the original function over as a closure.

use core::cell::RefCell;

use parking_lot::ReentrantMutex;
use tracing::{debug, trace};

use crate::{
    backend::BackendKind,
    error::OverlayError,
    session::SessionCore,
    types::{CallOutcome, WindowHandle},
    ui::OverlayUi,
};

/// A swapchain or device seen by an intercepted call.
pub(crate) trait SwapchainTarget {
    type Resources: Send;

    /// Window the call presents to. May be null.
    fn window(&self) -> WindowHandle;

    /// Initialize the renderer backend and build device resources.
    fn create(&self, ui: &mut dyn OverlayUi) -> anyhow::Result<Self::Resources>;

    /// Drop every buffer bound resource before the original resize.
    fn invalidate(&self, resources: &mut Self::Resources, ui: &mut dyn OverlayUi);

    /// Recreate buffer bound resources after a successful resize.
    fn rebuild(&self, resources: &mut Self::Resources, ui: &mut dyn OverlayUi)
    -> anyhow::Result<()>;

    /// Submit the composed draw data.
    fn draw(&self, resources: &mut Self::Resources, ui: &mut dyn OverlayUi) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceState {
    Ready,
    /// Released for a resize that has not succeeded yet.
    Invalidated,
    /// Resize succeeded but rebuilding failed. Retried on the next present.
    RebuildPending,
}

struct FrameInner<R> {
    initialized: bool,
    window: WindowHandle,
    resources: Option<R>,
    state: ResourceState,
}

pub(crate) struct FrameState<R> {
    kind: BackendKind,
    inner: ReentrantMutex<RefCell<FrameInner<R>>>,
}

impl<R: Send> FrameState<R> {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            inner: ReentrantMutex::new(RefCell::new(FrameInner {
                initialized: false,
                window: WindowHandle::NULL,
                resources: None,
                state: ResourceState::Ready,
            })),
        }
    }

    pub fn is_initialized(&self) -> bool {
        let lock = self.inner.lock();
        lock.try_borrow().is_ok_and(|inner| inner.initialized)
    }

    pub fn window(&self) -> Option<WindowHandle> {
        let lock = self.inner.lock();
        lock.try_borrow()
            .ok()
            .filter(|inner| inner.initialized)
            .map(|inner| inner.window)
    }

    /// Run the resources through `f` if initialized.
    pub fn with_resources<T>(&self, f: impl FnOnce(&mut R) -> T) -> Option<T> {
        let lock = self.inner.lock();
        let mut inner = lock.try_borrow_mut().ok()?;
        inner.resources.as_mut().map(f)
    }

    /// Present interception body. Forwards to `original` in every case and returns its result.
    #[tracing::instrument(level = "trace", skip_all, fields(kind = %self.kind))]
    pub fn present<T, O>(&self, session: &SessionCore, target: &T, original: impl FnOnce() -> O) -> O
    where
        T: SwapchainTarget<Resources = R>,
    {
        let window = target.window();
        if session.check_window_handle(window) {
            self.frame(session, target);
        } else {
            trace!("ignoring present to foreign window {}", window);
        }

        // the session may have been destroyed by the render callback
        session.finish_teardown();
        original()
    }

    fn frame<T>(&self, session: &SessionCore, target: &T)
    where
        T: SwapchainTarget<Resources = R>,
    {
        let window = target.window();
        let lock = self.inner.lock();
        let Ok(mut inner) = lock.try_borrow_mut() else {
            trace!("frame state busy");
            return;
        };

        if inner.initialized {
            // rebinds if another backend released the window
            if inner.window == window && session.bind_window(window) {
                self.render(&mut inner, session, target);
            } else {
                trace!("initialized on {}, ignoring {}", inner.window, window);
            }
        } else if self.initialize(&mut inner, session, target) {
            self.render(&mut inner, session, target);
        }
    }

    fn initialize<T>(&self, inner: &mut FrameInner<R>, session: &SessionCore, target: &T) -> bool
    where
        T: SwapchainTarget<Resources = R>,
    {
        let window = target.window();
        if window.is_null() {
            trace!("present without window, waiting for next frame");
            return false;
        }

        if !session.bind_window(window) {
            trace!("window {} lost the binding race", window);
            return false;
        }

        let created = session.with_ui(|ui| {
            let resources = target.create(ui)?;
            session.prepare_window(window, ui);
            Ok::<_, anyhow::Error>(resources)
        });

        match created {
            Some(Ok(resources)) => {
                debug!("{} initialized on window {}", self.kind, window);
                inner.resources = Some(resources);
                inner.window = window;
                inner.state = ResourceState::Ready;
                inner.initialized = true;
                true
            }

            Some(Err(err)) => {
                let err = OverlayError::DeviceResourceCreation {
                    kind: self.kind,
                    source: err.into(),
                };
                debug!("{:?}, retrying next frame", err);
                false
            }

            None => false,
        }
    }

    fn render<T>(&self, inner: &mut FrameInner<R>, session: &SessionCore, target: &T)
    where
        T: SwapchainTarget<Resources = R>,
    {
        let kind = self.kind;
        let FrameInner {
            resources: Some(resources),
            state,
            ..
        } = inner
        else {
            return;
        };

        session.with_ui(|ui| {
            match *state {
                ResourceState::Ready => {}

                ResourceState::Invalidated => {
                    trace!("resources invalidated, skipping overlay");
                    return;
                }

                ResourceState::RebuildPending => {
                    if let Err(err) = target.rebuild(resources, ui) {
                        trace!("rebuild failed again. err: {:?}", err);
                        return;
                    }
                    debug!("resources rebuilt");
                    *state = ResourceState::Ready;
                }
            }

            ui.renderer_new_frame(kind);
            session.new_frame(ui);
            if let Err(err) = target.draw(resources, ui) {
                debug!("draw failed. err: {:?}", err);
            }
        });
    }

    /// Resize interception body.
    ///
    /// Resources are invalidated before `original` runs and rebuilt only if it succeeds.
    /// Its result is returned unchanged.
    #[tracing::instrument(level = "trace", skip_all, fields(kind = %self.kind))]
    pub fn resize<T, O>(&self, session: &SessionCore, target: &T, original: impl FnOnce() -> O) -> O
    where
        T: SwapchainTarget<Resources = R>,
        O: CallOutcome,
    {
        if !self.invalidate(session, target) {
            return original();
        }

        let result = original();
        if !result.succeeded() {
            debug!(
                "{:?}, resources stay invalidated",
                OverlayError::OriginalCallFailure(result.code())
            );
            return result;
        }

        let lock = self.inner.lock();
        let Ok(mut inner) = lock.try_borrow_mut() else {
            return result;
        };
        let FrameInner {
            resources: Some(resources),
            state,
            ..
        } = &mut *inner
        else {
            return result;
        };

        *state = match session.with_ui(|ui| target.rebuild(resources, ui)) {
            Some(Ok(())) => {
                debug!("resources rebuilt after resize");
                ResourceState::Ready
            }

            Some(Err(err)) => {
                debug!("rebuild after resize failed. err: {:?}", err);
                ResourceState::RebuildPending
            }

            None => ResourceState::RebuildPending,
        };

        result
    }

    /// Invalidate resources ahead of a resize of the bound window.
    fn invalidate<T>(&self, session: &SessionCore, target: &T) -> bool
    where
        T: SwapchainTarget<Resources = R>,
    {
        let lock = self.inner.lock();
        let Ok(mut inner) = lock.try_borrow_mut() else {
            return false;
        };

        if !inner.initialized {
            return false;
        }

        let window = target.window();
        if window != inner.window || !session.check_window_handle(window) {
            trace!("ignoring resize of foreign window {}", window);
            return false;
        }

        let FrameInner {
            resources: Some(resources),
            state,
            ..
        } = &mut *inner
        else {
            return false;
        };

        session.with_ui(|ui| target.invalidate(resources, ui));
        *state = ResourceState::Invalidated;
        true
    }

    /// Release resources and the renderer backend, allowing a later rebind.
    #[tracing::instrument(skip_all, fields(kind = %self.kind))]
    pub fn shutdown(&self, session: &SessionCore) {
        let lock = self.inner.lock();
        let Ok(mut inner) = lock.try_borrow_mut() else {
            debug!("shutdown requested from inside a frame, ignoring");
            return;
        };

        let initialized = inner.initialized;
        let resources = inner.resources.take();
        inner.initialized = false;
        inner.window = WindowHandle::NULL;
        inner.state = ResourceState::Ready;
        drop(resources);

        if initialized {
            session.with_ui(|ui| ui.renderer_shutdown(self.kind));
            debug!("{} shut down", self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::{
        guard::ReentrancyGuard,
        testing::{FakeSwapchain, SwapchainEvent, UiEvent, fixture},
    };

    use super::*;

    const WINDOW: WindowHandle = WindowHandle::new(0x1000);
    const OTHER_WINDOW: WindowHandle = WindowHandle::new(0x2000);

    #[test]
    fn first_present_binds_and_attaches() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx12);
        let swapchain = FakeSwapchain::new(WINDOW, 2);

        let result = state.present(&fixture.session, &swapchain, || 7);

        assert_eq!(result, 7);
        assert!(state.is_initialized());
        assert_eq!(state.window(), Some(WINDOW));
        assert_eq!(fixture.session.window(), Some(WINDOW));
        assert_eq!(fixture.window_proc.attached(), vec![WINDOW]);
        assert_eq!(
            swapchain.events(),
            vec![SwapchainEvent::Create(2), SwapchainEvent::Draw]
        );
        assert_eq!(state.with_resources(|frames| frames.len()), Some(2));
        assert_eq!(fixture.render_count(), 1);
    }

    #[test]
    fn foreign_window_is_forwarded_untouched() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx11);
        state.present(&fixture.session, &FakeSwapchain::new(WINDOW, 2), || 0);
        let ui_before = fixture.ui_events().len();

        let other = FakeSwapchain::new(OTHER_WINDOW, 2);
        let mut forwarded = false;
        let result = state.present(&fixture.session, &other, || {
            forwarded = true;
            42
        });

        assert!(forwarded);
        assert_eq!(result, 42);
        assert!(other.events().is_empty());
        assert_eq!(fixture.ui_events().len(), ui_before);
        assert_eq!(fixture.session.window(), Some(WINDOW));
        assert_eq!(state.window(), Some(WINDOW));
        assert_eq!(fixture.render_count(), 1);
    }

    #[test]
    fn null_window_is_retried() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx9);

        let unbound = FakeSwapchain::new(WindowHandle::NULL, 1);
        assert_eq!(state.present(&fixture.session, &unbound, || 1), 1);
        assert!(!state.is_initialized());
        assert!(unbound.events().is_empty());
        assert_eq!(fixture.session.window(), None);

        let bound = FakeSwapchain::new(WINDOW, 1);
        state.present(&fixture.session, &bound, || 1);
        assert!(state.is_initialized());
    }

    #[test]
    fn creation_failure_is_retried_next_frame() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx11);
        let swapchain = FakeSwapchain::new(WINDOW, 2);
        swapchain.fail_create(true);

        assert_eq!(state.present(&fixture.session, &swapchain, || 3), 3);
        assert!(!state.is_initialized());
        assert_eq!(fixture.render_count(), 0);

        swapchain.fail_create(false);
        state.present(&fixture.session, &swapchain, || 3);
        assert!(state.is_initialized());
        assert_eq!(fixture.render_count(), 1);
    }

    #[test]
    fn initialization_happens_once() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx12);
        let swapchain = FakeSwapchain::new(WINDOW, 3);

        for _ in 0..3 {
            state.present(&fixture.session, &swapchain, || 0);
        }

        let creates = swapchain
            .events()
            .into_iter()
            .filter(|event| matches!(event, SwapchainEvent::Create(_)))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(fixture.render_count(), 3);
        assert_eq!(fixture.window_proc.attached(), vec![WINDOW]);
    }

    #[test]
    fn frame_runs_in_order() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx11);
        state.present(&fixture.session, &FakeSwapchain::new(WINDOW, 1), || 0);

        let events = fixture.ui_events();
        let frame_start = events
            .iter()
            .position(|event| *event == UiEvent::RendererNewFrame(BackendKind::Dx11))
            .unwrap();
        assert_eq!(
            events[frame_start..],
            [
                UiEvent::RendererNewFrame(BackendKind::Dx11),
                UiEvent::PlatformNewFrame,
                UiEvent::NewFrame,
                UiEvent::Render,
                UiEvent::EndFrame,
                UiEvent::RenderDrawData(BackendKind::Dx11),
            ]
        );
    }

    #[test]
    fn nested_present_forwards() {
        static GUARD: ReentrancyGuard = ReentrancyGuard::new();

        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx12);
        let swapchain = FakeSwapchain::new(WINDOW, 2);

        let nested = Arc::new(Mutex::new(Vec::new()));
        let results = nested.clone();
        fixture.set_render_hook(Box::new(move || {
            results
                .lock()
                .push(GUARD.run(|| "forwarded", || "intercepted"));
        }));

        let result = GUARD.run(
            || 0,
            || state.present(&fixture.session, &swapchain, || 1),
        );

        assert_eq!(result, 1);
        assert_eq!(*nested.lock(), vec!["forwarded"]);
        assert_eq!(fixture.render_count(), 1);
        assert!(!GUARD.is_held());
    }

    #[test]
    fn present_from_render_callback_does_not_recurse() {
        let fixture = fixture(WindowHandle::NULL);
        let state = Arc::new(FrameState::new(BackendKind::Dx11));
        let swapchain = Arc::new(FakeSwapchain::new(WINDOW, 1));

        let session = fixture.session.clone();
        let nested_state = state.clone();
        let nested_swapchain = swapchain.clone();
        let nested_results = Arc::new(Mutex::new(Vec::new()));
        let results = nested_results.clone();
        fixture.set_render_hook(Box::new(move || {
            let result = nested_state.present(&session, &*nested_swapchain, || 5);
            results.lock().push(result);
        }));

        assert_eq!(state.present(&fixture.session, &*swapchain, || 1), 1);

        assert_eq!(*nested_results.lock(), vec![5]);
        assert_eq!(fixture.render_count(), 1);
        let draws = swapchain
            .events()
            .into_iter()
            .filter(|event| *event == SwapchainEvent::Draw)
            .count();
        assert_eq!(draws, 1);
    }

    #[test]
    fn resize_rebuilds_to_buffer_count() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx12);
        let swapchain = FakeSwapchain::new(WINDOW, 2);
        state.present(&fixture.session, &swapchain, || 0);

        swapchain.set_buffer_count(4);
        let result = state.resize(&fixture.session, &swapchain, || 0_i32);

        assert_eq!(result, 0);
        assert_eq!(state.with_resources(|frames| frames.len()), Some(4));
        assert_eq!(state.with_resources(|frames| frames.bound()), Some(4));
        assert_eq!(
            swapchain.events()[2..],
            [SwapchainEvent::Invalidate, SwapchainEvent::Rebuild(4)]
        );

        swapchain.set_buffer_count(1);
        state.resize(&fixture.session, &swapchain, || 0_i32);
        assert_eq!(state.with_resources(|frames| frames.len()), Some(1));
    }

    #[test]
    fn resize_invalidates_before_original() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx12);
        let swapchain = FakeSwapchain::new(WINDOW, 2);
        state.present(&fixture.session, &swapchain, || 0);

        state.resize(&fixture.session, &swapchain, || {
            assert_eq!(state.with_resources(|frames| frames.bound()), Some(0));
            0_i32
        });
    }

    #[test]
    fn failed_resize_stays_invalidated() {
        const DXGI_ERROR_INVALID_CALL: i32 = 0x887A0001_u32 as i32;

        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx12);
        let swapchain = FakeSwapchain::new(WINDOW, 2);
        state.present(&fixture.session, &swapchain, || 0);

        swapchain.set_buffer_count(3);
        let result = state.resize(&fixture.session, &swapchain, || DXGI_ERROR_INVALID_CALL);
        assert_eq!(result, DXGI_ERROR_INVALID_CALL);
        assert!(!swapchain.events().contains(&SwapchainEvent::Rebuild(3)));
        assert_eq!(state.with_resources(|frames| frames.bound()), Some(0));

        // presents skip drawing until a resize succeeds
        let draws_before = fixture.draw_count();
        state.present(&fixture.session, &swapchain, || 0);
        assert_eq!(fixture.draw_count(), draws_before);
        assert_eq!(state.with_resources(|frames| frames.bound()), Some(0));

        state.resize(&fixture.session, &swapchain, || 0_i32);
        assert_eq!(state.with_resources(|frames| frames.bound()), Some(3));
        state.present(&fixture.session, &swapchain, || 0);
        assert_eq!(fixture.draw_count(), draws_before + 1);
    }

    #[test]
    fn failed_rebuild_is_retried_on_present() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx11);
        let swapchain = FakeSwapchain::new(WINDOW, 2);
        state.present(&fixture.session, &swapchain, || 0);

        swapchain.fail_rebuild(true);
        state.resize(&fixture.session, &swapchain, || 0_i32);
        assert_eq!(state.with_resources(|frames| frames.bound()), Some(0));

        swapchain.fail_rebuild(false);
        let draws_before = fixture.draw_count();
        state.present(&fixture.session, &swapchain, || 0);
        assert_eq!(state.with_resources(|frames| frames.bound()), Some(2));
        assert_eq!(fixture.draw_count(), draws_before + 1);
    }

    #[test]
    fn resize_before_initialization_forwards() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::<crate::testing::FakeFrames>::new(BackendKind::Dx12);
        let swapchain = FakeSwapchain::new(WINDOW, 2);

        assert_eq!(state.resize(&fixture.session, &swapchain, || 0_i32), 0);
        assert!(swapchain.events().is_empty());
        assert!(!state.is_initialized());
    }

    #[test]
    fn resize_of_foreign_window_forwards() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::Dx11);
        state.present(&fixture.session, &FakeSwapchain::new(WINDOW, 2), || 0);

        let other = FakeSwapchain::new(OTHER_WINDOW, 4);
        assert_eq!(state.resize(&fixture.session, &other, || 0_i32), 0);
        assert!(other.events().is_empty());
        assert_eq!(state.with_resources(|frames| frames.len()), Some(2));
    }

    #[test]
    fn shutdown_allows_rebinding() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::new(BackendKind::OpenGl);
        state.present(&fixture.session, &FakeSwapchain::new(WINDOW, 1), || 0);

        state.shutdown(&fixture.session);
        fixture.session.release_window();

        assert!(!state.is_initialized());
        assert_eq!(state.with_resources(|frames| frames.len()), None);
        assert!(
            fixture
                .ui_events()
                .contains(&UiEvent::RendererShutdown(BackendKind::OpenGl))
        );

        let other = FakeSwapchain::new(OTHER_WINDOW, 1);
        state.present(&fixture.session, &other, || 0);
        assert_eq!(state.window(), Some(OTHER_WINDOW));
        assert_eq!(fixture.session.window(), Some(OTHER_WINDOW));
    }

    #[test]
    fn shutdown_before_initialization_skips_renderer() {
        let fixture = fixture(WindowHandle::NULL);
        let state = FrameState::<crate::testing::FakeFrames>::new(BackendKind::Dx9);

        state.shutdown(&fixture.session);
        assert!(
            !fixture
                .ui_events()
                .iter()
                .any(|event| matches!(event, UiEvent::RendererShutdown(_)))
        );
    }
}
