//! In-process overlay for Direct3D 9, 11, 12 and OpenGL applications.
//!
//! An [`Overlay`] finds the graphics runtime the host process uses, intercepts its frame
//! submission entry points and draws an immediate mode UI, provided through [`OverlayUi`],
//! on top of every frame of the host's window.

pub mod backend;
pub mod config;
pub mod error;
pub mod input;
pub mod logging;
pub mod selector;
pub mod session;
pub mod types;
pub mod ui;

mod guard;
#[cfg(windows)]
mod hook;
mod wndproc;

#[cfg(test)]
mod testing;

pub use backend::{BackendCandidate, BackendKind};
pub use config::{OverlayOptions, QueueAcquisition, SelectorOptions};
pub use error::OverlayError;
pub use guard::GuardScope;
pub use input::{BlockInputFlags, InputBlocker};
pub use logging::init_logging;
pub use selector::{SupportProbe, select_supported};
pub use session::Overlay;
pub use types::WindowHandle;
pub use ui::{DrawTarget, OverlayUi, RendererInit, WindowMessage};
