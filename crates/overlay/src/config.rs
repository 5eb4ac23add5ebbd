//! Overlay session configuration.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{backend::BackendKind, guard::GuardScope};

/// Options applied when an overlay session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayOptions {
    /// Enable multi-viewport support of the overlay library.
    pub enable_viewports: bool,

    /// Swallow focus loss and application deactivation messages so the host keeps rendering.
    /// Can be changed while the session is running.
    pub suppress_deactivation: bool,

    /// Force these backends instead of probing for loaded runtimes.
    pub candidates: Option<Vec<BackendKind>>,

    /// Address of the window procedure to intercept instead of the window's current one.
    pub custom_window_procedure: Option<usize>,

    /// Scope of the per entry point reentrancy guards.
    pub guard_scope: GuardScope,

    /// How the Direct3D 12 backend finds the command queue to submit on.
    pub dx12_queue: QueueAcquisition,

    pub selector: SelectorOptions,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            enable_viewports: false,
            suppress_deactivation: false,
            candidates: None,
            custom_window_procedure: None,
            guard_scope: GuardScope::default(),
            dx12_queue: QueueAcquisition::default(),
            selector: SelectorOptions::default(),
        }
    }
}

impl OverlayOptions {
    pub fn with_viewports(mut self, enable: bool) -> Self {
        self.enable_viewports = enable;
        self
    }

    pub fn with_candidates(mut self, candidates: impl IntoIterator<Item = BackendKind>) -> Self {
        self.candidates = Some(candidates.into_iter().collect());
        self
    }

    pub fn with_window_procedure(mut self, address: usize) -> Self {
        self.custom_window_procedure = Some(address);
        self
    }
}

/// Polling parameters of the backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorOptions {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl SelectorOptions {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 64;
    pub const DEFAULT_TIMEOUT_MS: u64 = 20000;

    #[inline]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Command queue acquisition strategy for Direct3D 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAcquisition {
    /// Capture the direct queue the host last submitted command lists on.
    ///
    /// Submitting on a captured queue that is not the one the swapchain was created on
    /// fails device validation in some games.
    SubmissionCapture,

    /// Read the queue pointer at a fixed offset inside the swapchain object.
    /// The offset is measured on a throwaway swapchain and depends on the runtime build.
    #[default]
    SwapchainOffset,
}
