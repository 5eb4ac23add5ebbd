use core::time::Duration;
use std::error::Error;

use thiserror::Error;

use crate::backend::BackendKind;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("no supported graphics backend found after {waited:?}")]
    NoSupportedBackend { waited: Duration },

    #[error("failed to read {kind} dispatch table")]
    Bootstrap {
        kind: BackendKind,
        #[source]
        source: BoxError,
    },

    #[error("failed to install {kind} hooks")]
    HookInstallation {
        kind: BackendKind,
        #[source]
        source: BoxError,
    },

    #[error("failed to toggle {kind} hooks")]
    HookToggle {
        kind: BackendKind,
        #[source]
        source: BoxError,
    },

    #[error("failed to create {kind} device resources")]
    DeviceResourceCreation {
        kind: BackendKind,
        #[source]
        source: BoxError,
    },

    #[error("original call failed with {0:#010x}")]
    OriginalCallFailure(i32),

    #[error("another overlay session is already active")]
    AlreadyActive,

    #[error("failed to create overlay drawing context")]
    Context(#[source] BoxError),
}

impl OverlayError {
    /// Wraps an initialization failure, keeping bootstrap failures distinguishable.
    pub(crate) fn from_initialize(kind: BackendKind, err: anyhow::Error) -> Self {
        match err.downcast::<BootstrapFailed>() {
            Ok(BootstrapFailed(source)) => OverlayError::Bootstrap {
                kind,
                source: source.into(),
            },
            Err(source) => OverlayError::HookInstallation {
                kind,
                source: source.into(),
            },
        }
    }
}

/// Marks a failure to create the throwaway device used to read a dispatch table.
#[derive(Debug, Error)]
#[error("dispatch table bootstrap failed")]
pub(crate) struct BootstrapFailed(#[source] pub anyhow::Error);
