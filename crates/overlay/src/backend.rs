//! Graphics backend candidates.
//!
//! Each candidate owns the interception of one graphics API. Its per call behavior lives
//! in [`state::FrameState`], the native glue lives in the platform `hook` module.

pub(crate) mod frames;
pub(crate) mod state;

use core::fmt::{self, Debug, Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::OverlayOptions, error::OverlayError, selector::SupportProbe, session::SessionCore,
};

/// Graphics API a candidate intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Dx9,
    Dx11,
    Dx12,
    OpenGl,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Dx9,
        BackendKind::Dx11,
        BackendKind::Dx12,
        BackendKind::OpenGl,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            BackendKind::Dx9 => "Direct3D 9",
            BackendKind::Dx11 => "Direct3D 11",
            BackendKind::Dx12 => "Direct3D 12",
            BackendKind::OpenGl => "OpenGL",
        }
    }

    /// Runtime modules whose presence in the process marks the backend as in use.
    pub const fn runtime_modules(self) -> &'static [&'static str] {
        match self {
            BackendKind::Dx9 => &["d3d9.dll"],
            BackendKind::Dx11 => &[
                "d3d11.dll",
                "d3d11_1.dll",
                "d3d11_2.dll",
                "d3d11_3.dll",
                "d3d11_4.dll",
            ],
            BackendKind::Dx12 => &["d3d12.dll"],
            BackendKind::OpenGl => &["opengl32.dll"],
        }
    }

    /// Files next to the executable that also mark the backend as in use.
    ///
    /// Agility SDK games ship their own Direct3D 12 core runtime, which may not be loaded yet.
    pub const fn companion_files(self) -> &'static [&'static str] {
        match self {
            BackendKind::Dx12 => &["D3D12/D3D12Core.dll"],
            _ => &[],
        }
    }

    pub(crate) fn probe(
        self,
        module_loaded: impl Fn(&str) -> bool,
        file_exists: impl Fn(&Path) -> bool,
    ) -> bool {
        self.runtime_modules()
            .iter()
            .any(|module| module_loaded(module))
            || self
                .companion_files()
                .iter()
                .any(|file| file_exists(Path::new(file)))
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Native operations of a candidate.
pub(crate) struct CandidateOps {
    pub is_supported: fn() -> bool,

    /// Read the dispatch table, install the hooks and activate them.
    pub initialize: fn(&OverlayOptions) -> anyhow::Result<()>,

    /// Toggle hook activation. Resources are left untouched.
    pub set_enabled: fn(bool) -> anyhow::Result<()>,

    /// Deactivate every hook, including the ones tracking device lifetime while disabled.
    pub deactivate: fn() -> anyhow::Result<()>,

    /// Release device resources and renderer backend objects.
    pub shutdown: fn(&SessionCore),
}

/// A graphics backend that can be intercepted.
#[derive(Clone, Copy)]
pub struct BackendCandidate {
    kind: BackendKind,
    ops: &'static CandidateOps,
}

impl BackendCandidate {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            ops: platform_ops(kind),
        }
    }

    pub(crate) const fn with_ops(kind: BackendKind, ops: &'static CandidateOps) -> Self {
        Self { kind, ops }
    }

    #[inline]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Whether the backend runtime is loaded. No side effects.
    pub fn is_supported(&self) -> bool {
        (self.ops.is_supported)()
    }

    #[tracing::instrument(skip(options))]
    pub(crate) fn initialize(&self, options: &OverlayOptions) -> Result<(), OverlayError> {
        (self.ops.initialize)(options)
            .map_err(|err| OverlayError::from_initialize(self.kind, err))?;
        debug!("{} hooks installed", self.kind);

        Ok(())
    }

    pub(crate) fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        (self.ops.set_enabled)(enabled)
    }

    pub(crate) fn deactivate(&self) -> anyhow::Result<()> {
        (self.ops.deactivate)()
    }

    pub(crate) fn shutdown(&self, session: &SessionCore) {
        (self.ops.shutdown)(session);
    }
}

impl Debug for BackendCandidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackendCandidate").field(&self.kind).finish()
    }
}

impl SupportProbe for BackendCandidate {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_supported(&self) -> bool {
        BackendCandidate::is_supported(self)
    }
}

#[cfg(windows)]
fn platform_ops(kind: BackendKind) -> &'static CandidateOps {
    crate::hook::candidate_ops(kind)
}

#[cfg(not(windows))]
fn platform_ops(_: BackendKind) -> &'static CandidateOps {
    static UNSUPPORTED: CandidateOps = CandidateOps {
        is_supported: || false,
        initialize: |_| anyhow::bail!("graphics interception is only available on Windows"),
        set_enabled: |_| Ok(()),
        deactivate: || Ok(()),
        shutdown: |_| {},
    };

    &UNSUPPORTED
}
