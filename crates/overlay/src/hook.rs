//! Native interception of graphics and window entry points.
//!
//! Trampolines carry no user data. They reach the published session through
//! [`crate::session::current`] and forward to the original function whenever
//! there is none.

mod dx11;
mod dx12;
mod dx9;
mod dxgi;
pub(crate) mod input;
mod opengl;
pub(crate) mod proc;
mod util;

use crate::backend::{BackendKind, CandidateOps};

pub(crate) fn candidate_ops(kind: BackendKind) -> &'static CandidateOps {
    match kind {
        BackendKind::Dx9 => &dx9::OPS,
        BackendKind::Dx11 => &dx11::OPS,
        BackendKind::Dx12 => &dx12::OPS,
        BackendKind::OpenGl => &opengl::OPS,
    }
}
