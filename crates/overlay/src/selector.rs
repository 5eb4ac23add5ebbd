//! Waits for a graphics runtime to show up in the process.

use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::{backend::BackendKind, config::SelectorOptions, error::OverlayError};

/// Something that can report whether its graphics runtime is loaded.
pub trait SupportProbe {
    fn kind(&self) -> BackendKind;

    fn is_supported(&self) -> bool;
}

/// Poll `candidates` until at least one is supported.
///
/// Returns every candidate supported at the first successful poll, in input order.
/// Fails with [`OverlayError::NoSupportedBackend`] once the timeout elapses.
#[tracing::instrument(skip_all)]
pub async fn select_supported<C: SupportProbe>(
    candidates: Vec<C>,
    options: &SelectorOptions,
) -> Result<Vec<C>, OverlayError> {
    let started = Instant::now();
    loop {
        let supported = candidates
            .iter()
            .map(SupportProbe::is_supported)
            .collect::<Vec<_>>();

        if supported.contains(&true) {
            let selected = candidates
                .into_iter()
                .zip(supported)
                .filter_map(|(candidate, supported)| supported.then_some(candidate))
                .collect::<Vec<_>>();

            debug!(
                "selected backends: {:?}",
                selected.iter().map(SupportProbe::kind).collect::<Vec<_>>()
            );
            return Ok(selected);
        }

        let waited = started.elapsed();
        if waited >= options.timeout() {
            debug!("no supported backend after {:?}", waited);
            return Err(OverlayError::NoSupportedBackend { waited });
        }

        trace!("no supported backend yet");
        sleep(options.poll_interval()).await;
    }
}
