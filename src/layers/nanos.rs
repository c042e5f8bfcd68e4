// SPDX-License-Identifier: BSD-3-Clause
use std::time::Instant;

use tracing::{Id, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use super::Tally;

/// Nanoseconds spent inside each phase, summed over every entry. Time in
/// nested spans counts towards their parents too.
#[derive(Debug, Default)]
pub struct NanoCountLayer {
    tally: Tally,
}

impl NanoCountLayer {
    pub fn tally(&self) -> Tally {
        self.tally.clone()
    }
}

impl<S> Layer<S> for NanoCountLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().replace(Instant::now());
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(start) = span.extensions_mut().remove::<Instant>() {
                self.tally.add(span.name(), start.elapsed().as_nanos());
            }
        }
    }
}
