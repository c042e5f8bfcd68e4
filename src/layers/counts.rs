// SPDX-License-Identifier: BSD-3-Clause
use tracing::{Id, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use super::Tally;

/// Counts how often each phase was entered, e.g. how many call edges were
/// resolved or how many nodes were unified.
#[derive(Debug, Default)]
pub struct ExecCountLayer {
    tally: Tally,
}

impl ExecCountLayer {
    pub fn tally(&self) -> Tally {
        self.tally.clone()
    }
}

impl<S> Layer<S> for ExecCountLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            self.tally.add(span.name(), 1);
        }
    }
}
