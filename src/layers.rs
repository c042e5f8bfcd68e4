// SPDX-License-Identifier: BSD-3-Clause
//! `tracing` layers for profiling the solver phases from the command line.
//!
//! Both layers tally per span name (`build`, `solve`, `resolve`, ...) rather
//! than per span: `resolve` and `unify` are entered once per call edge or
//! merge, and a line per entry drowns the phases that matter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

mod counts;
pub use counts::ExecCountLayer;
mod nanos;
pub use nanos::NanoCountLayer;

/// Running totals per span name, shared between a layer and the report.
#[derive(Clone, Debug, Default)]
pub struct Tally(Arc<Mutex<BTreeMap<&'static str, u128>>>);

impl Tally {
    fn add(&self, name: &'static str, n: u128) {
        if let Ok(mut totals) = self.0.lock() {
            *totals.entry(name).or_default() += n;
        }
    }

    pub fn totals(&self) -> BTreeMap<&'static str, u128> {
        self.0.lock().map(|t| t.clone()).unwrap_or_default()
    }
}
