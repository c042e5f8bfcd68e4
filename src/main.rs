// SPDX-License-Identifier: BSD-3-Clause
use std::io::{self, Write};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use tracing_flame::FlameLayer;
use tracing_subscriber::{fmt, prelude::*};

use ptaflow::analysis::query;
use ptaflow::cli::{Args, Check};
use ptaflow::ir::Module;
use ptaflow::{layers, pointer, Signatures};

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn setup_global_subscriber() -> Result<(impl Drop, layers::Tally)> {
    let filter_layer = tracing::level_filters::LevelFilter::TRACE;
    let fmt_layer = fmt::Layer::default();
    let (flame_layer, guard) =
        FlameLayer::with_file("./tracing.folded").context("Couldn't create ./tracing.folded")?;
    #[cfg(not(feature = "count"))]
    let count_layer = layers::NanoCountLayer::default();
    #[cfg(feature = "count")]
    let count_layer = layers::ExecCountLayer::default();
    let tally = count_layer.tally();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(flame_layer)
        .with(count_layer)
        .init();
    Ok((guard, tally))
}

fn section(out: &mut impl Write, title: &str) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", title)?;
    writeln!(out, "{}", "-".repeat(title.len()))
}

fn main() -> Result<()> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let args = Args::parse();

    let profiling = if args.tracing {
        Some(setup_global_subscriber()?)
    } else {
        None
    };

    let signatures = if let Some(signatures_path) = &args.signatures {
        let signatures_string = std::fs::read_to_string(signatures_path)
            .context("Couldn't read points-to signatures")?;
        Signatures::from_json(&signatures_string)
            .context("Couldn't construct points-to signatures")?
    } else {
        Signatures::default()
    };

    let module_string = std::fs::read_to_string(&args.module)
        .with_context(|| format!("Couldn't read program at {}", args.module.display()))?;
    let module = Module::from_json(&module_string).with_context(|| {
        format!("Malformed program at {}", args.module.display())
    })?;

    let opts = args.options();
    let outs = pointer::analysis(&module, &signatures, &opts).context("Analysis failed")?;
    let (directives, unknown) = query::check_directives(&module, &outs);
    let locs = outs.locations();

    if !args.quiet {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "reachable")?;
        writeln!(stdout, "---------")?;
        for f in &outs.reachable {
            writeln!(stdout, "{}", f)?;
        }
        section(&mut stdout, "operand_points_to")?;
        for (ctx, f, l, loc) in outs.operand_points_to() {
            writeln!(stdout, "{}: {}:{} --> {}", ctx, f, l, locs.name(loc))?;
        }
        section(&mut stdout, "alloc_points_to")?;
        for (loc, pointee) in outs.alloc_points_to() {
            writeln!(stdout, "{} --> {}", locs.name(loc), locs.name(pointee))?;
        }
        section(&mut stdout, "needs_signature")?;
        for f in &outs.needs_signature {
            writeln!(stdout, "{}", f)?;
        }
        section(&mut stdout, "directives")?;
        for d in &directives {
            let verdict = if d.holds { "ok" } else { "FAILED" };
            write!(stdout, "{}: {:?} {}", d.site, d.kind, verdict)?;
            for a in &d.args {
                let pts = outs.points_to(&d.site.function, a);
                let ids = pts.iter().map(|l| format!("L{}", l)).collect::<Vec<_>>();
                write!(stdout, " {}={{{}}}", a, ids.join(", "))?;
            }
            writeln!(stdout)?;
        }
        section(&mut stdout, "diagnostics")?;
        for d in outs.diagnostics.iter().chain(&unknown) {
            writeln!(stdout, "{}", d)?;
        }
    }

    if args.metrics {
        let mut stdout = io::stdout().lock();
        if let Some(m) = &outs.metrics {
            section(&mut stdout, "metrics")?;
            writeln!(stdout, "callgraph size: {}", m.callgraph_size)?;
            writeln!(stdout, "free of non-heap allocation: {}", m.free_non_heap)?;
            writeln!(stdout, "invalid calls: {}", m.invalid_calls)?;
            writeln!(stdout, "invalid loads: {}", m.invalid_loads)?;
            writeln!(stdout, "invalid memcpy dsts: {}", m.invalid_memcpy_dsts)?;
            writeln!(stdout, "invalid memcpy srcs: {}", m.invalid_memcpy_srcs)?;
            writeln!(stdout, "invalid stores: {}", m.invalid_stores)?;
            writeln!(stdout, "points-to top: {}", m.points_to_top)?;
        }
    }

    if let Some((_, tally)) = &profiling {
        let mut stderr = io::stderr().lock();
        section(&mut stderr, "phases")?;
        for (name, n) in tally.totals() {
            writeln!(stderr, "{}: {}", name, n)?;
        }
    }

    if args.check != Check::None {
        let failed = directives.iter().filter(|d| !d.holds).count();
        if failed > 0 {
            return Err(anyhow!("{} assertion(s) failed!", failed));
        }
    }

    if let Check::Strict = args.check {
        if !outs.needs_signature.is_empty() {
            return Err(anyhow!("Found functions that need signatures!"));
        }
        if outs.strict_violations().next().is_some() {
            return Err(anyhow!("Found pointers that point to nothing!"));
        }
    }

    Ok(())
}
