// SPDX-License-Identifier: BSD-3-Clause
use std::fmt;
use std::path::PathBuf;

use crate::analysis::pointer::Options;

#[derive(Clone, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Check {
    Default,
    None,
    Strict,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Default => write!(f, "default"),
            Check::None => write!(f, "none"),
            Check::Strict => write!(f, "strict"),
        }
    }
}

/// Points-to and alias analysis for lowered SSA programs
#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Check assertions
    #[arg(long, default_value_t = Check::Default)]
    pub check: Check,

    /// Context depth
    #[arg(long, default_value_t = 0)]
    pub contexts: u8,

    /// Debug
    #[arg(long)]
    pub debug: bool,

    /// Entry point of the program
    #[arg(long, default_value = "main")]
    pub entry: String,

    /// Maximum number of fields tracked per object before it is collapsed
    #[arg(long, default_value_t = 64)]
    pub max_fields: usize,

    /// Maximum number of abstract locations
    #[arg(long, default_value_t = 1 << 20)]
    pub max_locations: usize,

    /// Maximum number of constraint graph nodes
    #[arg(long, default_value_t = 1 << 22)]
    pub max_nodes: usize,

    /// Collect and report precision metrics
    #[arg(long)]
    pub metrics: bool,

    /// Program, as JSON
    #[arg()]
    pub module: PathBuf,

    /// Quiet
    #[arg(long)]
    pub quiet: bool,

    /// Points-to signatures
    #[arg(short, long)]
    pub signatures: Option<PathBuf>,

    /// Tracing
    #[arg(long)]
    pub tracing: bool,

    /// Unification-based analysis
    #[arg(short, long)]
    pub unification: bool,
}

impl Args {
    pub fn options(&self) -> Options {
        Options {
            check_assertions: self.check != Check::None,
            check_strict: self.check == Check::Strict,
            contexts: self.contexts,
            debug: self.debug,
            entry: self.entry.clone(),
            max_fields: self.max_fields,
            max_locations: self.max_locations,
            max_nodes: self.max_nodes,
            metrics: self.metrics,
            unification: self.unification,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults_match_options() {
        let args = Args::parse_from(["ptaflow", "prog.json"]);
        assert_eq!(Options::default(), args.options());
        assert_eq!(Check::Default, args.check);
    }

    #[test]
    fn strict() {
        let args = Args::parse_from([
            "ptaflow",
            "--check",
            "strict",
            "--contexts",
            "2",
            "-u",
            "--entry",
            "start",
            "prog.json",
        ]);
        let opts = args.options();
        assert!(opts.check_assertions && opts.check_strict && opts.unification);
        assert_eq!(2, opts.contexts);
        assert_eq!("start", opts.entry);
    }
}
