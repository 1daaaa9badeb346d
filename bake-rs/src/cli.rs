//! Command-line argument parsing.
//!
//! Usage:
//!   bake [-c <FILE>] [-s <NAME>] [-D KEY=VALUE]... [--stop-on-error]
//!        [--no-optimize] [--log-json <FILE>] [-v...|-q] <SCRIPT>...

use std::path::PathBuf;

use clap::{ArgAction, Parser};

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "bake", version)]
#[command(about = "Run line-oriented build scripts", long_about = None)]
pub struct CliArgs {
    /// Scripts to run, in order
    #[arg(required = true, value_name = "SCRIPT")]
    pub scripts: Vec<PathBuf>,

    /// Config file (overrides the default search)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Entry section of each script (default: Process)
    #[arg(short = 's', long = "section", value_name = "NAME")]
    pub section: Option<String>,

    /// Define a read-only variable
    #[arg(short = 'D', value_name = "KEY=VALUE", value_parser = parse_define, action = ArgAction::Append)]
    pub defines: Vec<(String, String)>,

    /// Halt the run on the first unsuppressed error
    #[arg(long)]
    pub stop_on_error: bool,

    /// Do not fuse adjacent commands into batches
    #[arg(long)]
    pub no_optimize: bool,

    /// Also write the build log as JSON lines to FILE
    #[arg(long, value_name = "FILE")]
    pub log_json: Option<PathBuf>,

    /// More logging (repeat for more)
    #[arg(short = 'v', action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only log errors
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Default `tracing` filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            (false, 2) => "debug",
            _ => "trace",
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn parse_define(s: &str) -> Result<(String, String), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    let k = k.trim().trim_matches('%');
    if !crate::script::variables::is_var_name(k) {
        return Err(format!("invalid variable name {k:?}"));
    }
    Ok((k.to_owned(), v.to_owned()))
}

/// Parse `std::env::args()`; exits with usage on error.
pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}

/// Parse a slice of argument strings, without the program name (exposed
/// for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, clap::Error> {
    CliArgs::try_parse_from(std::iter::once("bake").chain(argv.iter().map(String::as_str)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
