use std::fs::File;
use std::io::BufWriter;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use bake::cli::{self, CliArgs};
use bake::config::{self, Config};
use bake::log::{JsonLinesSink, MultiSink, TracingSink};
use bake::project::Project;
use bake::script::Engine;

fn main() {
    let args = cli::parse_args();
    init_tracing(&args);

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("bake: {e:#}");
            std::process::exit(2);
        }
    }
}

fn init_tracing(args: &CliArgs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    let ansi = unsafe { libc::isatty(libc::STDERR_FILENO) != 0 };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .init();
}

fn run(args: CliArgs) -> Result<i32> {
    // ── Config ────────────────────────────────────────────────────────────────
    let config_path = args.config.clone().or_else(config::default_path);
    let mut config = match &config_path {
        Some(path) => {
            let (cfg, errors) =
                Config::load_file(path).with_context(|| format!("cannot read config {}", path.display()))?;
            for e in &errors {
                tracing::warn!(path = %path.display(), "config: {e}");
            }
            tracing::debug!(path = %path.display(), "config loaded");
            cfg
        }
        None => Config::new(),
    };

    if let Some(section) = &args.section {
        config.engine.entry_section = section.clone();
    }
    if args.stop_on_error {
        config.engine.stop_build_on_error = true;
    }
    if args.no_optimize {
        config.engine.optimize = false;
    }

    // ── Scripts ───────────────────────────────────────────────────────────────
    let mut project = Project::new();
    for path in &args.scripts {
        project.load(path).with_context(|| format!("cannot load script {}", path.display()))?;
    }

    // ── Engine ────────────────────────────────────────────────────────────────
    let mut fixed = config.fixed_vars();
    for (k, v) in &args.defines {
        fixed.set(k.as_str(), v.as_str());
    }
    for (k, v) in fixed.sorted() {
        tracing::debug!(name = k, value = v, "fixed variable");
    }

    let mut sink = MultiSink::new();
    sink.push(Box::new(TracingSink));
    if let Some(path) = &args.log_json {
        let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        sink.push(Box::new(JsonLinesSink::new(BufWriter::new(file))));
    }

    let mut engine = Engine::new(project, config.engine.clone()).with_fixed(fixed).with_sink(Box::new(sink));
    for (name, command) in &config.macros {
        engine.define_macro(name, command);
    }

    let report = engine.run();
    for line in &engine.output {
        println!("{line}");
    }

    let code = report.exit_code();
    if code == 0 {
        tracing::info!(status = ?report.status, worst = ?report.worst, scripts = report.scripts_run, "build finished");
    } else {
        tracing::error!(status = ?report.status, worst = ?report.worst, scripts = report.scripts_run, code, "build finished");
    }
    Ok(code)
}
