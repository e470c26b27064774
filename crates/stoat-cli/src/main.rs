use anyhow::Result;
use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::process::ExitCode;
use stoat_engine::{Engine, VmConfig};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "stoat", version, about = "Stoat scripting language")]
struct Cli {
    /// Script to run; omit for a REPL.
    script: Option<PathBuf>,

    /// Force a garbage collection at every allocation point.
    #[arg(long)]
    gc_stress: bool,

    /// Set the initial garbage-collection threshold in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    gc_threshold: usize,

    /// Disassemble each instruction to stderr as it executes.
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = VmConfig {
        gc_stress: cli.gc_stress,
        gc_threshold: cli.gc_threshold,
        trace_execution: cli.trace,
    };

    match cli.script {
        Some(path) => run_file(&path, config),
        None => match repl(config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("{error}");
                ExitCode::from(74)
            }
        },
    }
}

fn run_file(path: &std::path::Path, config: VmConfig) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read \"{}\": {error}", path.display());
            return ExitCode::from(74);
        }
    };

    let mut engine = Engine::new(config);
    match engine.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        // Diagnostics and stack traces were already written to stderr.
        Err(error) => ExitCode::from(error.exit_code() as u8),
    }
}

/// Interactive session. One engine lives for the whole session, so
/// globals, functions, and classes persist across lines.
fn repl(config: VmConfig) -> Result<()> {
    let mut engine = Engine::new(config);
    let mut editor = DefaultEditor::new()?;

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_history_entry(&line)?;
                // Errors were already reported; the session continues.
                let _ = engine.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(()),
            Err(error) => return Err(error.into()),
        }
    }
}
