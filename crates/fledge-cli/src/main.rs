//! Fledge CLI - run a command under the fledge process library.
//!
//! Spawns the given program with piped standard streams, accumulates both
//! outputs while the child runs, then prints a termination summary and
//! propagates the child's exit code.

use anyhow::{Context, Result};
use clap::Parser;
use fledge::{ExitReason, Process, StartParams, Status};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "fledge-cli")]
#[command(about = "Run a command with piped output via the fledge library")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Working directory for the child process
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// KEY=VALUE environment entry; may be repeated. Providing any entry
    /// replaces the inherited environment.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Kill the child if this process dies before joining it
    #[arg(long)]
    die_with_parent: bool,

    /// Program path followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut params = StartParams::from_argv(args.command);
    for entry in args.env {
        params = params.env_entry(entry);
    }
    if let Some(dir) = args.workdir {
        params = params.workdir(dir);
    }
    params = params.die_with_parent(args.die_with_parent);

    let stdout = Arc::new(Mutex::new(Vec::new()));
    let stderr = Arc::new(Mutex::new(Vec::new()));

    let mut process = Process::new();
    let sink = stdout.clone();
    process.on_stdout(move |chunk| sink.lock().unwrap().extend_from_slice(chunk));
    let sink = stderr.clone();
    process.on_stderr(move |chunk| sink.lock().unwrap().extend_from_slice(chunk));

    let program = params.argv[0].clone();
    process
        .start(params)
        .with_context(|| format!("failed to start '{program}'"))?;
    debug!("Started {} with PID {:?}", program, process.pid());

    while process.status() == Status::Running {
        process.collect_outputs().context("collecting output")?;
    }
    let result = process.join(false).context("joining child process")?;

    println!("result:");
    println!("  reason={:?}", result.reason);
    println!("  code={}", result.code);
    println!("  stdout={}", String::from_utf8_lossy(&stdout.lock().unwrap()));
    println!("  stderr={}", String::from_utf8_lossy(&stderr.lock().unwrap()));

    if result.reason == ExitReason::Exit {
        std::process::exit(result.code);
    }
    // Killed by a signal: report failure without masking it as success.
    std::process::exit(1);
}
