use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use simplelog::{Config, LevelFilter, WriteLogger};
use std::fs::File;
use std::path::PathBuf;

use tco_render::{render_bank, RenderOutcome, RenderRequest, RenderSession, DEFAULT_WORKER_COUNT};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[value(rename_all = "lower")]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, arg_required_else_help = true)]
struct Args {
    /// Path to a render request JSON file (bank, combination, organ data)
    #[arg(value_name = "REQUEST_FILE")]
    request_file: PathBuf,

    /// Number of parallel render workers
    #[arg(long, value_name = "N", default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Set the application log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Path of the log file
    #[arg(long, value_name = "LOG_FILE", default_value = "tco-render.log")]
    log_file: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    };
    WriteLogger::init(log_level, Config::default(), File::create(&args.log_file)?)?;

    let json = std::fs::read_to_string(&args.request_file)
        .with_context(|| format!("Failed to read {:?}", args.request_file))?;
    let request: RenderRequest = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse {:?}", args.request_file))?;

    log::info!(
        "[Main] Rendering bank {} ('{}') with {} workers",
        request.bank_number,
        request.bank_name,
        args.workers
    );

    let mut session = RenderSession::new();
    session.set_progress_callback(|percent| println!("PROGRESS {}", percent));

    match render_bank(&request, &mut session, args.workers) {
        RenderOutcome::Success { output_dir } => {
            log::info!("[Main] Bank {} rendered to {:?}", request.bank_number, output_dir);
            println!("DONE {}", output_dir.display());
            Ok(())
        }
        RenderOutcome::Cancelled { output_dir } => {
            log::info!("[Main] Render cancelled, partial output in {:?}", output_dir);
            println!("CANCELLED");
            Ok(())
        }
        RenderOutcome::Error { message } => {
            log::error!("[Main] Render failed: {}", message);
            Err(anyhow::anyhow!(message))
        }
    }
}
