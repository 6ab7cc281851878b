use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use loopgen::pipeline::{compute_provenance, generate, GenRequest};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Dispatch and usage functions in one file
    C,
    Dispatch,
    Usage,
    /// Provenance hashes as JSON
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "loopgen",
    version,
    about = "Generates loop-aware C for sparse Jacobian and Hessian evaluation"
)]
struct Cli {
    /// Generation request (JSON)
    request: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::C)]
    emit: EmitStage,

    /// Log pass summaries to stderr
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "loopgen=debug" } else { "loopgen=warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    // ── Read request ──
    let text = match std::fs::read_to_string(&cli.request) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("loopgen: error: {}: {}", cli.request.display(), e);
            std::process::exit(2);
        }
    };

    let request = match GenRequest::from_json(&text) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("loopgen: error[{}]: {}", e.code(), e);
            std::process::exit(1);
        }
    };

    // ── Generate ──
    let source = match generate(&request) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("loopgen: error[{}]: {}", e.code(), e);
            std::process::exit(1);
        }
    };

    let output = match cli.emit {
        EmitStage::C => source.to_c(),
        EmitStage::Dispatch => source.dispatch,
        EmitStage::Usage => source.usage,
        EmitStage::BuildInfo => match compute_provenance(&request, &source).and_then(|p| p.to_json()) {
            Ok(json) => json,
            Err(e) => {
                eprintln!("loopgen: error[{}]: {}", e.code(), e);
                std::process::exit(1);
            }
        },
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, output) {
                eprintln!("loopgen: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", output),
    }
}
