//! illama-server - llama.cpp completion server
//!
//! Serves completion, embedding and tokenizer requests as JSON lines over
//! stdin/stdout.

use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use illama_server::server::serve_lines;
use illama_server::{run_server, Launch};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    let directive = if verbose {
        "illama_server=debug"
    } else {
        "illama_server=info"
    };

    // Logs go to stderr; stdout carries responses
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
                .add_directive(directive.parse().unwrap_or_else(|_| LevelFilter::INFO.into())),
        )
        .init();

    info!("Starting illama-server v{}", env!("CARGO_PKG_VERSION"));

    match run_server(args) {
        Launch::Exit(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Launch::Session(session) => {
            // Embedded from the command line has no host; serve stdin instead
            let stdin = std::io::stdin().lock();
            match serve_lines(&session, stdin, std::io::stdout().lock()) {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            }
        }
    }
}
