mod cli;
mod commands;
mod config;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fhirpull_engine::{EngineError, ModeArg};

use cli::{Cli, Commands};
use output::print_error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            print_error(&e.to_string());
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> fhirpull_engine::Result<i32> {
    match &cli.command {
        Commands::Export(args) => commands::export::run(cli, args, None).await,
        Commands::Bulk(args) => commands::export::run(cli, args, Some(ModeArg::Bulk)).await,
        Commands::Crawl(args) => commands::export::run(cli, args, Some(ModeArg::Crawl)).await,
        Commands::Hydrate(args) => commands::hydrate::run(cli, args).await,
        Commands::Single(args) => commands::single::run(cli, args).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// 0 = done or clean resume point; 1 = configuration error;
/// 2 = cancelled; 3 = unrecoverable server error.
fn exit_code(error: &EngineError) -> i32 {
    match error {
        EngineError::Cancelled => 2,
        EngineError::Client(_) | EngineError::BulkFailed(_) => 3,
        EngineError::Config(_) | EngineError::Store(_) | EngineError::Core(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&EngineError::Cancelled), 2);
        assert_eq!(exit_code(&EngineError::config("bad flag")), 1);
        assert_eq!(exit_code(&EngineError::bulk_failed("expired")), 3);
    }
}
