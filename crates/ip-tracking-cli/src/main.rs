//! ip-tracking CLI binary entrypoint.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ip_tracking_cli::cli::{Cli, Commands};
use ip_tracking_cli::commands::{DenyCommand, InspectCommand, ScanCommand};
use ip_tracking_cli::output::OutputFormat;
use ip_tracking_cli::{CliError, load_config, open_store};

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let format = OutputFormat::new(cli.format);
    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(open_store(&cli.data_dir)?);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Block { address } => {
            let cmd = DenyCommand::new(store);
            cmd.block(&mut stdout, &format, address).await?;
        }
        Commands::Unblock { address } => {
            let cmd = DenyCommand::new(store);
            cmd.unblock(&mut stdout, &format, address).await?;
        }
        Commands::Blocked => {
            let cmd = DenyCommand::new(store);
            cmd.list(&mut stdout, &format).await?;
        }
        Commands::Scan => {
            let cmd = ScanCommand::new(store.clone(), store, config.scanner);
            cmd.execute(&mut stdout, &format).await?;
        }
        Commands::Watch { period_secs } => {
            let cmd = ScanCommand::new(store.clone(), store, config.scanner);
            cmd.watch(&mut stdout, &format, period_secs.map(Duration::from_secs))
                .await?;
        }
        Commands::Flags { address } => {
            let cmd = InspectCommand::new(store.clone(), store);
            cmd.flags(&mut stdout, &format, address).await?;
        }
        Commands::Requests(args) => {
            let cmd = InspectCommand::new(store.clone(), store);
            cmd.requests(&mut stdout, &format, &args).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(dir: &TempDir, args: &[&str]) -> Cli {
        let data_dir = dir.path().to_string_lossy().into_owned();
        let mut argv = vec!["ip-tracking", "--data-dir", data_dir.as_str()];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[tokio::test]
    async fn run_block_then_blocked() {
        let dir = TempDir::new().expect("temp dir");

        run(cli(&dir, &["block", "203.0.113.1"])).await.expect("block");
        run(cli(&dir, &["--format", "json", "blocked"])).await.expect("blocked");

        let store = open_store(dir.path()).expect("open");
        let listed = ip_tracking::admin::blocked(&store).await.expect("readable");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn run_scan_on_empty_store() {
        let dir = TempDir::new().expect("temp dir");
        assert!(run(cli(&dir, &["scan"])).await.is_ok());
    }

    #[tokio::test]
    async fn run_with_missing_config_fails() {
        let dir = TempDir::new().expect("temp dir");
        let result = run(cli(&dir, &["--config", "/nonexistent/tracking.json", "blocked"])).await;
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
