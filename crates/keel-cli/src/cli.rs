use std::path::PathBuf;

use clap::Parser;
use keel_common::{metadata::LevelFilter, util::tracing::setup_tracing};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{error::KeelCliResult, init::init_config};

mod info;
mod piped;
mod server;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    #[clap(short('l'), long, value_name("LEVEL"), default_value("info"))]
    pub log_level: LevelFilter,

    /// Control-plane settings file.
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Parser, Clone)]
pub enum Command {
    #[command(about = "Show build information")]
    Info(info::InfoArgs),
    #[command(about = "Run the piped agent")]
    Piped(Box<piped::PipedArgs>),
    #[command(about = "Run the control-plane piped API", alias = "s")]
    Server(server::ServerArgs),
}

pub async fn exec() -> KeelCliResult {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    setup_tracing(Some(cli.log_level));

    match cli.cmd.clone() {
        Command::Info(args) => info::run(args),
        Command::Piped(args) => piped::run(*args, shutdown_token()).await,
        Command::Server(args) => {
            let cfg = init_config(&cli)?;
            server::run(args, cfg, shutdown_token()).await
        }
    }
}

/// A token cancelled on ctrl-c.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt, shutting down"),
            Err(e) => warn!("unable to listen for interrupt: {}", e),
        }
        t.cancel();
    });
    token
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_the_piped_command() {
        let cli = Cli::try_parse_from([
            "keel",
            "-l",
            "debug",
            "piped",
            "--config-file",
            "piped.yaml",
            "--insecure",
        ])
        .unwrap();
        assert_eq!(cli.log_level, LevelFilter::DEBUG);
        let Command::Piped(args) = cli.cmd else {
            panic!("expected the piped command");
        };
        assert!(args.insecure);
        assert_eq!(args.source.config_file, Some(PathBuf::from("piped.yaml")));
    }

    #[test]
    fn config_sources_are_mutually_exclusive() {
        let err = Cli::try_parse_from([
            "keel",
            "piped",
            "--config-file",
            "piped.yaml",
            "--config-data",
            "YWJj",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);

    }
}
