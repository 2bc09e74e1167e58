use clap::Parser;
use keel_common::settings::Settings;
use keel_server::Server;
use tokio_util::sync::CancellationToken;

use crate::error::KeelCliResult;

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Overrides the configured listen port.
    #[arg(short, long)]
    pub port: Option<u16>,
}

pub async fn run(args: ServerArgs, config: &Settings, token: CancellationToken) -> KeelCliResult {
    let mut settings = config.clone();
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    Server::new(settings).run(token).await?;
    Ok(())
}
