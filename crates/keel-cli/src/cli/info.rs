use clap::Parser;

use crate::error::KeelCliResult;

#[derive(Parser, Debug, Clone)]
pub struct InfoArgs {}

pub fn run(_args: InfoArgs) -> KeelCliResult {
    let sha = option_env!("VERGEN_GIT_SHA").unwrap_or("unknown");
    println!(
        "{} {} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown"),
        sha.get(..8).unwrap_or(sha)
    );
    Ok(())
}
