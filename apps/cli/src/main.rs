use anyhow::Context;
use clap::Parser;
use lumen_cli::args::Cli;
use lumen_cli::commands;
use lumen_cli::settings::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings =
        load_settings(cli.config.as_deref()).context("Critical: Configuration is malformed")?;
    let _log = settings.log.install(env!("CARGO_BIN_NAME"), cli.verbose)?;

    commands::run(cli.command, settings.storage).await
}
