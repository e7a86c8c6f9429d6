mod config;

use std::{
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use common::env::config_tool;
use restore::{
    run_restore,
    MySqlConnectionFactory,
    RestoreSummary,
};

use crate::config::Config;

fn main() -> ExitCode {
    config_tool();
    let config = Config::parse();
    tracing::info!("starting with {config:?}");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("cannot build runtime: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    match runtime.block_on(run(config)) {
        Ok(summary) if summary.success() => ExitCode::SUCCESS,
        Ok(summary) => {
            if let Some(error) = &summary.first_error {
                tracing::error!(
                    fatal_errors = summary.fatal_errors,
                    "restore completed with errors; first: {error}",
                );
            }
            ExitCode::FAILURE
        },
        Err(e) => {
            tracing::error!("restore failed: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run(config: Config) -> anyhow::Result<RestoreSummary> {
    let factory = Arc::new(MySqlConnectionFactory::new(&config.url)?);
    run_restore(config.restore_options(), factory).await
}
