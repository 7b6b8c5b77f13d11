use clap::Parser;
use mq_dispatcher::{DispatchConfig, DispatchError, DispatchSummary, Dispatcher};
use std::process::ExitCode;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Usage errors surface before any producer exists.
fn dispatch(config: &DispatchConfig) -> Result<DispatchSummary, DispatchError> {
    let source = config.source()?;
    let broker_config = config.broker_config()?;
    let mut dispatcher = Dispatcher::new(broker_config, &config.topic, config.send_timeout());
    dispatcher.run(source)
}

fn main() -> ExitCode {
    let config = DispatchConfig::parse();

    init_logging(config.json_logs);

    event!(
        Level::INFO,
        namesrv = %config.namesrv,
        topic = %config.topic,
        message_file = ?config.file,
        inline_message = ?config.message,
        "read command content"
    );

    match dispatch(&config) {
        Ok(summary) => {
            event!(
                Level::INFO,
                summary = %serde_json::to_string(&summary).unwrap_or_default(),
                "dispatch finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            event!(Level::ERROR, error = %e, cause = ?std::error::Error::source(&e), "dispatch failed");
            ExitCode::FAILURE
        }
    }
}
