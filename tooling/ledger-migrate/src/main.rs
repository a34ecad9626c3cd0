mod cli;

use crate::cli::{CLI, emit_error_report};
use clap::Parser;
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

fn init_tracing(log_level: Level) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(log_level))
        .from_env_lossy();

    let include_target = matches!(log_level, Level::DEBUG | Level::TRACE);
    // Reports own stdout.
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(include_target)
        .with_filter(log_filter);

    tracing_subscriber::registry().with(fmt_layer).init();
}

#[tokio::main]
async fn main() {
    let started_at = Instant::now();
    let CLI { log_level, command } = CLI::parse();
    init_tracing(log_level);

    if let Err(error) = command.run().await {
        emit_error_report(
            command.json_output(),
            command.retry_attempts(),
            started_at,
            &error,
            command.report_file(),
        );
        std::process::exit(1);
    }
}
