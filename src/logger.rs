use std::fs::File;

use anyhow::Context;
use time::{
    format_description::{self, parse},
    OffsetDateTime,
};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Install the global subscriber, writing to a timestamped file when `log_to_file` is set and
/// to stdout otherwise.
///
/// # Errors
///
/// Fails when the log file cannot be created or a global subscriber is already installed.
pub fn init_logger(log_to_file: bool, level: Level) -> anyhow::Result<()> {
    let writer = if log_to_file {
        let file_name = get_log_file_name()?;
        let file = File::create(&file_name)
            .with_context(|| format!("Could not create log file {file_name}"))?;
        BoxMakeWriter::new(file)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .context("Invalid log timestamp format")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).context(
        "Could not set global default tracing subscriber. Consider disabling logs if you are already setting a subscriber.",
    )
}

fn get_log_file_name() -> anyhow::Result<String> {
    let format = parse("[year]-[month]-[day]_[hour]:[minute]:[second]_harness_log.txt")
        .context("Invalid log file name format")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&format).context("Could not format log file name")
}
