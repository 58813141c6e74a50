use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;

use crate::errors::ConfigError;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l} [{T}] {t} - {m}{n}";

/// Builds and installs the global `log4rs` logger, returning a handle that
/// can be used to swap the configuration later (e.g. for log-level reloads).
///
/// # Arguments
///
/// * 'log_path' - path to the log file
/// * 'log_level' - minimum level that gets written to any appender
/// * 'log_to_stdout' - when true, also attach a console appender
pub fn setup_logger(log_path: &str, log_level: LevelFilter, log_to_stdout: bool) -> Result<Handle, ConfigError> {
    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(log_path)?;

    let mut builder = LogConfig::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)));

    let mut root_appenders = vec!["file"];

    if log_to_stdout {
        let console_appender = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("stdout", Box::new(console_appender)));
        root_appenders.push("stdout");
    }

    let config = builder.build(Root::builder().appenders(root_appenders).build(log_level))?;

    let handle = log4rs::init_config(config)?;

    Ok(handle)
}
