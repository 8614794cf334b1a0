//! Logging setup: `tracing-subscriber` with an `EnvFilter` built
//! from `RUST_LOG`/`--log-level`, text/json/pretty formats, falling back
//! to syslog when `general.syslog_prog_name` is set.

use std::process;

use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};
use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};
use super::config::{Config, VERSION};

pub fn init_logging(args: &Args, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    init(args, config.general.syslog_prog_name.clone());
    tracing::info!("starting up (version {VERSION})");
    Ok(())
}

fn init(args: &Args, syslog_name: Option<String>) {
    if let Some(syslog_name) = syslog_name {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: syslog_name,
            pid: process::id(),
        };
        let syslog_logger = syslog::unix(formatter).expect("connect to syslog");
        // max level in syslog mode is INFO: DEBUG-level tracing of every
        // dispatcher request would be too costly over syslog.
        log::set_boxed_logger(Box::new(BasicLogger::new(syslog_logger)))
            .map(|()| log::set_max_level(LevelFilter::Info))
            .expect("install syslog logger");
    } else {
        let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(!args.no_color);

        match args.log_format {
            LogFormat::Structured => subscriber.json().init(),
            LogFormat::Debug => subscriber.pretty().init(),
            LogFormat::Text => subscriber.init(),
        };
    }
}
