pub mod args;
pub mod config;
pub mod logger;
pub mod server;

pub use args::{parse, Args, LogFormat};
pub use config::{get_config, set_config, Config};
pub use logger::init_logging;
pub use server::run_server;
