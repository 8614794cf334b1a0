use std::io::{self, IsTerminal, Write};

use grafdoor::app::{self, Args};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::parse();

    let config = match app::Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(err) => {
            if io::stdin().is_terminal() {
                eprintln!("config error: {err}");
                let _ = io::stdout().flush();
            } else {
                eprintln!("config error: {err:?}");
            }
            std::process::exit(exitcode::CONFIG);
        }
    };

    if args.test_config {
        println!("configuration is valid");
        std::process::exit(exitcode::OK);
    }

    app::set_config(config.clone());

    if let Err(err) = app::init_logging(&args, &config) {
        eprintln!("logging init error: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }

    if let Err(err) = app::run_server(args, config) {
        tracing::error!(error = %err, "server exited with error");
        std::process::exit(exitcode::SOFTWARE);
    }
}
