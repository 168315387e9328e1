use clap::Parser;
use tracing_subscriber::EnvFilter;

use volley::cli::{self, Command, Opts};
use volley::{coordinator, server};

fn main() {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            let _ = err.print();
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let command = match cli::build(&opts) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(cpus) = opts.cpus {
        builder.worker_threads(cpus.max(1));
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match command {
            Command::Client { targets, output } => coordinator::run(targets, output).await,
            Command::Server { port, work } => server::run(port, work).await,
        }
    });

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
