//! Entry point for the `socks4d` binary.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![forbid(unsafe_code)]

use clap::Parser;
use tracing::error;

use socks4d::cli::Cli;
use socks4d::error::ServerError;
use socks4d::{logging, server};

async fn main_real(cli: &Cli) -> Result<(), ServerError> {
    server::run(cli.bind_addr, cli.port).await
}

fn main() {
    let cli = Cli::parse();
    let log_directory = cli.resolved_log_directory();

    if !cli.foreground {
        std::fs::create_dir_all(&log_directory).unwrap_or_else(|source| {
            eprintln!(
                "fatal: {}",
                ServerError::LogDirectory {
                    path: log_directory.clone(),
                    source,
                }
            );
            std::process::exit(1);
        });

        // Fork before any threads (the logging worker thread included)
        // are spawned; a forked child does not inherit the parent's
        // other threads.
        let daemonize = daemonize::Daemonize::new()
            .working_directory(".")
            .umask(0o027);
        if let Err(e) = daemonize.start().map_err(ServerError::Daemonize) {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    }

    // The guard must outlive every logging call; dropping it flushes the
    // non-blocking writer's buffer.
    let _log_guard = logging::init(&log_directory, cli.log_level, cli.foreground)
        .unwrap_or_else(|e| {
            eprintln!("fatal: could not initialize logging: {e}");
            std::process::exit(1);
        });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.resolved_threads())
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("could not build the async runtime: {e}");
            std::process::exit(1);
        });

    let exit_code = runtime.block_on(async {
        if let Err(e) = main_real(&cli).await {
            error!("giving up: {e}");
            1
        } else {
            0
        }
    });
    std::process::exit(exit_code);
}
