//! Command-line interface.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::DEFAULT_PORT;

/// A SOCKS4/4a proxy server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to bind the listening socket to
    pub bind_addr: Ipv4Addr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of worker threads; defaults to the number of available cores
    #[arg(short, long)]
    pub threads: Option<u32>,

    /// Directory to write rotating log files into
    #[arg(short = 'o', long)]
    pub log_directory: Option<PathBuf>,

    /// Minimum severity of log messages to record
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Stay attached to the terminal instead of daemonizing
    #[arg(short, long)]
    pub foreground: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        use tracing_subscriber::filter::LevelFilter;
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            // `tracing` has no dedicated fatal level; errors and fatal
            // conditions both surface as `ERROR` records.
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

impl Cli {
    /// The directory to place rotating log files in, resolving the
    /// `PREFIX`-relative default when `--log-directory` was not given.
    pub fn resolved_log_directory(&self) -> PathBuf {
        if let Some(dir) = &self.log_directory {
            return dir.clone();
        }
        let prefix = std::env::var("PREFIX").unwrap_or_else(|_| "/usr/local".to_owned());
        PathBuf::from(prefix).join("var/log/socks4")
    }

    /// Worker thread count, defaulting to the number of available cores.
    pub fn resolved_threads(&self) -> usize {
        self.threads.map(|t| t as usize).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        })
    }
}
