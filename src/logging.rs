//! Log initialization.
//!
//! `tracing_appender`'s built-in rolling writer only rotates on a time
//! schedule (hourly/daily); the numbered, size-capped rotation this server
//! uses (`socks4_N.log`, capped at [`LOG_ROTATION_SIZE`], at most
//! [`LOG_MAX_FILES`] files) is implemented here as a plain `std::io::Write`
//! that `tracing_appender::non_blocking` wraps for the async writer side.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::Event;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

use crate::cli::LogLevel;
use crate::config::{LOG_MAX_FILES, LOG_ROTATION_SIZE};

/// Renders `[YYYY-MM-DD HH:MM:SS] LEVEL MESSAGE`, matching the original
/// `boost::log` line format byte for byte instead of `tracing_subscriber`'s
/// default bracketless RFC3339 timestamp.
struct BracketedLocalTime;

impl<S, N> FormatEvent<S, N> for BracketedLocalTime
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "[{}] {} ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            event.metadata().level(),
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// A `Write` implementation that rolls `socks4_0.log` into `socks4_1.log`,
/// and so on up to [`LOG_MAX_FILES`], once the active file crosses
/// [`LOG_ROTATION_SIZE`] bytes.
pub struct SizeRotatingWriter {
    directory: PathBuf,
    current: File,
    written: u64,
}

impl SizeRotatingWriter {
    pub fn create(directory: impl AsRef<Path>) -> io::Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;
        let path = directory.join("socks4_0.log");
        let current = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let written = current.metadata()?.len();
        Ok(SizeRotatingWriter {
            directory,
            current,
            written,
        })
    }

    fn path_for(&self, index: usize) -> PathBuf {
        self.directory.join(format!("socks4_{index}.log"))
    }

    fn rotate(&mut self) -> io::Result<()> {
        for index in (0..LOG_MAX_FILES - 1).rev() {
            let from = self.path_for(index);
            if !from.exists() {
                continue;
            }
            let to = self.path_for(index + 1);
            std::fs::rename(&from, &to)?;
        }
        self.current = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path_for(0))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= LOG_ROTATION_SIZE {
            self.rotate()?;
        }
        let n = self.current.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.flush()
    }
}

/// Initialize the global `tracing` subscriber.
///
/// In the foreground, logs go to stderr. Daemonized, logs go to the
/// rotating file writer in `log_directory`; the returned guard must be
/// held for the process lifetime or buffered log lines can be dropped on
/// exit.
pub fn init(
    log_directory: &Path,
    level: LogLevel,
    foreground: bool,
) -> io::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter: tracing_subscriber::filter::LevelFilter = level.into();
    if foreground {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
        let fmt_layer = tracing_subscriber::fmt::Layer::default()
            .with_writer(writer)
            .event_format(BracketedLocalTime);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
        Ok(guard)
    } else {
        let rotating = SizeRotatingWriter::create(log_directory)?;
        let (writer, guard) = tracing_appender::non_blocking(rotating);
        let fmt_layer = tracing_subscriber::fmt::Layer::default()
            .with_writer(writer)
            .event_format(BracketedLocalTime);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
        Ok(guard)
    }
}
