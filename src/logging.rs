//! Diagnostics setup
//!
//! Installs the global `tracing` subscriber: a stderr layer and, when
//! enabled, a file layer. File output goes through a channel to a background
//! thread so that callers never block on disk I/O. Files live under
//! XDG_DATA_HOME/rentchat-sync/logs/ and are named YYYY-MM-DD.log.

use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, Sender};
use snafu::ResultExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{
    AlreadyInstalledSnafu, CreateLogDirSnafu, LoggingError, NoDataDirSnafu, SpawnWriterSnafu,
};

/// Hands formatted lines to the writer thread
#[derive(Clone)]
struct ChannelWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // If send fails, the writer thread has stopped - silently ignore
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ChannelWriter {
    type Writer = ChannelWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `filter`. Returns the log directory when file output is enabled.
pub fn init(filter: &str, log_to_file: bool) -> Result<Option<PathBuf>, LoggingError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let (file_layer, log_dir) = if log_to_file {
        let log_dir = get_log_directory()?;
        let writer = spawn_file_writer(&log_dir)?;
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(log_dir))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|_| AlreadyInstalledSnafu { stage: "init_logging" }.build())?;

    Ok(log_dir)
}

fn spawn_file_writer(log_dir: &Path) -> Result<ChannelWriter, LoggingError> {
    let stage = "spawn_file_writer";
    // Create log directory if it doesn't exist
    fs::create_dir_all(log_dir).context(CreateLogDirSnafu {
        stage,
        path: log_dir.display().to_string(),
    })?;

    let (tx, rx) = unbounded::<Vec<u8>>();
    let dir = log_dir.to_path_buf();
    thread::Builder::new()
        .name("rentchat-log".to_string())
        .spawn(move || run_writer_thread(rx, dir))
        .context(SpawnWriterSnafu { stage })?;

    Ok(ChannelWriter { tx })
}

/// Background thread that handles all file I/O
fn run_writer_thread(rx: Receiver<Vec<u8>>, log_dir: PathBuf) {
    // (date, writer) of the file currently appended to
    let mut current: Option<(String, BufWriter<File>)> = None;

    while let Ok(line) = rx.recv() {
        let date = Local::now().format("%Y-%m-%d").to_string();
        if let Err(e) = write_line(&mut current, &log_dir, &date, &line) {
            eprintln!("Log writer error: {}", e);
        }
    }

    if let Some((_, mut writer)) = current.take() {
        let _ = writer.flush();
    }
}

fn write_line(
    current: &mut Option<(String, BufWriter<File>)>,
    log_dir: &Path,
    date: &str,
    line: &[u8],
) -> io::Result<()> {
    let stale = current.as_ref().map_or(true, |(open_date, _)| open_date != date);
    if stale {
        if let Some((_, mut old)) = current.take() {
            old.flush()?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path(log_dir, date))?;
        *current = Some((date.to_string(), BufWriter::new(file)));
    }

    if let Some((_, writer)) = current.as_mut() {
        writer.write_all(line)?;
        writer.flush()?;
    }
    Ok(())
}

fn log_file_path(log_dir: &Path, date: &str) -> PathBuf {
    log_dir.join(format!("{}.log", date))
}

/// Get the platform-specific log directory using XDG conventions
pub fn get_log_directory() -> Result<PathBuf, LoggingError> {
    let base = directories::BaseDirs::new().ok_or_else(|| NoDataDirSnafu { stage: "log_dir" }.build())?;

    // Use XDG_DATA_HOME on Linux, equivalent on other platforms
    Ok(base.data_dir().join("rentchat-sync").join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_layout() {
        let path = get_log_directory().expect("data dir");
        assert!(path.ends_with("rentchat-sync/logs"));
    }

    #[test]
    fn test_write_line_rolls_over_by_date() {
        let dir = std::env::temp_dir().join(format!("rentchat-sync-logs-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("scratch dir");
        let mut current = None;

        write_line(&mut current, &dir, "2026-01-01", b"first\n").expect("writes");
        write_line(&mut current, &dir, "2026-01-01", b"second\n").expect("writes");
        write_line(&mut current, &dir, "2026-01-02", b"third\n").expect("writes");

        let day_one = fs::read_to_string(log_file_path(&dir, "2026-01-01")).expect("day one");
        let day_two = fs::read_to_string(log_file_path(&dir, "2026-01-02")).expect("day two");
        assert_eq!(day_one, "first\nsecond\n");
        assert_eq!(day_two, "third\n");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_channel_writer_forwards_bytes() {
        let (tx, rx) = unbounded();
        let mut writer = ChannelWriter { tx };
        writer.write_all(b"hello").expect("writes");
        assert_eq!(rx.try_recv().expect("queued"), b"hello".to_vec());
    }
}
