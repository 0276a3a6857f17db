// src/logger.rs
//! Rotating file logger behind the `log` facade.
//!
//! One file per calendar day; a file is also split once the running line
//! count hits a multiple of `split_lines`. With `max_queue_size == 0`
//! every call formats and writes under the mutex; with a positive queue
//! size the formatted line is handed to a single drain thread instead.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Datelike, Local};
use log::{LevelFilter, Log, Metadata, Record};

use crate::error::{EmberError, EmberResult};
use crate::queue::BlockQueue;
use crate::sync::lock_or_recover;

pub const DEFAULT_SPLIT_LINES: u64 = 5_000_000;

struct LogSink {
    dir: PathBuf,
    basename: String,
    file: File,
    today: u32,
    count: u64,
    split_lines: u64,
}

impl LogSink {
    fn open(path: &Path, split_lines: u64, now: DateTime<Local>) -> EmberResult<Self> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("server.log"));
        fs::create_dir_all(&dir)?;
        let file = Self::open_file(&dir, &basename, now, None)?;
        Ok(Self {
            dir,
            basename,
            file,
            today: now.day(),
            count: 0,
            split_lines,
        })
    }

    fn file_path(dir: &Path, basename: &str, date: DateTime<Local>, seq: Option<u64>) -> PathBuf {
        let stamp = date.format("%Y_%m_%d");
        match seq {
            None => dir.join(format!("{}_{}", stamp, basename)),
            Some(seq) => dir.join(format!("{}_{}.{}", stamp, basename, seq)),
        }
    }

    fn open_file(
        dir: &Path,
        basename: &str,
        date: DateTime<Local>,
        seq: Option<u64>,
    ) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_path(dir, basename, date, seq))
    }

    fn write_line(&mut self, line: &str, now: DateTime<Local>) -> io::Result<()> {
        self.count += 1;
        if self.today != now.day() || self.count % self.split_lines == 0 {
            self.file.flush()?;
            let seq = if self.today != now.day() {
                self.today = now.day();
                self.count = 0;
                None
            } else {
                Some(self.count / self.split_lines)
            };
            self.file = Self::open_file(&self.dir, &self.basename, now, seq)?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.flush()
    }
}

pub struct FileLogger {
    sink: Arc<Mutex<LogSink>>,
    queue: Option<Arc<BlockQueue<String>>>,
}

impl FileLogger {
    /// Build a logger without installing it. `max_queue_size == 0` keeps
    /// writes synchronous; anything positive starts the drain thread.
    pub fn create(path: &Path, split_lines: u64, max_queue_size: usize) -> EmberResult<Self> {
        let sink = Arc::new(Mutex::new(LogSink::open(path, split_lines, Local::now())?));
        let queue = if max_queue_size > 0 {
            let queue: Arc<BlockQueue<String>> = Arc::new(BlockQueue::new(max_queue_size));
            let drain_queue = Arc::clone(&queue);
            let drain_sink = Arc::clone(&sink);
            thread::Builder::new()
                .name("ember-log".to_string())
                .spawn(move || loop {
                    let line = drain_queue.pop();
                    let mut sink = lock_or_recover(&drain_sink);
                    if let Err(e) = sink.write_line(&line, Local::now()) {
                        eprintln!("log write failed: {}", e);
                    }
                })
                .map_err(EmberError::Io)?;
            Some(queue)
        } else {
            None
        };
        Ok(Self { sink, queue })
    }

    /// Install the logger process-wide. Skipping this call entirely is the
    /// "logging disabled" mode: the level macros become no-ops.
    pub fn init(path: &Path, split_lines: u64, max_queue_size: usize) -> EmberResult<()> {
        let logger = Self::create(path, split_lines, max_queue_size)?;
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| EmberError::Logger(e.to_string()))?;
        log::set_max_level(LevelFilter::Debug);
        Ok(())
    }

    fn format_line(record: &Record, now: DateTime<Local>) -> String {
        format!(
            "{} [{}]: {}\n",
            now.format("%Y-%m-%d %H:%M:%S%.6f"),
            level_tag(record.level()),
            record.args()
        )
    }

    fn write_direct(&self, line: &str) {
        let mut sink = lock_or_recover(&self.sink);
        if let Err(e) = sink.write_line(line, Local::now()) {
            eprintln!("log write failed: {}", e);
        }
    }
}

impl Log for FileLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let line = Self::format_line(record, Local::now());
        match &self.queue {
            // A full queue falls back to the synchronous path so the line
            // is never dropped.
            Some(queue) => {
                if !queue.push(line.clone()) {
                    self.write_direct(&line);
                }
            }
            None => self.write_direct(&line),
        }
    }

    fn flush(&self) {
        let mut sink = lock_or_recover(&self.sink);
        let _ = sink.file.flush();
    }
}

fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "error",
        log::Level::Warn => "warn",
        log::Level::Info => "info",
        log::Level::Debug | log::Level::Trace => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use log::Level;
    use std::time::Duration;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn sync_write_formats_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::create(&dir.path().join("server.log"), 1000, 0).unwrap();
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .args(format_args!("hello world"))
                .build(),
        );
        let name = LogSink::file_path(dir.path(), "server.log", Local::now(), None);
        let content = fs::read_to_string(name).unwrap();
        assert!(content.contains("[info]: hello world\n"), "got: {}", content);
    }

    #[test]
    fn rotates_on_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("server.log");
        let mut sink = LogSink::open(&base, 2, day(2025, 3, 10)).unwrap();
        for i in 0..5 {
            sink.write_line(&format!("line {}\n", i), day(2025, 3, 10)).unwrap();
        }
        // Split files carry the sequence number after the basename.
        let plain = fs::read_to_string(dir.path().join("2025_03_10_server.log")).unwrap();
        let first_split = fs::read_to_string(dir.path().join("2025_03_10_server.log.1")).unwrap();
        let second_split = fs::read_to_string(dir.path().join("2025_03_10_server.log.2")).unwrap();
        assert_eq!(plain.lines().count(), 1);
        assert_eq!(first_split.lines().count(), 2);
        assert_eq!(second_split.lines().count(), 2);
    }

    #[test]
    fn rotates_on_day_change() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("server.log");
        let mut sink = LogSink::open(&base, 1000, day(2025, 3, 10)).unwrap();
        sink.write_line("first day\n", day(2025, 3, 10)).unwrap();
        sink.write_line("second day\n", day(2025, 3, 11)).unwrap();
        let first = fs::read_to_string(LogSink::file_path(dir.path(), "server.log", day(2025, 3, 10), None)).unwrap();
        let second = fs::read_to_string(LogSink::file_path(dir.path(), "server.log", day(2025, 3, 11), None)).unwrap();
        assert!(first.contains("first day"));
        assert!(second.contains("second day"));
        assert!(!second.contains("first day"));
    }

    #[test]
    fn async_mode_preserves_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileLogger::create(&dir.path().join("server.log"), 1000, 64).unwrap();
        for i in 0..20 {
            logger.log(
                &Record::builder()
                    .level(Level::Debug)
                    .args(format_args!("msg {}", i))
                    .build(),
            );
        }
        let name = LogSink::file_path(dir.path(), "server.log", Local::now(), None);
        let mut content = String::new();
        for _ in 0..100 {
            content = fs::read_to_string(&name).unwrap_or_default();
            if content.lines().count() == 20 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let positions: Vec<usize> = (0..20)
            .map(|i| content.find(&format!("msg {}\n", i)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}
