//! Process-wide log sink with level filtering, daily/size-based file
//! rotation, and an optional queue-backed async write path.
//!
//! Records are formatted under the log mutex into a shared [`Buffer`],
//! then either written to the current file (sync mode) or handed to the
//! blocking deque for the single writer thread to drain (async mode).

use crate::buffer::Buffer;
use crate::deque::BlockDeque;
use crate::error::Result;
use chrono::{Datelike, Local};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

pub const LEVEL_DEBUG: u32 = 0;
pub const LEVEL_INFO: u32 = 1;
pub const LEVEL_WARN: u32 = 2;
pub const LEVEL_ERROR: u32 = 3;

const DEFAULT_MAX_LINES: usize = 50_000;

static INSTANCE: OnceLock<Arc<Log>> = OnceLock::new();

struct LogInner {
    is_open: bool,
    level: u32,
    is_async: bool,
    path: PathBuf,
    suffix: String,
    line_count: usize,
    max_lines: usize,
    today: u32,
    file: Option<BufWriter<File>>,
    buff: Buffer,
    deque: Option<Arc<BlockDeque<String>>>,
    writer: Option<JoinHandle<()>>,
}

pub struct Log {
    inner: Mutex<LogInner>,
}

impl Log {
    /// A fresh, closed sink. Production code goes through [`Log::instance`];
    /// this constructor exists so tests can run isolated sinks.
    pub fn new() -> Arc<Log> {
        Arc::new(Log {
            inner: Mutex::new(LogInner {
                is_open: false,
                level: LEVEL_INFO,
                is_async: false,
                path: PathBuf::new(),
                suffix: String::new(),
                line_count: 0,
                max_lines: DEFAULT_MAX_LINES,
                today: 0,
                file: None,
                buff: Buffer::new(),
                deque: None,
                writer: None,
            }),
        })
    }

    /// The process-wide sink. Closed until `init` is called.
    pub fn instance() -> &'static Arc<Log> {
        INSTANCE.get_or_init(Log::new)
    }

    /// Open the sink: level threshold, directory, filename suffix, and the
    /// async queue capacity (0 selects synchronous writes). The first file
    /// of the day is `YYYY_MM_DD<suffix>`.
    pub fn init(self: &Arc<Self>, level: u32, path: &Path, suffix: &str, queue_cap: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.is_open = true;
        inner.level = level;
        inner.line_count = 0;
        inner.path = path.to_path_buf();
        inner.suffix = suffix.to_string();

        if queue_cap > 0 {
            inner.is_async = true;
            if inner.deque.is_none() {
                let deque = Arc::new(BlockDeque::new(queue_cap));
                inner.deque = Some(Arc::clone(&deque));
                let log = Arc::clone(self);
                let handle = thread::Builder::new()
                    .name("nocturne-log".to_string())
                    .spawn(move || Log::drain_loop(log, deque))
                    .map_err(crate::error::ServerError::Io)?;
                inner.writer = Some(handle);
            }
        } else {
            inner.is_async = false;
        }

        let now = Local::now();
        inner.today = now.day();
        let name = format!("{}{}", now.format("%Y_%m_%d"), inner.suffix);
        if let Some(file) = inner.file.as_mut() {
            let _ = file.flush();
        }
        let file = open_log_file(&inner.path, &name)?;
        inner.file = Some(BufWriter::new(file));
        inner.buff.consume_all();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().is_open
    }

    pub fn level(&self) -> u32 {
        self.inner.lock().unwrap().level
    }

    pub fn set_level(&self, level: u32) {
        self.inner.lock().unwrap().level = level;
    }

    /// Lower the rotation threshold; used by tests that exercise rollover.
    pub fn set_max_lines(&self, max_lines: usize) {
        assert!(max_lines > 0);
        self.inner.lock().unwrap().max_lines = max_lines;
    }

    /// Format and emit one record. Filtered records are dropped before any
    /// formatting happens.
    pub fn write(&self, level: u32, args: fmt::Arguments<'_>) {
        let now = Local::now();
        let mut inner = self.inner.lock().unwrap();
        if !inner.is_open || level < inner.level {
            return;
        }

        // Day rolled or the current file hit its line quota.
        let day = now.day();
        if inner.today != day || (inner.line_count > 0 && inner.line_count % inner.max_lines == 0) {
            let tail = now.format("%Y_%m_%d").to_string();
            let name = if inner.today != day {
                inner.today = day;
                inner.line_count = 0;
                format!("{}{}", tail, inner.suffix)
            } else {
                format!("{}-{}{}", tail, inner.line_count / inner.max_lines, inner.suffix)
            };
            if let Some(file) = inner.file.as_mut() {
                let _ = file.flush();
            }
            if let Ok(file) = open_log_file(&inner.path, &name) {
                inner.file = Some(BufWriter::new(file));
            }
        }

        inner.line_count += 1;
        let prefix = format!(
            "{}.{:06} ",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_micros()
        );
        inner.buff.append_str(&prefix);
        inner.buff.append(level_tag(level));
        inner.buff.append_str(&args.to_string());
        inner.buff.append(b"\n");
        let record = inner.buff.take_string();

        if inner.is_async {
            if let Some(deque) = inner.deque.clone() {
                if !deque.is_full() {
                    deque.push_back(record);
                    return;
                }
            }
        }
        // Sync mode, or async with a saturated queue.
        if let Some(file) = inner.file.as_mut() {
            let _ = file.write_all(record.as_bytes());
        }
    }

    /// Flush the OS file buffer; in async mode also nudge the writer.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_async {
            if let Some(deque) = &inner.deque {
                deque.flush();
            }
        }
        if let Some(file) = inner.file.as_mut() {
            let _ = file.flush();
        }
    }

    /// Drain outstanding async records, stop the writer, and flush.
    pub fn shutdown(&self) {
        let (deque, writer) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.deque.take(), inner.writer.take())
        };
        if let Some(deque) = deque {
            while !deque.is_empty() {
                deque.flush();
                thread::yield_now();
            }
            deque.close();
            if let Some(writer) = writer {
                let _ = writer.join();
            }
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.as_mut() {
            let _ = file.flush();
        }
        inner.is_open = false;
        inner.is_async = false;
    }

    fn drain_loop(log: Arc<Log>, deque: Arc<BlockDeque<String>>) {
        while let Some(record) = deque.pop() {
            let mut inner = log.inner.lock().unwrap();
            if let Some(file) = inner.file.as_mut() {
                let _ = file.write_all(record.as_bytes());
            }
        }
        let mut inner = log.inner.lock().unwrap();
        if let Some(file) = inner.file.as_mut() {
            let _ = file.flush();
        }
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        // Instance sinks used in tests; the global lives for the process.
        let writer = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(deque) = inner.deque.take() {
                deque.close();
            }
            inner.writer.take()
        };
        if let Some(writer) = writer {
            let _ = writer.join();
        }
    }
}

fn level_tag(level: u32) -> &'static [u8] {
    match level {
        LEVEL_DEBUG => b"[debug]: ",
        LEVEL_INFO => b"[info] : ",
        LEVEL_WARN => b"[warn] : ",
        LEVEL_ERROR => b"[error]: ",
        _ => b"[info] : ",
    }
}

fn open_log_file(dir: &Path, name: &str) -> io::Result<File> {
    let path = dir.join(name);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Ok(file),
        Err(_) => {
            fs::create_dir_all(dir)?;
            OpenOptions::new().create(true).append(true).open(&path)
        }
    }
}

#[macro_export]
macro_rules! log_base {
    ($level:expr, $($arg:tt)*) => {{
        let log = $crate::logger::Log::instance();
        if log.is_open() && log.level() <= $level {
            log.write($level, format_args!($($arg)*));
            log.flush();
        }
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_base!($crate::logger::LEVEL_DEBUG, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_base!($crate::logger::LEVEL_INFO, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_base!($crate::logger::LEVEL_WARN, $($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_base!($crate::logger::LEVEL_ERROR, $($arg)*) };
}
