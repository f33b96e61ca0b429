use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// Message severity, most severe first. A sink receives a message only while
/// the service threshold is at least the message level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Message = 2,
    Debug = 3,
    All = 4,
}

impl LogLevel {
    pub fn from_raw(value: i64) -> LogLevel {
        match value {
            i64::MIN..=0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Message,
            3 => LogLevel::Debug,
            _ => LogLevel::All,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write(&self, message: &str, sender: &str, level: LogLevel);
}

/// Default sink: swallows everything.
pub struct NullLog;

impl LogSink for NullLog {
    fn write(&self, _message: &str, _sender: &str, _level: LogLevel) {}
}

/// Errors and warnings go to stderr, the rest to stdout.
pub struct ConsoleLog;

impl LogSink for ConsoleLog {
    fn write(&self, message: &str, sender: &str, level: LogLevel) {
        let line = format!("{}{}{}", format_log_level(level), format_sender(sender), message);
        if level <= LogLevel::Warn {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

pub struct FileLog {
    file: Mutex<File>,
}

impl FileLog {
    pub fn create(path: &str) -> std::io::Result<FileLog> {
        Ok(FileLog { file: Mutex::new(File::create(path)?) })
    }
}

impl LogSink for FileLog {
    fn write(&self, message: &str, sender: &str, level: LogLevel) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}{}{}", format_log_level(level), format_sender(sender), message);
        }
    }
}

static SINK: OnceLock<Box<dyn LogSink>> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::All as u8);
static SENDER_FILTER: Mutex<String> = Mutex::new(String::new());

/// Install the process-wide sink. Set-once: later calls are ignored.
pub fn provide_log(sink: Box<dyn LogSink>) {
    let _ = SINK.set(sink);
}

pub fn set_log_level(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    LogLevel::from_raw(THRESHOLD.load(Ordering::Relaxed) as i64)
}

/// An empty filter passes every sender; a non-empty one passes exact matches.
pub fn set_sender_filter(sender: &str) {
    if let Ok(mut filter) = SENDER_FILTER.lock() {
        filter.clear();
        filter.push_str(sender);
    }
}

fn is_logging_allowed(sender: &str, level: LogLevel) -> bool {
    if level > log_level() {
        return false;
    }
    match SENDER_FILTER.lock() {
        Ok(filter) => filter.is_empty() || filter.as_str() == sender,
        Err(_) => false,
    }
}

fn log(message: &str, sender: &str, level: LogLevel) {
    if !is_logging_allowed(sender, level) {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.write(message, sender, level);
    }
}

pub fn log_error(message: &str, sender: &str) {
    log(message, sender, LogLevel::Error);
}

pub fn log_warn(message: &str, sender: &str) {
    log(message, sender, LogLevel::Warn);
}

pub fn log_message(message: &str, sender: &str) {
    log(message, sender, LogLevel::Message);
}

pub fn log_debug(message: &str, sender: &str) {
    log(message, sender, LogLevel::Debug);
}

pub fn format_log_level(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "(Error) ",
        LogLevel::Warn => "(Warning) ",
        LogLevel::Debug => "(Debug) ",
        LogLevel::Message | LogLevel::All => "",
    }
}

pub fn format_sender(sender: &str) -> String {
    if sender.is_empty() { String::new() } else { format!("{sender}: ") }
}
