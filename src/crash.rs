//! Crash diagnostics
//!
//! A panic anywhere (including the camera and audio capture threads) is
//! written to `crash.log` next to the regular logs, together with the last
//! critical operation the pipeline started. The file is written and synced
//! from the panic hook itself so the report survives an abort.

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicInfo;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::error;

/// Crash log file path, set during initialization
static CRASH_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Most recent breadcrumb from [`log_critical_operation`]
static LAST_OPERATION: Mutex<Option<String>> = Mutex::new(None);

const CRASH_LOG_FILENAME: &str = "crash.log";

/// Install the panic hook. Call this early in main().
///
/// Returns the path to the crash log file.
pub fn init_crash_handler(log_dir: &Path) -> std::io::Result<PathBuf> {
    let crash_log_path = log_dir.join(CRASH_LOG_FILENAME);

    // Fail now rather than inside the hook
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&crash_log_path)?;

    let _ = CRASH_LOG_PATH.set(crash_log_path.clone());

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        handle_panic(panic_info);
        default_hook(panic_info);
    }));

    Ok(crash_log_path)
}

fn handle_panic(panic_info: &PanicInfo<'_>) {
    let message = panic_message(panic_info.payload());
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "unknown location".to_string());
    let thread = std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_string();
    let last_op = LAST_OPERATION
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    let report = format_report(
        &chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        &thread,
        &location,
        &message,
        last_op.as_deref(),
        &std::backtrace::Backtrace::force_capture().to_string(),
    );

    if let Some(path) = CRASH_LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(report.as_bytes());
            let _ = file.sync_all();
        }
    }

    // May not be flushed if the process aborts
    error!(
        "PANIC in thread '{}' at {}: {} (see crash.log for full backtrace)",
        thread, location, message
    );
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}

fn format_report(
    timestamp: &str,
    thread: &str,
    location: &str,
    message: &str,
    last_op: Option<&str>,
    backtrace: &str,
) -> String {
    let separator = "=".repeat(80);
    format!(
        "\n{sep}\n\
         PANIC at {timestamp}\n\
         {sep}\n\
         Thread: {thread}\n\
         Location: {location}\n\
         Message: {message}\n\
         Last operation: {op}\n\
         \n\
         Backtrace:\n\
         {backtrace}\n\
         {sep}\n",
        sep = separator,
        op = last_op.unwrap_or("none"),
    )
}

/// Record a critical operation marker in the crash log.
/// Call this before operations that touch devices or the encoder.
pub fn log_critical_operation(operation: &str) {
    *LAST_OPERATION
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(operation.to_string());

    let Some(path) = CRASH_LOG_PATH.get() else {
        return;
    };
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "[{}] CRITICAL_OP: {}", timestamp, operation);
    }
}
