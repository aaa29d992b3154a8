use anyhow::{Context, Result};
#[cfg(not(target_os = "macos"))]
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_BASENAME: &str = "livecast.log";
const LOG_DIR_ENV: &str = "LIVECAST_LOG_PATH";
const LOG_RETENTION_DAYS: u64 = 7;

/// Subsystem for macOS unified logging (os_log)
#[cfg(target_os = "macos")]
const OSLOG_SUBSYSTEM: &str = "dev.livecast.agent";

/// Get the log directory path
pub fn get_log_dir() -> Result<PathBuf> {
    resolve_log_dir()
}

/// Log to a daily rolling file and to stderr.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the lifetime of the process.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    prune_old_logs(
        &log_dir,
        Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS),
    );

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_thread_names(true)
        .with_ansi(false);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    #[cfg(target_os = "macos")]
    {
        // Also visible via `log stream --predicate 'subsystem == "dev.livecast.agent"'`
        let oslog_layer = tracing_oslog::OsLogger::new(OSLOG_SUBSYSTEM, "default");

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .with(oslog_layer)
            .init();
    }

    #[cfg(not(target_os = "macos"))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .init();
    }

    Ok(guard)
}

fn resolve_log_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(LOG_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }

    // ~/Library/Logs is where Console.app looks for app logs
    #[cfg(target_os = "macos")]
    {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("Failed to determine home directory for log path")?;
        Ok(home.join("Library").join("Logs").join("livecast"))
    }

    #[cfg(not(target_os = "macos"))]
    {
        let proj_dirs = ProjectDirs::from("dev", "livecast", "agent")
            .context("Failed to determine project directories for log path")?;
        Ok(platform_log_dir(&proj_dirs))
    }
}

#[cfg(target_os = "windows")]
fn platform_log_dir(proj_dirs: &ProjectDirs) -> PathBuf {
    proj_dirs.data_local_dir().join("Logs")
}

#[cfg(target_os = "linux")]
fn platform_log_dir(proj_dirs: &ProjectDirs) -> PathBuf {
    proj_dirs
        .state_dir()
        .unwrap_or_else(|| proj_dirs.data_local_dir())
        .join("logs")
}

#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
fn platform_log_dir(proj_dirs: &ProjectDirs) -> PathBuf {
    proj_dirs.data_local_dir().join("logs")
}

/// Delete rotated log files older than `max_age`
fn prune_old_logs(log_dir: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };

    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_BASENAME));
        if !is_log {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };

        if modified < cutoff {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(path: &Path, age: Duration) {
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_prune_removes_only_old_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let day = Duration::from_secs(60 * 60 * 24);

        let old_log = dir.path().join("livecast.log.2026-01-01");
        let fresh_log = dir.path().join("livecast.log.2026-10-17");
        let old_other = dir.path().join("crash.log");
        touch(&old_log, day * 30);
        touch(&fresh_log, Duration::ZERO);
        touch(&old_other, day * 30);

        prune_old_logs(dir.path(), day * 7);

        assert!(!old_log.exists());
        assert!(fresh_log.exists());
        assert!(old_other.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_logs_live_under_state_dir() {
        let proj_dirs = ProjectDirs::from("dev", "livecast", "agent").unwrap();
        let dir = platform_log_dir(&proj_dirs);
        assert!(dir.ends_with("logs"));
        assert!(dir.starts_with(proj_dirs.state_dir().unwrap_or(proj_dirs.data_local_dir())));
    }

    #[test]
    fn test_prune_missing_dir_is_harmless() {
        prune_old_logs(Path::new("/nonexistent/livecast-logs"), Duration::ZERO);
    }
}
