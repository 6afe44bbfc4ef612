//! `tracing` initialization: console layer, optional daily-rolling file
//! layer via `tracing-appender`, and a background retention-pruning task.

use drone_bridge_protocol::LoggingConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Must be kept alive for the lifetime of the process; dropping it stops
/// the non-blocking file writer from flushing.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(cfg: &LoggingConfig) -> LoggingGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.as_tracing_level()));

    let console_layer = cfg.output_console.then(|| fmt::layer().with_target(false));

    let (file_layer, file_guard) = match &cfg.output_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &cfg.file_base_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(non_blocking).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(filter).with(console_layer).with(file_layer).init();

    if let Some(dir) = cfg.output_dir.clone() {
        spawn_retention_pruner(dir.into(), cfg.days_to_reserve);
    }

    LoggingGuard { _file_guard: file_guard }
}

/// Prunes files under `dir` older than `days_to_reserve`, once immediately
/// and then once every 24 hours.
fn spawn_retention_pruner(dir: PathBuf, days_to_reserve: u32) {
    tokio::spawn(async move {
        loop {
            prune_old_logs(&dir, days_to_reserve);
            tokio::time::sleep(PRUNE_INTERVAL).await;
        }
    });
}

fn prune_old_logs(dir: &std::path::Path, days_to_reserve: u32) {
    let cutoff = match std::time::SystemTime::now().checked_sub(Duration::from_secs(u64::from(days_to_reserve) * 86400)) {
        Some(cutoff) => cutoff,
        None => return,
    };
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        if let Ok(modified) = metadata.modified() {
            if modified < cutoff {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_removes_only_files_older_than_cutoff() {
        let dir = std::env::temp_dir().join(format!("ground-bridge-log-prune-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let old_file = dir.join("old.log");
        let new_file = dir.join("new.log");
        std::fs::write(&old_file, b"old").unwrap();
        std::fs::write(&new_file, b"new").unwrap();

        let far_past = std::time::SystemTime::now() - Duration::from_secs(10 * 86400);
        let old_handle = std::fs::OpenOptions::new().write(true).open(&old_file).unwrap();
        old_handle.set_modified(far_past).unwrap();

        prune_old_logs(&dir, 7);

        assert!(!old_file.exists());
        assert!(new_file.exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
