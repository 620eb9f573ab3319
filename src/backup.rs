//! C12 BackupWorker — periodic snapshot of every player YAML into one dated JSON file, with
//! count-based retention and a bounded retry policy (§4.12).

use crate::config::ConfigRegistry;
use crate::error::CoreResult;
use crate::model::Time;
use crate::store::file_store::FileStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub timestamp: Time,
    pub player_count: usize,
    pub backup_version: u32,
    /// player id -> raw YAML bytes, carried through verbatim so a restore needs no schema
    /// migration beyond whatever `PlayerStore` already tolerates.
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub players_backed_up: usize,
    pub file_name: Option<String>,
    pub pruned: Vec<String>,
}

/// Scans `players/*.yaml`, writes one dated snapshot, then prunes by count. Owns its own
/// interval loop; `start`/`stop` are idempotent (a second `start` is a no-op, `stop` on an
/// unstarted worker does nothing).
pub struct BackupWorker {
    files: Arc<FileStore>,
    config: Arc<ConfigRegistry>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackupWorker {
    pub fn new(files: Arc<FileStore>, config: Arc<ConfigRegistry>) -> Arc<Self> {
        Arc::new(Self { files, config, handle: Mutex::new(None) })
    }

    /// Spawns the interval loop if it isn't already running. First run fires after
    /// `backup.start_delay` ms; subsequent runs every `backup.interval` ms.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().expect("backup worker lock poisoned");
        if guard.is_some() {
            return;
        }
        let worker = Arc::clone(self);
        let jh = tokio::spawn(async move {
            let start_delay = worker.config.snapshot().backup.start_delay.max(0) as u64;
            tokio::time::sleep(Duration::from_millis(start_delay)).await;
            loop {
                let now = chrono::Utc::now().timestamp_millis();
                match worker.run_with_retry(now).await {
                    Ok(report) => {
                        tracing::info!(
                            players = report.players_backed_up,
                            file = ?report.file_name,
                            pruned = report.pruned.len(),
                            "backup completed"
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "backup failed after exhausting retries"),
                }
                let interval = worker.config.snapshot().backup.interval.max(1) as u64;
                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        });
        *guard = Some(jh);
    }

    /// Cancels any pending timer. Safe to call when not started.
    pub fn stop(&self) {
        if let Some(jh) = self.handle.lock().expect("backup worker lock poisoned").take() {
            jh.abort();
        }
    }

    /// Runs one backup attempt, retrying up to `backup.retry_count` times with
    /// `backup.retry_interval` ms between attempts on failure.
    pub async fn run_with_retry(&self, now: Time) -> CoreResult<BackupReport> {
        let config = self.config.snapshot();
        if !config.backup.enabled {
            return Ok(BackupReport::default());
        }
        let mut attempt = 0u32;
        loop {
            match self.run_once(now) {
                Ok(report) => return Ok(report),
                Err(e) => {
                    if attempt >= config.backup.retry_count {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "backup attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(config.backup.retry_interval.max(0) as u64))
                        .await;
                }
            }
        }
    }

    fn run_once(&self, now: Time) -> CoreResult<BackupReport> {
        let config = self.config.snapshot();
        let mut data = HashMap::new();
        for rel in self.files.list_dir("players")? {
            let Some(id) = rel.strip_prefix("players/").and_then(|s| s.strip_suffix(".yaml")) else {
                continue;
            };
            if let Some(text) = self.files.read_to_string(&rel)? {
                data.insert(id.to_string(), text);
            }
        }
        let player_count = data.len();
        let snapshot = BackupFile { timestamp: now, player_count, backup_version: 1, data };

        let file_name = backup_file_name(&config.backup.file_prefix, now);
        self.files.write_json(&format!("backups/{file_name}"), &snapshot)?;

        let pruned = self.prune(config.backup.max_backups, &config.backup.file_prefix)?;
        Ok(BackupReport { players_backed_up: player_count, file_name: Some(file_name), pruned })
    }

    /// Deletes the oldest backups beyond `max_backups`. ISO-8601 timestamps in the file name
    /// sort lexically in creation order, so a plain sort gives oldest-first.
    fn prune(&self, max_backups: usize, file_prefix: &str) -> CoreResult<Vec<String>> {
        let mut files = self.files.list_files(&format!("backups/{file_prefix}"))?;
        files.sort();
        let mut pruned = Vec::new();
        while files.len() > max_backups {
            let oldest = files.remove(0);
            self.files.delete_file(&oldest)?;
            pruned.push(oldest);
        }
        Ok(pruned)
    }
}

fn backup_file_name(prefix: &str, now: Time) -> String {
    let dt = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(now).unwrap_or_default();
    let iso = dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true).replace(':', "-");
    format!("{prefix}{iso}.json")
}
