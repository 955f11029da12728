//! Consumes confirmation events from the engine thread: appends each to the
//! attendance log and fires a detached notification.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use livegate_core::SubjectId;

/// A confirmation stamped with wall-clock time by the engine thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub subject: SubjectId,
    pub recorded_at: DateTime<Local>,
}

pub struct Recorder {
    log_path: PathBuf,
    notify_command: Option<String>,
}

impl Recorder {
    pub fn new(log_path: PathBuf, notify_command: Option<String>) -> Self {
        Self {
            log_path,
            notify_command,
        }
    }

    /// Drain events until every sender is dropped. Returns how many were
    /// recorded. A failed append is logged and the event dropped.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<AttendanceEvent>) -> usize {
        let mut recorded = 0;
        while let Some(event) = events.recv().await {
            match append(&self.log_path, &event).await {
                Ok(()) => {
                    recorded += 1;
                    tracing::info!(
                        subject = %event.subject,
                        at = %event.recorded_at.to_rfc3339(),
                        "attendance recorded"
                    );
                }
                Err(e) => {
                    tracing::warn!(subject = %event.subject, error = %e, "failed to record attendance");
                    continue;
                }
            }
            if let Some(command) = &self.notify_command {
                tokio::spawn(notify(command.clone(), event));
            }
        }
        tracing::info!(recorded, "recorder stopped");
        recorded
    }
}

async fn append(path: &Path, event: &AttendanceEvent) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Run the notification hook. Failures never reach the frame loop.
async fn notify(command: String, event: AttendanceEvent) {
    let status = tokio::process::Command::new(&command)
        .arg(event.subject.as_str())
        .arg(event.recorded_at.to_rfc3339())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            tracing::debug!(subject = %event.subject, "notification sent");
        }
        Ok(status) => {
            tracing::warn!(subject = %event.subject, %status, "notification hook failed");
        }
        Err(e) => {
            tracing::warn!(subject = %event.subject, command = %command, error = %e, "notification hook did not start");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_log(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!(
                "livegated-recorder-{name}-{}",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ))
            .join("attendance.jsonl")
    }

    #[tokio::test]
    async fn test_records_each_event_as_a_line() {
        let path = scratch_log("lines");
        let (tx, rx) = mpsc::unbounded_channel();
        for name in ["alice", "bob"] {
            tx.send(AttendanceEvent {
                subject: name.into(),
                recorded_at: Local::now(),
            })
            .unwrap();
        }
        drop(tx);

        let recorded = Recorder::new(path.clone(), None).run(rx).await;
        assert_eq!(recorded, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let subjects: Vec<String> = text
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["subject"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(subjects, ["alice", "bob"]);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_unwritable_log_drops_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(AttendanceEvent {
            subject: "alice".into(),
            recorded_at: Local::now(),
        })
        .unwrap();
        drop(tx);
        let recorded = Recorder::new(PathBuf::from("/proc/livegate/attendance.jsonl"), None)
            .run(rx)
            .await;
        assert_eq!(recorded, 0);
    }
}
