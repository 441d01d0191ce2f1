// ===============================
// src/recorder.rs (JSONL journal)
// ===============================
//
// One JSON object per line: snapshot applications, intents, per-key outcomes.
// - buffered writer, flushed every second and every 500 lines
// - parent directory created on open
// - on write failure the file is reopened once; if that fails too the line
//   is dropped (the journal never stalls reconciliation)
//
// ENV: RECORD_FILE=/path/to/journal.jsonl (or --record-file)
//
use serde::Serialize;
use std::path::Path;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY_N_LINES: u32 = 500;

#[derive(Serialize)]
struct Line<'a> {
    ts_ms: i64,
    #[serde(flatten)]
    event: &'a Event,
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

struct Journal {
    path: String,
    writer: Option<BufWriter<File>>,
    pending: u32,
}

impl Journal {
    async fn open(path: String) -> Self {
        let writer = match open_writer(&path).await {
            Ok(w) => Some(w),
            Err(e) => {
                error!(?e, %path, "recorder: open failed, will retry on next event");
                None
            }
        };
        Self { path, writer, pending: 0 }
    }

    async fn write_line(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.writer.is_none() {
            self.writer = Some(open_writer(&self.path).await?);
        }
        match self.writer.as_mut() {
            Some(w) => w.write_all(bytes).await,
            None => Ok(()),
        }
    }

    async fn append(&mut self, ev: &Event) {
        let mut bytes = match serde_json::to_vec(&Line { ts_ms: chrono::Utc::now().timestamp_millis(), event: ev }) {
            Ok(b) => b,
            Err(e) => {
                error!(?e, "recorder: serialize error, event skipped");
                return;
            }
        };
        bytes.push(b'\n');

        if let Err(e) = self.write_line(&bytes).await {
            warn!(?e, "recorder: write failed, reopening");
            // buang writer lama, buka ulang sekali
            self.writer = None;
            if let Err(e2) = self.write_line(&bytes).await {
                error!(?e2, "recorder: write failed after reopen, line dropped");
                self.writer = None;
                return;
            }
        }

        self.pending += 1;
        if self.pending >= FLUSH_EVERY_N_LINES {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            if let Err(e) = w.flush().await {
                warn!(?e, "recorder: flush failed");
            }
        }
        self.pending = 0;
    }
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    info!(%path, "recorder: started");
    let mut journal = Journal::open(path).await;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => match maybe_ev {
                Some(ev) => journal.append(&ev).await,
                None => {
                    journal.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                }
            },
            _ = tick.tick() => journal.flush().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PosSide, PositionKey};

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let dir = std::env::temp_dir().join(format!("pm-journal-{}", std::process::id()));
        let path = dir.join("nested").join("journal.jsonl");
        let path_s = path.to_string_lossy().to_string();

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path_s.clone()));
        tx.send(Event::Note("hello".into())).await.unwrap();
        tx.send(Event::Outcome {
            ts_ms: 1,
            key: PositionKey::new("BTC", PosSide::Short),
            outcome: "closed 0.01 @ 100".into(),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0]["ts_ms"].is_i64());
        assert_eq!(lines[0]["Note"], "hello");
        assert_eq!(lines[1]["Outcome"]["key"]["side"], "Short");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
