//! Record sink: append-only JSON-lines log of ingested telemetry.
//!
//! The log file is opened once, in append mode, and shared by every
//! ingestion task. [`RecordSink::append`] is the only write path: it
//! serialises one record to a single line and writes-then-flushes it while
//! holding the sink mutex, so concurrent lines never interleave. A write
//! that fails partway is truncated back to the last complete line.
//!
//! Line shape:
//! ```json
//! {"received_at":"2026-01-01T00:00:00.000000Z","client_ip":"127.0.0.1","payload":{...}}
//! ```

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::AppError;

/// One persisted unit of telemetry.
#[derive(Debug, Serialize)]
pub struct IngestedRecord<'a> {
    /// Server-assigned UTC timestamp, RFC 3339 with `Z`.
    pub received_at: &'a str,
    /// Peer address as observed on the socket.
    pub client_ip: String,
    /// Client-supplied JSON, stored as-is.
    pub payload: &'a Value,
}

/// Acknowledgement for a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub saved_to: PathBuf,
    pub timestamp: String,
}

/// Storage behind a [`RecordSink`].
pub trait RecordFile: AsyncWrite + Unpin + Send {
    /// Length of everything written so far.
    fn committed_len(&mut self) -> impl Future<Output = io::Result<u64>> + Send;

    /// Drop everything past `len`.
    fn truncate_to(&mut self, len: u64) -> impl Future<Output = io::Result<()>> + Send;
}

impl RecordFile for File {
    async fn committed_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }
}

/// Shared append-only log.
pub struct RecordSink<F = File> {
    path: PathBuf,
    /// `None` when the file could not be opened at startup; every append
    /// then fails and the caller answers 500.
    file: Option<Mutex<F>>,
}

impl RecordSink {
    /// Create `log_dir` if needed and open `log_dir/file_name` for appending.
    pub async fn open(log_dir: &Path, file_name: &str) -> Result<Self, AppError> {
        tokio::fs::create_dir_all(log_dir).await.map_err(|e| {
            AppError::Sink(format!("cannot create {}: {e}", log_dir.display()))
        })?;
        let path = log_dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AppError::Sink(format!("cannot open {}: {e}", path.display())))?;

        info!(path = %path.display(), "record log opened");
        Ok(Self { path, file: Some(Mutex::new(file)) })
    }

    /// A sink that rejects every append. Used when [`open`](Self::open)
    /// fails so the rest of the server keeps running.
    pub fn unavailable(path: PathBuf) -> Self {
        Self { path, file: None }
    }
}

impl<F: RecordFile> RecordSink<F> {
    /// A sink over an already-open `file`.
    pub fn with_file(path: PathBuf, file: F) -> Self {
        Self { path, file: Some(Mutex::new(file)) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record for `payload` observed from `peer`.
    ///
    /// The record is lost on error: there is no retry or buffering.
    pub async fn append(&self, peer: IpAddr, payload: &Value) -> Result<Receipt, AppError> {
        let Some(file) = &self.file else {
            return Err(AppError::Sink(format!("{} is not open", self.path.display())));
        };

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let record = IngestedRecord {
            received_at: &timestamp,
            client_ip: peer.to_string(),
            payload,
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| AppError::Sink(format!("cannot serialise record: {e}")))?;
        line.push(b'\n');

        {
            let mut file = file.lock().await;
            let committed = file.committed_len().await.map_err(|e| {
                AppError::Sink(format!("cannot stat {}: {e}", self.path.display()))
            })?;
            let written = async {
                file.write_all(&line).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = written {
                error!(path = %self.path.display(), "record append failed: {e}");
                // Leave no fragment for the next line to be glued onto.
                if let Err(rollback) = file.truncate_to(committed).await {
                    error!(path = %self.path.display(), committed, "cannot drop partial record: {rollback}");
                }
                return Err(AppError::Sink(format!("cannot append to {}: {e}", self.path.display())));
            }
        }

        debug!(path = %self.path.display(), bytes = line.len(), %peer, "record appended");
        Ok(Receipt { saved_to: self.path.clone(), timestamp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tempfile::TempDir;

    /// Accepts half of the first record it sees, then fails like a full disk
    /// once.
    struct ShortWriteFile {
        inner: File,
        armed: bool,
        failing: bool,
    }

    impl AsyncWrite for ShortWriteFile {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.failing {
                self.failing = false;
                return Poll::Ready(Err(io::Error::other("no space left on device")));
            }
            if self.armed {
                self.armed = false;
                self.failing = true;
                let half = buf.len() / 2;
                return Pin::new(&mut self.inner).poll_write(cx, &buf[..half]);
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl RecordFile for ShortWriteFile {
        async fn committed_len(&mut self) -> io::Result<u64> {
            self.inner.committed_len().await
        }

        async fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.inner.truncate_to(len).await
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).expect("every line is a JSON object"))
            .collect()
    }

    #[tokio::test]
    async fn append_writes_one_line_per_record() {
        let tmp = TempDir::new().unwrap();
        let sink = RecordSink::open(tmp.path(), "collected.jsonl").await.unwrap();

        let receipt = sink.append(localhost(), &json!({"a": 1})).await.unwrap();

        let lines = read_lines(sink.path());
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["payload"], json!({"a": 1}));
        assert_eq!(lines[0]["client_ip"], "127.0.0.1");
        assert_eq!(lines[0]["received_at"], receipt.timestamp.as_str());
        assert_eq!(receipt.saved_to, tmp.path().join("collected.jsonl"));
    }

    #[tokio::test]
    async fn timestamp_is_utc_rfc3339() {
        let tmp = TempDir::new().unwrap();
        let sink = RecordSink::open(tmp.path(), "c.jsonl").await.unwrap();
        let receipt = sink.append(localhost(), &json!(null)).await.unwrap();

        assert!(receipt.timestamp.ends_with('Z'));
        chrono::DateTime::parse_from_rfc3339(&receipt.timestamp).unwrap();
    }

    #[tokio::test]
    async fn reopening_appends_instead_of_truncating() {
        let tmp = TempDir::new().unwrap();
        {
            let sink = RecordSink::open(tmp.path(), "c.jsonl").await.unwrap();
            sink.append(localhost(), &json!("first")).await.unwrap();
        }
        let sink = RecordSink::open(tmp.path(), "c.jsonl").await.unwrap();
        sink.append(localhost(), &json!("second")).await.unwrap();

        let lines = read_lines(sink.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["payload"], "first");
        assert_eq!(lines[1]["payload"], "second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_never_interleave() {
        let tmp = TempDir::new().unwrap();
        let sink = Arc::new(RecordSink::open(tmp.path(), "c.jsonl").await.unwrap());
        let filler = "x".repeat(16 * 1024);

        let mut tasks = Vec::new();
        for i in 0..64 {
            let sink = sink.clone();
            let payload = json!({"n": i, "filler": filler});
            tasks.push(tokio::spawn(async move { sink.append(localhost(), &payload).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let lines = read_lines(sink.path());
        assert_eq!(lines.len(), 64);
        let mut seen: Vec<i64> = lines.iter().map(|l| l["payload"]["n"].as_i64().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_append_leaves_no_fragment_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("c.jsonl");
        {
            let sink = RecordSink::open(tmp.path(), "c.jsonl").await.unwrap();
            sink.append(localhost(), &json!("before")).await.unwrap();
        }
        let inner = OpenOptions::new().append(true).open(&path).await.unwrap();
        let sink = RecordSink::with_file(path, ShortWriteFile { inner, armed: true, failing: false });

        let err = sink.append(localhost(), &json!({"lost": "x".repeat(256)})).await.unwrap_err();
        assert!(matches!(err, AppError::Sink(_)));
        sink.append(localhost(), &json!("after")).await.unwrap();

        let lines = read_lines(sink.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["payload"], "before");
        assert_eq!(lines[1]["payload"], "after");
    }

    #[tokio::test]
    async fn unavailable_sink_rejects_appends() {
        let sink = RecordSink::unavailable(PathBuf::from("/nowhere/c.jsonl"));
        let err = sink.append(localhost(), &json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Sink(_)));
    }

    #[tokio::test]
    async fn open_fails_when_dir_is_a_file() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        assert!(RecordSink::open(&blocker, "c.jsonl").await.is_err());
    }
}
