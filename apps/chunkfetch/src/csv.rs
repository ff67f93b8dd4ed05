//! CSV progress log.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use chunkfetch_protocol::{DownloadMetrics, ProgressSnapshot};
use chunkfetch_transfer::{ProgressObserver, TransferError};
use tracing::{info, warn};

const HEADER: &str = "Timestamp,ElapsedTime,ProgressPercent,SpeedMbps,CompletedChunks,TotalChunks,BytesTransferred,TotalBytes";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const BUFFER_CAPACITY: usize = 64 * 1024;

/// Appends one row per progress event, error rows, and a summary block once
/// the download finishes.
///
/// Progress rows are buffered in memory and reach the file when the buffer
/// fills or on the next error or summary, so chunk tasks never wait on a
/// disk flush. Write failures are logged and otherwise ignored.
pub struct CsvProgressObserver {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl CsvProgressObserver {
    /// Creates (or truncates) `path` and writes the header row.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::with_capacity(BUFFER_CAPACITY, File::create(&path)?);
        writeln!(out, "{HEADER}")?;
        out.flush()?;
        Ok(Self {
            path,
            out: Mutex::new(out),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(
        &self,
        what: &str,
        flush: bool,
        f: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    ) {
        let mut out = self.out.lock().unwrap();
        let result = f(&mut out).and_then(|()| if flush { out.flush() } else { Ok(()) });
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, what, "failed to write progress log");
        }
    }
}

impl ProgressObserver for CsvProgressObserver {
    fn on_progress(&self, s: &ProgressSnapshot) {
        self.write("progress", false, |out| {
            writeln!(
                out,
                "{},{},{:.2},{:.2},{},{},{},{}",
                s.timestamp.format(TIMESTAMP_FORMAT),
                format_elapsed(s.elapsed_ms),
                s.percent(),
                s.speed_mbps(),
                s.completed_chunks,
                s.total_chunks,
                s.bytes_transferred,
                s.total_bytes,
            )
        });
    }

    fn on_error(&self, err: &TransferError) {
        let message = err.to_string().replace('"', "\"\"");
        self.write("error", true, |out| {
            writeln!(
                out,
                "{},ERROR,\"{message}\"",
                Utc::now().format(TIMESTAMP_FORMAT)
            )
        });
    }

    fn on_complete(&self, m: &DownloadMetrics) {
        self.write("summary", true, |out| {
            writeln!(out, "--- DOWNLOAD SUMMARY ---")?;
            writeln!(out, "Finished: {}", m.finished_at.format(TIMESTAMP_FORMAT))?;
            let status = if m.success {
                "completed"
            } else if m.cancelled {
                "cancelled"
            } else {
                "failed"
            };
            writeln!(out, "Status: {status}")?;
            if let Some(msg) = &m.error_message {
                writeln!(out, "Error: {msg}")?;
            }
            writeln!(out, "Total time: {}", format_elapsed(m.elapsed_ms))?;
            writeln!(out, "Average speed: {:.2} MB/s", m.average_speed_mbps())?;
            writeln!(out, "Transferred: {} bytes", m.bytes_transferred)?;
            writeln!(out, "Chunks completed: {}/{}", m.completed_chunks, m.total_chunks)?;
            writeln!(out, "Retries: {}", m.retry_count)?;
            if let Some(peak) = m.peak_memory_bytes {
                writeln!(out, "Peak memory: {peak} bytes")?;
            }
            if let Some(cpu) = m.average_cpu_percent {
                writeln!(out, "Average CPU: {cpu:.2}%")?;
            }
            if let Some(latency) = m.network_latency_ms {
                writeln!(out, "Network latency: {latency:.2}ms")?;
            }
            if let Some(sum) = &m.checksum {
                writeln!(out, "Checksum: {sum}")?;
            }
            Ok(())
        });
        info!(path = %self.path.display(), "download summary written");
    }
}

/// `HH:MM:SS.mmm`
fn format_elapsed(ms: u64) -> String {
    let secs = ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        ms % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_transferred: 512,
            total_bytes: 1024,
            speed_bytes_per_sec: 2.0 * 1024.0 * 1024.0,
            completed_chunks: 1,
            total_chunks: 2,
            active_workers: 1,
            eta_secs: Some(1.0),
            elapsed_ms: 3_723_004,
            timestamp: Utc::now(),
        }
    }

    fn metrics(success: bool) -> DownloadMetrics {
        let now = Utc::now();
        DownloadMetrics {
            total_bytes: 1024,
            bytes_transferred: 1024,
            completed_chunks: 2,
            total_chunks: 2,
            retry_count: 1,
            elapsed_ms: 1_500,
            average_speed_bytes_per_sec: 682.0,
            peak_memory_bytes: None,
            average_cpu_percent: Some(12.5),
            network_latency_ms: None,
            success,
            cancelled: false,
            error_message: (!success).then(|| "chunk 1 failed".to_string()),
            started_at: now,
            finished_at: now,
            checksum: None,
        }
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(0), "00:00:00.000");
        assert_eq!(format_elapsed(3_723_004), "01:02:03.004");
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let obs = CsvProgressObserver::create(&path).unwrap();

        obs.on_progress(&snapshot());
        obs.on_error(&TransferError::InvalidPath("say \"hi\"".into()));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].ends_with(",01:02:03.004,50.00,2.00,1,2,512,1024"));
        assert!(lines[2].contains(",ERROR,\""));
        assert!(lines[2].contains("\"\"hi\"\""));
    }

    #[test]
    fn progress_rows_reach_disk_with_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let obs = CsvProgressObserver::create(&path).unwrap();

        obs.on_progress(&snapshot());
        obs.on_progress(&snapshot());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);

        obs.on_complete(&metrics(true));
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].ends_with(",1,2,512,1024"));
        assert!(lines[2].ends_with(",1,2,512,1024"));
        assert_eq!(lines[3], "--- DOWNLOAD SUMMARY ---");
        assert!(content.contains("Status: completed"));
    }

    #[test]
    fn summary_block_on_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.csv");
        let obs = CsvProgressObserver::create(&path).unwrap();

        obs.on_complete(&metrics(false));

        let content = std::fs::read_to_string(obs.path()).unwrap();
        assert!(content.contains("--- DOWNLOAD SUMMARY ---"));
        assert!(content.contains("Status: failed"));
        assert!(content.contains("Error: chunk 1 failed"));
        assert!(content.contains("Chunks completed: 2/2"));
        assert!(content.contains("Average CPU: 12.50%"));
        assert!(!content.contains("Peak memory"));
    }

    #[test]
    fn create_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CsvProgressObserver::create(dir.path().join("nope").join("p.csv")).is_err());
    }
}
