//! Usage metrics, access logging, and metrics persistence.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::labels::{DefectClass, NUM_CLASSES};

/// Maximum number of rotated access log files to keep.
const MAX_ACCESS_LOG_ROTATIONS: usize = 5;

/// Interval in seconds between metrics persistence to disk.
pub const METRICS_PERSIST_INTERVAL_SECS: u64 = 60;

/// A completed detection, as recorded in metrics and the access log.
pub struct RecordEvent<'a> {
    pub endpoint: &'a str,
    pub filename: &'a str,
    pub class: DefectClass,
    pub confidence: f64,
    pub processing_time_ms: u64,
}

pub struct UsageMetrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,

    /// Predictions per class, indexed by [`DefectClass::index`].
    pub per_class: [AtomicU64; NUM_CLASSES],

    pub ep_detect: AtomicU64,
    pub ep_batch_detect: AtomicU64,
    pub ep_preview: AtomicU64,
    pub ep_stats: AtomicU64,

    pub access_log: std::sync::Mutex<Option<File>>,
    access_log_path: String,
    access_log_bytes: AtomicU64,
    max_access_log_bytes: u64,
    metrics_path: String,
}

impl UsageMetrics {
    pub fn new(access_log_path: &str, max_access_log_bytes: u64, metrics_dir: &Path) -> Self {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(access_log_path)
            .ok();
        if file.is_none() {
            warn!(path = access_log_path, "could not open access log");
        }
        let current_size = std::fs::metadata(access_log_path)
            .map(|m| m.len())
            .unwrap_or(0);

        let metrics_path = metrics_dir.join("metrics.json");

        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            per_class: std::array::from_fn(|_| AtomicU64::new(0)),
            ep_detect: AtomicU64::new(0),
            ep_batch_detect: AtomicU64::new(0),
            ep_preview: AtomicU64::new(0),
            ep_stats: AtomicU64::new(0),
            access_log: std::sync::Mutex::new(file),
            access_log_path: access_log_path.to_string(),
            access_log_bytes: AtomicU64::new(current_size),
            max_access_log_bytes,
            metrics_path: metrics_path.to_string_lossy().to_string(),
        }
    }

    pub fn record(&self, event: &RecordEvent<'_>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.per_class[event.class.index()].fetch_add(1, Ordering::Relaxed);

        self.write_access_log(serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "endpoint": event.endpoint,
            "filename": event.filename,
            "defect_type": event.class.as_str(),
            "confidence": event.confidence,
            "processing_time_ms": event.processing_time_ms,
        }));
    }

    /// Count a failed request and note why in the access log.
    pub fn record_error(&self, endpoint: &str, kind: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);

        self.write_access_log(serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "endpoint": endpoint,
            "error": kind,
        }));
    }

    pub fn class_count(&self, class: DefectClass) -> u64 {
        self.per_class[class.index()].load(Ordering::Relaxed)
    }

    fn write_access_log(&self, entry: serde_json::Value) {
        let Ok(mut guard) = self.access_log.try_lock() else {
            return;
        };
        let Some(ref mut file) = *guard else {
            return;
        };

        let mut line = entry.to_string();
        line.push('\n');
        let line_len = line.len() as u64;
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "failed to write access log entry");
        }
        let new_size = self.access_log_bytes.fetch_add(line_len, Ordering::Relaxed) + line_len;

        // Rotate if over size limit (0 = no limit)
        if self.max_access_log_bytes > 0 && new_size >= self.max_access_log_bytes {
            for i in (1..MAX_ACCESS_LOG_ROTATIONS).rev() {
                let from = format!("{}.{}", self.access_log_path, i);
                let to = format!("{}.{}", self.access_log_path, i + 1);
                if Path::new(&from).exists() {
                    if let Err(e) = std::fs::rename(&from, &to) {
                        warn!(from = %from, to = %to, error = %e, "log rotation rename failed");
                    }
                }
            }
            let rotated = format!("{}.1", self.access_log_path);
            if let Err(e) = std::fs::rename(&self.access_log_path, &rotated) {
                warn!(from = %self.access_log_path, to = %rotated, error = %e, "log rotation rename failed");
            }
            if let Ok(new_file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.access_log_path)
            {
                *file = new_file;
                self.access_log_bytes.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Write the current counters to `metrics.json` for outside inspection.
    /// The snapshot is not read back; counters start at zero on each run.
    pub fn persist_to_disk(&self) {
        let classes: serde_json::Map<String, serde_json::Value> = DefectClass::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), self.class_count(*c).into()))
            .collect();
        let snapshot = serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
            "classifications": classes,
            "ep_detect": self.ep_detect.load(Ordering::Relaxed),
            "ep_batch_detect": self.ep_batch_detect.load(Ordering::Relaxed),
            "ep_preview": self.ep_preview.load(Ordering::Relaxed),
            "ep_stats": self.ep_stats.load(Ordering::Relaxed),
        });
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.metrics_path, &data) {
                    warn!(path = %self.metrics_path, error = %e, "failed to persist metrics");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize metrics snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(class: DefectClass) -> RecordEvent<'static> {
        RecordEvent {
            endpoint: "detect",
            filename: "crack_01.png",
            class,
            confidence: 0.8,
            processing_time_ms: 900,
        }
    }

    #[test]
    fn test_counters_and_access_log() {
        let tmpdir = tempfile::tempdir().expect("failed to create temp dir");
        let log_path = tmpdir.path().join("access.jsonl");
        let metrics = UsageMetrics::new(log_path.to_str().unwrap(), 0, tmpdir.path());

        metrics.record(&event(DefectClass::Crazing));
        metrics.record(&event(DefectClass::Crazing));
        metrics.record_error("detect", "unsupported_format");

        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.total_errors.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.class_count(DefectClass::Crazing), 2);
        assert_eq!(metrics.class_count(DefectClass::Pitted), 0);

        let log = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<serde_json::Value> = log
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["defect_type"], "Crazing (裂纹)");
        assert_eq!(lines[2]["error"], "unsupported_format");
    }

    #[test]
    fn test_access_log_rotates_at_size_limit() {
        let tmpdir = tempfile::tempdir().expect("failed to create temp dir");
        let log_path = tmpdir.path().join("access.jsonl");
        let metrics = UsageMetrics::new(log_path.to_str().unwrap(), 64, tmpdir.path());

        metrics.record(&event(DefectClass::Scratches));
        metrics.record(&event(DefectClass::Scratches));

        let rotated = tmpdir.path().join("access.jsonl.1");
        assert!(rotated.exists(), "first rotation should exist");
    }

    #[test]
    fn test_persist_to_disk_writes_snapshot() {
        let tmpdir = tempfile::tempdir().expect("failed to create temp dir");
        let metrics = UsageMetrics::new("/dev/null", 0, tmpdir.path());
        metrics.record(&event(DefectClass::Inclusion));
        metrics.persist_to_disk();

        let raw = std::fs::read(tmpdir.path().join("metrics.json")).unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(snapshot["total_requests"], 1);
        assert_eq!(snapshot["classifications"]["Inclusion (夹杂)"], 1);

        // A new run starts from zero even with a snapshot on disk.
        let restarted = UsageMetrics::new("/dev/null", 0, tmpdir.path());
        assert_eq!(restarted.total_requests.load(Ordering::Relaxed), 0);
        assert_eq!(restarted.class_count(DefectClass::Inclusion), 0);
    }
}
