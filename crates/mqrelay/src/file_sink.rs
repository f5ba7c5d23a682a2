// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Append-only CSV sink.
//!
//! One line per forwarded message: `timestamp,instance,topic,payload\n`.
//! Each append opens, writes a single formatted line, and closes the file
//! under a per-sink mutex, so concurrent dispatch never interleaves lines.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Append-only file sink. Cheap to clone; clones share the write lock.
#[derive(Clone)]
pub struct FileSink {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open-append-close probe used at bootstrap to fail early on an
    /// unwritable location.
    pub fn probe(&self) -> io::Result<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Append one record. The line is formatted first and written with a
    /// single call so a record is never split across interleaved writes.
    pub fn append(
        &self,
        timestamp: &str,
        instance: &str,
        topic: &str,
        payload: &str,
    ) -> io::Result<()> {
        let line = format!("{},{},{},{}\n", timestamp, instance, topic, payload);
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_append_writes_one_csv_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileSink::new(dir.path().join("archive.csv"));

        sink.append("2026-02-07T10:00:00+00:00", "home", "/home/sensor/temp", "21.5")
            .expect("append");

        let content = std::fs::read_to_string(sink.path()).expect("read");
        assert_eq!(
            content,
            "2026-02-07T10:00:00+00:00,home,/home/sensor/temp,21.5\n"
        );
    }

    #[test]
    fn test_appends_accumulate_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileSink::new(dir.path().join("archive.csv"));

        sink.append("t1", "a", "/x", "1").expect("append");
        sink.append("t2", "a", "/x", "2").expect("append");

        let content = std::fs::read_to_string(sink.path()).expect("read");
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines, vec!["t1,a,/x,1", "t2,a,/x,2"]);
    }

    #[test]
    fn test_concurrent_appends_keep_lines_whole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileSink::new(dir.path().join("archive.csv"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for j in 0..25 {
                        sink.append("ts", "worker", "/t", &format!("{}-{}", i, j))
                            .expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let content = std::fs::read_to_string(sink.path()).expect("read");
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 200);
        for line in lines {
            assert_eq!(line.split(',').count(), 4);
        }
    }

    #[test]
    fn test_probe_rejects_unwritable_location() {
        let sink = FileSink::new("/nonexistent-dir/archive.csv");
        assert!(sink.probe().is_err());
    }
}
