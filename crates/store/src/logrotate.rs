// crates/store/src/logrotate.rs
//! Size-bounded rotating log sink for worker and per-job logs.
//!
//! Naming scheme: `<name>.log` is active, `<name>.log.1` is the most recent
//! rotated file, and so on. `max_files` counts every retained file
//! including the active one. A writer always finishes the current line
//! before the size threshold is checked, so no line spans two files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// One rotating write target.
#[derive(Debug)]
pub struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    file: Option<File>,
}

impl RotatingLog {
    /// `path` is the active file (e.g. `.../worker.log`); `max_files >= 1`.
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_files: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            max_files: max_files.max(1),
            file: None,
        }
    }

    /// Append one line (newline added here), then rotate if the active
    /// file now exceeds the size limit.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let file = self.open()?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        let size = file.metadata()?.len();
        if size >= self.max_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    fn open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("file just opened"))
    }

    /// Shift `name.log.k` → `name.log.(k+1)` dropping the oldest, move the
    /// active file to `.1`, and start a fresh active file.
    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;

        // Oldest rotated index that may exist after this rotation is
        // max_files - 1 (active file is one of the retained count).
        let last = self.max_files - 1;
        if last == 0 {
            // Retention of one file: just truncate in place.
            return fs::write(&self.path, b"").map(|_| ());
        }
        let oldest = self.numbered(last);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for k in (1..last).rev() {
            let from = self.numbered(k);
            if from.exists() {
                fs::rename(&from, self.numbered(k + 1))?;
            }
        }
        fs::rename(&self.path, self.numbered(1))?;
        Ok(())
    }

    fn numbered(&self, k: usize) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{k}"));
        self.path.with_file_name(name)
    }

    /// All currently retained files, active first.
    pub fn retained_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if self.path.exists() {
            out.push(self.path.clone());
        }
        for k in 1.. {
            let p = self.numbered(k);
            if !p.exists() {
                break;
            }
            out.push(p);
        }
        out
    }
}

/// Count retained rotated files for a target path (test and ops helper).
pub fn retained_count(path: &Path) -> usize {
    RotatingLog::new(path, u64::MAX, usize::MAX).retained_files().len()
}
