use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::{AuditAction, AuditEntry, GENESIS_HASH};
use crate::errors::OrchestrationError;
use crate::util::FileLock;

const TAIL_CHUNK: u64 = 4096;

/// The JSON Lines audit log.
///
/// Appends are totally ordered: one writer at a time inside the process
/// (mutex) and across processes (advisory lock file).
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    lock_path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: &Path, lock_path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry chained onto the current head.
    ///
    /// Fails with `AuditUnavailable` when the log cannot be written; callers
    /// must then treat the triggering operation as not having happened.
    pub fn append(
        &self,
        actor: &str,
        action: AuditAction,
        task_id: Option<&str>,
        result: &str,
    ) -> Result<AuditEntry, OrchestrationError> {
        self.append_inner(actor, action, task_id, result)
            .map_err(|source| OrchestrationError::AuditUnavailable { source })
    }

    fn append_inner(
        &self,
        actor: &str,
        action: AuditAction,
        task_id: Option<&str>,
        result: &str,
    ) -> Result<AuditEntry> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = FileLock::acquire(&self.lock_path)?;

        let head = self.head()?;
        let (seq, prev_hash) = match &head {
            Some(entry) => (entry.seq + 1, entry.hash.as_str()),
            None => (1, GENESIS_HASH),
        };
        let entry = AuditEntry::new(seq, actor, action, task_id, result, prev_hash);

        let mut line = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("Failed to fsync {}", self.path.display()))?;

        debug!(seq = entry.seq, action = %entry.action, task_id = ?entry.task_id, "audit entry appended");
        Ok(entry)
    }

    /// The last entry, if any.
    pub fn head(&self) -> Result<Option<AuditEntry>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", self.path.display()));
            }
        };
        let Some(line) = read_last_line(&mut file)? else {
            return Ok(None);
        };
        let entry = serde_json::from_str(&line).with_context(|| {
            format!(
                "Last line of {} is not a valid audit entry; run `weave audit verify`",
                self.path.display()
            )
        })?;
        Ok(Some(entry))
    }

    /// Walk the chain from entry 1. Returns the 1-based position of the first
    /// entry that does not verify, or `None` when the chain is intact.
    pub fn verify(&self) -> Result<Option<u64>> {
        let Some(lines) = self.lines()? else {
            return Ok(None);
        };

        let mut expected_prev = GENESIS_HASH.to_string();
        let mut position = 0u64;
        for line in lines {
            let line = line.with_context(|| format!("Failed to read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            position += 1;
            let entry: AuditEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(_) => return Ok(Some(position)),
            };
            if entry.seq != position || entry.prev_hash != expected_prev || !entry.is_intact() {
                return Ok(Some(position));
            }
            expected_prev = entry.hash;
        }
        Ok(None)
    }

    /// Lazy forward iterator over entries, optionally only those for `task_id`.
    /// Each call starts again from the beginning of the file.
    pub fn query(&self, task_id: Option<&str>) -> Result<AuditQuery> {
        Ok(AuditQuery {
            lines: self.lines()?,
            task_id: task_id.map(str::to_string),
        })
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize, task_id: Option<&str>) -> Result<Vec<AuditEntry>> {
        let mut window = VecDeque::with_capacity(n);
        for entry in self.query(task_id)? {
            if n == 0 {
                break;
            }
            if window.len() == n {
                window.pop_front();
            }
            window.push_back(entry?);
        }
        Ok(window.into_iter().collect())
    }

    fn lines(&self) -> Result<Option<Lines<BufReader<File>>>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(BufReader::new(file).lines())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to open {}", self.path.display())),
        }
    }

    /// Size of the log file in bytes (0 when absent).
    pub fn len_bytes(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Iterator returned by [`AuditLog::query`].
pub struct AuditQuery {
    lines: Option<Lines<BufReader<File>>>,
    task_id: Option<String>,
}

impl Iterator for AuditQuery {
    type Item = Result<AuditEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e).context("Failed to read audit log")),
            };
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e).context("Malformed audit entry")),
            };
            match &self.task_id {
                Some(task) if entry.task_id.as_deref() != Some(task.as_str()) => continue,
                _ => return Some(Ok(entry)),
            }
        }
    }
}

/// Read the last non-empty line by scanning backwards from the end.
fn read_last_line(file: &mut File) -> Result<Option<String>> {
    let len = file.metadata()?.len();
    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        let end = buf.iter().rposition(|b| !b.is_ascii_whitespace());
        if let Some(end) = end
            && let Some(start) = buf[..end].iter().rposition(|&b| b == b'\n')
        {
            return Ok(Some(String::from_utf8_lossy(&buf[start + 1..=end]).into_owned()));
        }
        if pos == 0 {
            return Ok(end.map(|end| String::from_utf8_lossy(&buf[..=end]).into_owned()));
        }
    }
}
