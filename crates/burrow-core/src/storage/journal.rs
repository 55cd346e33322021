use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{DataKey, Sealed};
use crate::error::CoreError;
use crate::fsutil::{restrict_permissions, write_atomic};
use crate::model::{Entity, EntityId, JournalEntry, Operation};

pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// One line of `journal.jsonl`. Sequence, id and operation are in clear text
/// so the log can be scanned and recovered without the key; the snapshot is sealed.
#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    seq: u64,
    entity_id: EntityId,
    op: Operation,
    ts: DateTime<Utc>,
    snapshot: Sealed,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    last_applied_sequence: u64,
    updated_at: DateTime<Utc>,
}

struct Writer {
    file: File,
    /// Bytes known to hold complete, fsynced entries.
    committed_len: u64,
    last_sequence: u64,
    checkpoint: u64,
}

/// Append-only, encrypted log of every local mutation, plus the sync checkpoint.
///
/// Holds an exclusive lock on the log file for its lifetime, so only one
/// process appends at a time.
pub struct ChangeJournal {
    path: PathBuf,
    checkpoint_path: PathBuf,
    key: Arc<DataKey>,
    writer: Mutex<Writer>,
}

impl ChangeJournal {
    /// Open (or create) the journal under `root`, truncating a torn final line
    /// left by an interrupted append.
    pub fn open(root: &Path, key: Arc<DataKey>) -> Result<Self, CoreError> {
        fs::create_dir_all(root)?;
        let path = root.join(JOURNAL_FILE);
        let checkpoint_path = root.join(CHECKPOINT_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        fs2::FileExt::try_lock_exclusive(&file).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("journal is locked by another process ({}): {e}", path.display()),
            )
        })?;
        restrict_permissions(&path)?;

        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let scan = scan_lines(BufReader::new(&mut file))?;
        if scan.committed_len < file_len {
            warn!(
                path = %path.display(),
                torn_bytes = file_len - scan.committed_len,
                "truncating torn tail from journal"
            );
            file.set_len(scan.committed_len)?;
            file.sync_all()?;
        }

        let checkpoint = read_checkpoint(&checkpoint_path)?;
        if checkpoint > scan.last_sequence {
            return Err(CoreError::InvalidCheckpoint {
                requested: checkpoint,
                current: checkpoint,
                highest: scan.last_sequence,
            });
        }

        debug!(
            entries = scan.entries,
            last_sequence = scan.last_sequence,
            checkpoint,
            "opened journal"
        );
        Ok(Self {
            path,
            checkpoint_path,
            key,
            writer: Mutex::new(Writer {
                file,
                committed_len: scan.committed_len,
                last_sequence: scan.last_sequence,
                checkpoint,
            }),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Writer>, CoreError> {
        self.writer
            .lock()
            .map_err(|e| CoreError::Io(std::io::Error::other(format!("journal lock poisoned: {e}"))))
    }

    /// Durably append one mutation and return its sequence number.
    /// On failure nothing is appended: a partial write is cut back off.
    pub fn append(
        &self,
        entity_id: &EntityId,
        operation: Operation,
        snapshot: &Entity,
    ) -> Result<u64, CoreError> {
        if snapshot.id != *entity_id {
            return Err(CoreError::InvalidId(format!(
                "snapshot {} appended under {entity_id}",
                snapshot.id
            )));
        }

        let mut writer = self.writer()?;
        let sequence = writer.last_sequence + 1;
        let line = JournalLine {
            seq: sequence,
            entity_id: entity_id.clone(),
            op: operation,
            ts: Utc::now(),
            snapshot: self
                .key
                .seal(&serde_json::to_vec(snapshot)?, &entry_aad(sequence, entity_id))?,
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        let start = writer.committed_len;
        if let Err(e) = write_durably(&mut writer.file, &bytes) {
            if let Err(rollback) = writer.file.set_len(start).and_then(|()| writer.file.sync_all()) {
                warn!(error = %rollback, "failed to roll back partial journal append");
            }
            return Err(e.into());
        }
        writer.committed_len += bytes.len() as u64;
        writer.last_sequence = sequence;

        debug!(sequence, id = %entity_id, op = operation.as_str(), "journal append");
        Ok(sequence)
    }

    /// Entries with sequence greater than `after`, in order. The iterator only
    /// covers entries committed before this call.
    pub fn read_since(&self, after: u64) -> Result<JournalIter, CoreError> {
        let committed_len = self.writer()?.committed_len;
        let file = File::open(&self.path)?;
        Ok(JournalIter {
            reader: BufReader::new(file.take(committed_len)),
            key: Arc::clone(&self.key),
            after,
            line: 0,
            done: false,
        })
    }

    /// Entries past the sync checkpoint.
    pub fn pending(&self) -> Result<JournalIter, CoreError> {
        let checkpoint = self.last_checkpoint()?;
        self.read_since(checkpoint)
    }

    /// Record that every entry up to `sequence` has been fully applied.
    /// Moving backwards or past the last entry is `InvalidCheckpoint`.
    pub fn checkpoint(&self, sequence: u64) -> Result<(), CoreError> {
        let mut writer = self.writer()?;
        if sequence < writer.checkpoint || sequence > writer.last_sequence {
            return Err(CoreError::InvalidCheckpoint {
                requested: sequence,
                current: writer.checkpoint,
                highest: writer.last_sequence,
            });
        }
        if sequence == writer.checkpoint {
            return Ok(());
        }

        let record = Checkpoint {
            last_applied_sequence: sequence,
            updated_at: Utc::now(),
        };
        write_atomic(&self.checkpoint_path, &serde_json::to_vec_pretty(&record)?)?;
        info!(from = writer.checkpoint, to = sequence, "advanced sync checkpoint");
        writer.checkpoint = sequence;
        Ok(())
    }

    pub fn last_checkpoint(&self) -> Result<u64, CoreError> {
        Ok(self.writer()?.checkpoint)
    }

    pub fn last_sequence(&self) -> Result<u64, CoreError> {
        Ok(self.writer()?.last_sequence)
    }

    pub fn flush(&self) -> Result<(), CoreError> {
        self.writer()?.file.sync_all()?;
        Ok(())
    }

    /// Structural check of a journal file without the key or the lock:
    /// every line parses and sequences are contiguous. A torn tail is
    /// tolerated since the next open repairs it. Returns the entry count.
    pub fn verify(root: &Path) -> Result<u64, CoreError> {
        let path = root.join(JOURNAL_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let scan = scan_lines(BufReader::new(file))?;
        let checkpoint = read_checkpoint(&root.join(CHECKPOINT_FILE))?;
        if checkpoint > scan.last_sequence {
            return Err(CoreError::InvalidCheckpoint {
                requested: checkpoint,
                current: checkpoint,
                highest: scan.last_sequence,
            });
        }
        Ok(scan.entries)
    }
}

impl Drop for ChangeJournal {
    fn drop(&mut self) {
        if let Ok(writer) = self.writer.get_mut() {
            if let Err(e) = writer.file.sync_all() {
                warn!(error = %e, "failed to sync journal on close");
            }
        }
    }
}

fn write_durably(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.sync_data()
}

fn entry_aad(sequence: u64, id: &EntityId) -> Vec<u8> {
    format!("burrow:journal:v1:{sequence}:{}", id.as_str()).into_bytes()
}

fn read_checkpoint(path: &Path) -> Result<u64, CoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let checkpoint: Checkpoint = serde_json::from_slice(&raw).map_err(|e| {
        CoreError::integrity(CHECKPOINT_FILE, format!("unreadable checkpoint: {e}"))
    })?;
    Ok(checkpoint.last_applied_sequence)
}

struct Scan {
    committed_len: u64,
    last_sequence: u64,
    entries: u64,
}

/// Walk the log line by line. A bad final line is a torn tail and is
/// excluded from `committed_len`; a bad line followed by more data, or a
/// sequence gap, is corruption.
fn scan_lines(mut reader: impl BufRead) -> Result<Scan, CoreError> {
    let mut scan = Scan {
        committed_len: 0,
        last_sequence: 0,
        entries: 0,
    };
    let mut pending_error: Option<(usize, String)> = None;
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        line_no += 1;

        if let Some((line, reason)) = pending_error.take() {
            return Err(CoreError::JournalCorrupt { line, reason });
        }
        if buf.last() != Some(&b'\n') {
            pending_error = Some((line_no, "incomplete line".into()));
            continue;
        }

        match serde_json::from_slice::<JournalLine>(&buf) {
            Ok(entry) => {
                let expected = scan.last_sequence + 1;
                if entry.seq != expected {
                    return Err(CoreError::JournalCorrupt {
                        line: line_no,
                        reason: format!("expected sequence {expected}, found {}", entry.seq),
                    });
                }
                scan.last_sequence = entry.seq;
                scan.entries += 1;
                scan.committed_len += read as u64;
            }
            Err(e) => pending_error = Some((line_no, e.to_string())),
        }
    }

    if let Some((line, reason)) = pending_error {
        debug!(line, reason = %reason, "journal has a torn tail");
    }
    Ok(scan)
}

/// Lazy, decrypting reader over committed journal entries.
pub struct JournalIter {
    reader: BufReader<Take<File>>,
    key: Arc<DataKey>,
    after: u64,
    line: usize,
    done: bool,
}

impl JournalIter {
    fn fail(&mut self, err: CoreError) -> Option<Result<JournalEntry, CoreError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for JournalIter {
    type Item = Result<JournalEntry, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        while !self.done {
            buf.clear();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => return self.fail(e.into()),
            }
            self.line += 1;

            let line: JournalLine = match serde_json::from_slice(&buf) {
                Ok(line) => line,
                Err(e) => {
                    let line = self.line;
                    return self.fail(CoreError::JournalCorrupt {
                        line,
                        reason: e.to_string(),
                    });
                }
            };
            if line.seq <= self.after {
                continue;
            }

            let context = format!("journal entry {}", line.seq);
            let snapshot = self
                .key
                .open(&line.snapshot, &entry_aad(line.seq, &line.entity_id), &context)
                .and_then(|plain| {
                    serde_json::from_slice::<Entity>(&plain).map_err(|e| {
                        CoreError::integrity(context.as_str(), format!("invalid snapshot: {e}"))
                    })
                });
            let snapshot = match snapshot {
                Ok(snapshot) if snapshot.id == line.entity_id => snapshot,
                Ok(_) => {
                    return self.fail(CoreError::integrity(
                        context,
                        "snapshot does not match entry id",
                    ))
                }
                Err(e) => return self.fail(e),
            };

            return Some(Ok(JournalEntry {
                sequence: line.seq,
                entity_id: line.entity_id,
                operation: line.op,
                snapshot,
                timestamp: line.ts,
            }));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use tempfile::TempDir;

    fn task(title: &str) -> Entity {
        Entity::new_task(title, None, Priority::Medium, vec![])
    }

    fn collect(journal: &ChangeJournal, after: u64) -> Vec<JournalEntry> {
        journal
            .read_since(after)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let tmp = TempDir::new().unwrap();
        let journal = ChangeJournal::open(tmp.path(), Arc::new(DataKey::generate())).unwrap();

        let mut t = task("first");
        assert_eq!(journal.append(&t.id, Operation::Create, &t).unwrap(), 1);
        t.touch();
        assert_eq!(journal.append(&t.id, Operation::Update, &t).unwrap(), 2);
        assert_eq!(journal.append(&t.id, Operation::Delete, &t).unwrap(), 3);

        let entries = collect(&journal, 0);
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(entries[1].snapshot, t);
        assert_eq!(entries[2].operation, Operation::Delete);

        let tail = collect(&journal, 2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 3);
        assert!(collect(&journal, 3).is_empty());
    }

    #[test]
    fn test_snapshots_are_encrypted_on_disk() {
        let tmp = TempDir::new().unwrap();
        let journal = ChangeJournal::open(tmp.path(), Arc::new(DataKey::generate())).unwrap();
        let t = task("quarterly layoffs plan");
        journal.append(&t.id, Operation::Create, &t).unwrap();

        let raw = fs::read_to_string(tmp.path().join(JOURNAL_FILE)).unwrap();
        assert!(!raw.contains("layoffs"));
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(DataKey::generate());
        let t = task("a");
        {
            let journal = ChangeJournal::open(tmp.path(), Arc::clone(&key)).unwrap();
            journal.append(&t.id, Operation::Create, &t).unwrap();
            journal.append(&t.id, Operation::Update, &t).unwrap();
        }
        let journal = ChangeJournal::open(tmp.path(), key).unwrap();
        assert_eq!(journal.last_sequence().unwrap(), 2);
        assert_eq!(journal.append(&t.id, Operation::Update, &t).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(DataKey::generate());
        let t = task("a");
        {
            let journal = ChangeJournal::open(tmp.path(), Arc::clone(&key)).unwrap();
            journal.append(&t.id, Operation::Create, &t).unwrap();
        }
        let path = tmp.path().join(JOURNAL_FILE);
        let intact = fs::read(&path).unwrap();
        let mut torn = intact.clone();
        torn.extend_from_slice(br#"{"seq":2,"entity_id":"ab"#);
        fs::write(&path, &torn).unwrap();

        // Structural verify tolerates the torn tail.
        assert_eq!(ChangeJournal::verify(tmp.path()).unwrap(), 1);

        let journal = ChangeJournal::open(tmp.path(), key).unwrap();
        assert_eq!(fs::read(&path).unwrap(), intact);
        assert_eq!(journal.last_sequence().unwrap(), 1);
        assert_eq!(journal.append(&t.id, Operation::Update, &t).unwrap(), 2);
        assert_eq!(collect(&journal, 0).len(), 2);
    }

    #[test]
    fn test_mid_file_corruption_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(DataKey::generate());
        let t = task("a");
        {
            let journal = ChangeJournal::open(tmp.path(), Arc::clone(&key)).unwrap();
            for _ in 0..3 {
                journal.append(&t.id, Operation::Update, &t).unwrap();
            }
        }
        let path = tmp.path().join(JOURNAL_FILE);
        let content = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = content.lines().collect();
        lines[1] = "not json";
        fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();

        let err = ChangeJournal::open(tmp.path(), key).err().unwrap();
        assert!(matches!(err, CoreError::JournalCorrupt { line: 2, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sequence_gap_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(DataKey::generate());
        let t = task("a");
        {
            let journal = ChangeJournal::open(tmp.path(), Arc::clone(&key)).unwrap();
            for _ in 0..3 {
                journal.append(&t.id, Operation::Update, &t).unwrap();
            }
        }
        let path = tmp.path().join(JOURNAL_FILE);
        let content = fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content
            .lines()
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, l)| l)
            .collect();
        fs::write(&path, format!("{}\n", kept.join("\n"))).unwrap();

        assert!(matches!(
            ChangeJournal::open(tmp.path(), key),
            Err(CoreError::JournalCorrupt { line: 2, .. })
        ));
    }

    #[test]
    fn test_tampered_snapshot_fails_on_read() {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(DataKey::generate());
        let a = task("a");
        let b = task("b");
        {
            let journal = ChangeJournal::open(tmp.path(), Arc::clone(&key)).unwrap();
            journal.append(&a.id, Operation::Create, &a).unwrap();
            journal.append(&b.id, Operation::Create, &b).unwrap();
        }
        // Swap the sealed snapshots between the two lines: each still
        // parses, but the associated data no longer matches.
        let path = tmp.path().join(JOURNAL_FILE);
        let content = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let first = lines[0]["snapshot"].clone();
        lines[0]["snapshot"] = lines[1]["snapshot"].clone();
        lines[1]["snapshot"] = first;
        let rewritten: Vec<String> = lines.iter().map(|v| v.to_string()).collect();
        fs::write(&path, format!("{}\n", rewritten.join("\n"))).unwrap();

        let journal = ChangeJournal::open(tmp.path(), key).unwrap();
        let mut iter = journal.read_since(0).unwrap();
        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::IntegrityViolation { .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_read_since_excludes_later_appends() {
        let tmp = TempDir::new().unwrap();
        let journal = ChangeJournal::open(tmp.path(), Arc::new(DataKey::generate())).unwrap();
        let t = task("a");
        journal.append(&t.id, Operation::Create, &t).unwrap();

        let iter = journal.read_since(0).unwrap();
        journal.append(&t.id, Operation::Update, &t).unwrap();
        assert_eq!(iter.count(), 1);
    }

    #[test]
    fn test_checkpoint_bounds() {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(DataKey::generate());
        let t = task("a");
        {
            let journal = ChangeJournal::open(tmp.path(), Arc::clone(&key)).unwrap();
            for _ in 0..3 {
                journal.append(&t.id, Operation::Update, &t).unwrap();
            }
            assert_eq!(journal.last_checkpoint().unwrap(), 0);
            journal.checkpoint(2).unwrap();
            journal.checkpoint(2).unwrap();

            assert!(matches!(
                journal.checkpoint(1),
                Err(CoreError::InvalidCheckpoint {
                    requested: 1,
                    current: 2,
                    highest: 3
                })
            ));
            assert!(matches!(
                journal.checkpoint(4),
                Err(CoreError::InvalidCheckpoint { requested: 4, .. })
            ));
            assert_eq!(journal.pending().unwrap().count(), 1);
        }
        let journal = ChangeJournal::open(tmp.path(), key).unwrap();
        assert_eq!(journal.last_checkpoint().unwrap(), 2);
    }

    #[test]
    fn test_checkpoint_beyond_log_is_rejected_on_open() {
        let tmp = TempDir::new().unwrap();
        let record = Checkpoint {
            last_applied_sequence: 9,
            updated_at: Utc::now(),
        };
        fs::write(
            tmp.path().join(CHECKPOINT_FILE),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            ChangeJournal::open(tmp.path(), Arc::new(DataKey::generate())),
            Err(CoreError::InvalidCheckpoint { requested: 9, .. })
        ));
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(DataKey::generate());
        let _held = ChangeJournal::open(tmp.path(), Arc::clone(&key)).unwrap();
        assert!(matches!(
            ChangeJournal::open(tmp.path(), key),
            Err(CoreError::Io(_))
        ));
    }

    #[test]
    fn test_mismatched_snapshot_id_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let journal = ChangeJournal::open(tmp.path(), Arc::new(DataKey::generate())).unwrap();
        let t = task("a");
        let other = EntityId::new();
        assert!(journal.append(&other, Operation::Create, &t).is_err());
        assert_eq!(journal.last_sequence().unwrap(), 0);
    }
}
