//! Transactional Rollback Log: append-only Operation Record journal plus the
//! per-kind undo semantics needed to reverse a committed transaction.
//!
//! Persists one directory per transaction (JSON metadata plus an
//! append-only ndjson operation journal and a backups/ folder for
//! pre-images), matching the on-disk layout `loader`/`telemetry` use
//! elsewhere in this crate.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
    PartiallyRolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    WriteFile { path: String, pre_image_backup: Option<String> },
    CreateFile { path: String },
    DeleteFile { path: String, pre_image_backup: Option<String> },
    CopyFile { source: String, destination: String },
    MoveFile { source: String, destination: String },
    CreateDirectory { path: String },
    ExecuteCommand { command: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub kind: OperationKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub id: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
}

/// One open transaction, backed by a directory on disk holding
/// `transaction.json`, `operations.ndjson`, and a `backups/` subdirectory.
pub struct Transaction {
    meta: TransactionMeta,
    dir: PathBuf,
    records: Vec<OperationRecord>,
}

impl Transaction {
    /// Opens a new transaction under `state_dir`, creating
    /// `<timestamp>-<short-id>/`.
    pub fn open(state_dir: impl AsRef<Path>, description: impl Into<String>) -> anyhow::Result<Self> {
        let id = Uuid::new_v4().to_string();
        let short_id = &id[..8];
        let start = Utc::now();
        let dir_name = format!("{}-{}", start.format("%Y%m%dT%H%M%SZ"), short_id);
        let dir = state_dir.as_ref().join(dir_name);
        fs::create_dir_all(dir.join("backups"))?;

        let meta = TransactionMeta {
            id,
            description: description.into(),
            start,
            end: None,
            status: TransactionStatus::Open,
        };
        let txn = Self {
            meta,
            dir,
            records: Vec::new(),
        };
        txn.persist_meta()?;
        Ok(txn)
    }

    fn persist_meta(&self) -> anyhow::Result<()> {
        fs::write(self.dir.join("transaction.json"), serde_json::to_string_pretty(&self.meta)?)?;
        Ok(())
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.dir.join("backups")
    }

    /// Stores `content` as the pre-image for `op_id`, named
    /// `<op-id>.<original-basename>`, returning its path.
    pub fn store_pre_image(&self, op_id: &str, original_path: &Path, content: &[u8]) -> anyhow::Result<String> {
        let basename = original_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "file".to_string());
        let backup_path = self.backups_dir().join(format!("{op_id}.{basename}"));
        fs::write(&backup_path, content)?;
        Ok(backup_path.to_string_lossy().to_string())
    }

    /// Appends an Operation Record in apply order. Append-only: the ndjson
    /// file is never rewritten in place.
    pub fn append(&mut self, kind: OperationKind) -> anyhow::Result<String> {
        let record = OperationRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
        };
        let line = serde_json::to_string(&record)?;
        use std::io::Write;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(self.dir.join("operations.ndjson"))?;
        writeln!(file, "{line}")?;
        let id = record.id.clone();
        self.records.push(record);
        Ok(id)
    }

    pub fn commit(&mut self) -> anyhow::Result<()> {
        self.meta.status = TransactionStatus::Committed;
        self.meta.end = Some(Utc::now());
        self.persist_meta()
    }

    /// Reverses the transaction's operations in reverse order. A failed
    /// reverse is logged but does not abort the remaining records; returns
    /// the list of per-record failure descriptions.
    pub fn rollback(&mut self) -> anyhow::Result<Vec<String>> {
        let mut failures = Vec::new();
        for record in self.records.iter().rev() {
            if let Err(e) = undo(&record.kind) {
                failures.push(format!("{}: {e}", record.id));
            }
        }
        self.meta.status = if failures.is_empty() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::PartiallyRolledBack
        };
        self.meta.end = Some(Utc::now());
        self.persist_meta()?;
        Ok(failures)
    }

    pub fn meta(&self) -> &TransactionMeta {
        &self.meta
    }

    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    pub fn load(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta: TransactionMeta = serde_json::from_str(&fs::read_to_string(dir.join("transaction.json"))?)?;
        let records = Self::load_records(&dir)?;
        Ok(Self { meta, dir, records })
    }

    fn load_records(dir: &Path) -> anyhow::Result<Vec<OperationRecord>> {
        let ops_path = dir.join("operations.ndjson");
        if !ops_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(ops_path)?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(anyhow::Error::from))
            .collect()
    }
}

/// Reverses a single Operation Record, per its kind's undo semantics.
fn undo(kind: &OperationKind) -> anyhow::Result<()> {
    match kind {
        OperationKind::CreateFile { path } => {
            fs::remove_file(path)?;
            Ok(())
        }
        OperationKind::CreateDirectory { path } => {
            let dir = Path::new(path);
            if dir.read_dir().map(|mut it| it.next().is_some()).unwrap_or(false) {
                anyhow::bail!("refusing to delete non-empty directory '{path}'");
            }
            fs::remove_dir(dir)?;
            Ok(())
        }
        OperationKind::DeleteFile { path, pre_image_backup } => match pre_image_backup {
            Some(backup) => {
                fs::copy(backup, path)?;
                Ok(())
            }
            None => anyhow::bail!("no pre-image recorded for deleted file '{path}'; unrecoverable"),
        },
        OperationKind::WriteFile { path, pre_image_backup } => match pre_image_backup {
            Some(backup) => {
                fs::copy(backup, path)?;
                Ok(())
            }
            None => {
                fs::remove_file(path)?;
                Ok(())
            }
        },
        OperationKind::CopyFile { destination, .. } => {
            fs::remove_file(destination)?;
            Ok(())
        }
        OperationKind::MoveFile { source, destination } => {
            fs::rename(destination, source)?;
            Ok(())
        }
        OperationKind::ExecuteCommand { .. } => Ok(()),
    }
}

/// Loads the full `Transaction` (meta plus every Operation Record) for the
/// first transaction directory under `state_dir` whose id starts with
/// `id_prefix`.
pub fn load_by_prefix(state_dir: impl AsRef<Path>, id_prefix: &str) -> anyhow::Result<Option<Transaction>> {
    let dir = state_dir.as_ref();
    if !dir.exists() {
        return Ok(None);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta_path = entry.path().join("transaction.json");
        if !meta_path.exists() {
            continue;
        }
        let meta: TransactionMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
        if meta.id.starts_with(id_prefix) {
            return Ok(Some(Transaction::load(entry.path())?));
        }
    }
    Ok(None)
}

/// Lists transaction directories under `state_dir`, most recent first.
pub fn list_transactions(state_dir: impl AsRef<Path>) -> anyhow::Result<Vec<TransactionMeta>> {
    let mut metas = Vec::new();
    let dir = state_dir.as_ref();
    if !dir.exists() {
        return Ok(metas);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta_path = entry.path().join("transaction.json");
        if meta_path.exists() {
            let meta: TransactionMeta = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
            metas.push(meta);
        }
    }
    metas.sort_by(|a, b| b.start.cmp(&a.start));
    Ok(metas)
}

pub fn find_operation(state_dir: impl AsRef<Path>, op_id: &str) -> anyhow::Result<Option<(TransactionMeta, OperationRecord)>> {
    let dir = state_dir.as_ref();
    if !dir.exists() {
        return Ok(None);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let records = Transaction::load_records(&entry.path()).unwrap_or_default();
        if let Some(record) = records.into_iter().find(|r| r.id == op_id) {
            let meta: TransactionMeta = serde_json::from_str(&fs::read_to_string(entry.path().join("transaction.json"))?)?;
            return Ok(Some((meta, record)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_file_undo_removes_path() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut txn = Transaction::open(&state_dir, "test").unwrap();

        let file_path = dir.path().join("created.txt");
        fs::write(&file_path, b"hello").unwrap();
        txn.append(OperationKind::CreateFile {
            path: file_path.to_string_lossy().to_string(),
        })
        .unwrap();
        txn.commit().unwrap();

        let failures = txn.rollback().unwrap();
        assert!(failures.is_empty());
        assert!(!file_path.exists());
    }

    #[test]
    fn write_file_undo_restores_pre_image() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut txn = Transaction::open(&state_dir, "test").unwrap();

        let file_path = dir.path().join("data.txt");
        fs::write(&file_path, b"original").unwrap();
        let op_id = Uuid::new_v4().to_string();
        let backup = txn.store_pre_image(&op_id, &file_path, b"original").unwrap();
        fs::write(&file_path, b"modified").unwrap();
        txn.append(OperationKind::WriteFile {
            path: file_path.to_string_lossy().to_string(),
            pre_image_backup: Some(backup),
        })
        .unwrap();
        txn.commit().unwrap();

        txn.rollback().unwrap();
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "original");
    }

    #[test]
    fn delete_file_without_pre_image_is_reported_as_failure() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut txn = Transaction::open(&state_dir, "test").unwrap();

        txn.append(OperationKind::DeleteFile {
            path: dir.path().join("gone.txt").to_string_lossy().to_string(),
            pre_image_backup: None,
        })
        .unwrap();
        txn.commit().unwrap();

        let failures = txn.rollback().unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn rollback_continues_past_a_failed_record() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut txn = Transaction::open(&state_dir, "test").unwrap();

        txn.append(OperationKind::DeleteFile {
            path: "/nonexistent/unrecoverable".to_string(),
            pre_image_backup: None,
        })
        .unwrap();
        let file_path = dir.path().join("ok.txt");
        fs::write(&file_path, b"x").unwrap();
        txn.append(OperationKind::CreateFile {
            path: file_path.to_string_lossy().to_string(),
        })
        .unwrap();
        txn.commit().unwrap();

        let failures = txn.rollback().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(!file_path.exists());
    }

    #[test]
    fn list_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut txn = Transaction::open(&state_dir, "round trip").unwrap();
        txn.append(OperationKind::ExecuteCommand { command: "echo hi".into() }).unwrap();
        txn.commit().unwrap();

        let listed = list_transactions(&state_dir).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "round trip");
    }

    #[test]
    fn load_by_prefix_finds_records() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut txn = Transaction::open(&state_dir, "prefix lookup").unwrap();
        txn.append(OperationKind::ExecuteCommand { command: "echo hi".into() }).unwrap();
        txn.commit().unwrap();
        let full_id = txn.meta().id.clone();

        let loaded = load_by_prefix(&state_dir, &full_id[..8]).unwrap().expect("transaction found");
        assert_eq!(loaded.meta().id, full_id);
        assert_eq!(loaded.records().len(), 1);
    }
}
