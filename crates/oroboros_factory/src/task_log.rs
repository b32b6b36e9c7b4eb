//! # Task Log
//!
//! **Durable Task Store**
//!
//! Every insert and update of a task is appended as a full copy of the task
//! and synced before the call returns. Reopening replays the file; the last
//! copy of each task wins. A reservation made for a task is therefore never
//! left without its owner after a restart.
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "OTSK"]
//! [4 bytes: version]
//! [8 bytes: reserved]
//!
//! Entry format:
//! [8 bytes: sequence number]
//! [1 byte: record type (INSERT/UPDATE)]
//! [4 bytes: payload length]
//! [N bytes: payload (task as JSON)]
//! [4 bytes: CRC32 of above]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use oroboros_economy::UserId;
use parking_lot::{Mutex, RwLock};

use crate::error::{FactoryError, FactoryResult};
use crate::store::{Tables, TaskStore};
use crate::task::{ProductionTask, TaskId, TaskStatus};

const LOG_MAGIC: &[u8; 4] = b"OTSK";
const LOG_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
/// Bytes before the payload: seq + type + length.
const HEAD_LEN: usize = 8 + 1 + 4;
const RECORD_OVERHEAD: u64 = HEAD_LEN as u64 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Insert = 1,
    Update = 2,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            _ => None,
        }
    }
}

fn storage(what: &str, e: impl std::fmt::Display) -> FactoryError {
    FactoryError::Storage(format!("task log {what}: {e}"))
}

/// Task store backed by an append-only file.
pub struct LogTaskStore {
    path: PathBuf,
    next_seq: AtomicU64,
    tables: RwLock<Tables>,
    file: Mutex<BufWriter<File>>,
}

impl LogTaskStore {
    /// Opens or creates the log and replays it.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the file cannot be opened, has a foreign header
    /// or holds an undecodable task.
    pub fn open(path: impl AsRef<Path>) -> FactoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| storage("directory", e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| storage("open", e))?;
        let len = file.metadata().map_err(|e| storage("metadata", e))?.len();

        let mut writer = BufWriter::new(file);
        if len == 0 {
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            header.extend_from_slice(LOG_MAGIC);
            header.extend_from_slice(&LOG_VERSION.to_le_bytes());
            header.extend_from_slice(&0u64.to_le_bytes());
            writer
                .write_all(&header)
                .and_then(|()| writer.flush())
                .map_err(|e| storage("header", e))?;
        }

        let (tables, next_seq, valid_len) = Self::recover(&path)?;
        if valid_len < len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len = len,
                "task log tail was torn, truncating"
            );
            writer
                .get_ref()
                .set_len(valid_len)
                .map_err(|e| storage("truncate", e))?;
        }

        tracing::info!(path = %path.display(), tasks = tables.len(), "task log recovered");

        Ok(Self {
            path,
            next_seq: AtomicU64::new(next_seq),
            tables: RwLock::new(tables),
            file: Mutex::new(writer),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record_type: RecordType, task: &ProductionTask) -> FactoryResult<()> {
        let payload = serde_json::to_vec(task).map_err(|e| storage("encode", e))?;
        let payload_len = u32::try_from(payload.len()).map_err(|e| storage("encode", e))?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let mut frame = Vec::with_capacity(RECORD_OVERHEAD as usize + payload.len());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.push(record_type as u8);
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let mut file = self.file.lock();
        file.write_all(&frame)
            .and_then(|()| file.flush())
            .and_then(|()| file.get_ref().sync_data())
            .map_err(|e| storage("write", e))
    }

    fn recover(path: &Path) -> FactoryResult<(Tables, u64, u64)> {
        let file = File::open(path).map_err(|e| storage("open", e))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut header)
            .map_err(|e| storage("header", e))?;
        if &header[0..4] != LOG_MAGIC {
            return Err(FactoryError::Storage("invalid task log magic".to_string()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != LOG_VERSION {
            return Err(FactoryError::Storage(format!("unsupported task log version: {version}")));
        }

        let mut tables = Tables::default();
        let mut valid_len = HEADER_LEN;
        let mut next_seq = 0u64;
        while let Some((seq, record_type, payload)) = Self::read_record(&mut reader) {
            let task: ProductionTask = serde_json::from_slice(&payload)
                .map_err(|e| FactoryError::Storage(format!("undecodable task at seq {seq}: {e}")))?;
            if record_type == RecordType::Update && tables.get(&task.id).is_none() {
                tracing::warn!(task_id = %task.id, seq, "task log update without insert");
            }
            tables.put(task);
            valid_len += RECORD_OVERHEAD + payload.len() as u64;
            next_seq = next_seq.max(seq + 1);
        }
        Ok((tables, next_seq, valid_len))
    }

    /// Reads one record; `None` at end of file or at the first damaged record.
    fn read_record(reader: &mut BufReader<File>) -> Option<(u64, RecordType, Vec<u8>)> {
        let mut head = [0u8; HEAD_LEN];
        reader.read_exact(&mut head).ok()?;

        let seq = u64::from_le_bytes(head[0..8].try_into().ok()?);
        let record_type = RecordType::from_u8(head[8])?;
        let payload_len = u32::from_le_bytes(head[9..13].try_into().ok()?) as usize;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).ok()?;
        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes).ok()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            return None;
        }
        Some((seq, record_type, payload))
    }
}

impl TaskStore for LogTaskStore {
    fn insert(&self, task: ProductionTask) -> FactoryResult<()> {
        let mut tables = self.tables.write();
        tables.check_insert(&task)?;
        self.append(RecordType::Insert, &task)?;
        tables.put(task);
        Ok(())
    }

    fn update(&self, task: &ProductionTask) -> FactoryResult<()> {
        let mut tables = self.tables.write();
        tables.check_update(task)?;
        self.append(RecordType::Update, task)?;
        tables.put(task.clone());
        Ok(())
    }

    fn get(&self, id: &TaskId) -> FactoryResult<Option<ProductionTask>> {
        Ok(self.tables.read().get(id))
    }

    fn for_user(&self, user: UserId) -> FactoryResult<Vec<ProductionTask>> {
        Ok(self.tables.read().for_user(user))
    }

    fn with_status(&self, status: TaskStatus) -> FactoryResult<Vec<ProductionTask>> {
        Ok(self.tables.read().with_status(status))
    }
}

impl std::fmt::Debug for LogTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTaskStore")
            .field("path", &self.path)
            .field("tasks", &self.tables.read().len())
            .finish_non_exhaustive()
    }
}
