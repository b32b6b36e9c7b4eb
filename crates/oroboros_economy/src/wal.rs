//! # Write-Ahead Log (WAL)
//!
//! **Crash-Safe Operation Log**
//!
//! Every committed ledger batch is appended here before it becomes visible.
//! If the server crashes mid-batch, recovery keeps what was committed:
//! - Committed batches: replayed into the in-memory ledger
//! - Uncommitted batches: discarded (the caller never saw success)
//!
//! ## Guarantees
//!
//! 1. **Durability**: Once `commit()` returns, the batch is on disk
//! 2. **Atomicity**: Either every row of a batch is replayed, or none is
//! 3. **Recovery**: A torn tail is cut off so later appends stay readable
//!
//! Classifier rows (code <-> id) live in the same log, so ids stored in
//! operation rows keep their meaning across restarts and config edits.
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "OWAL"]
//! [4 bytes: version]
//! [8 bytes: reserved]
//!
//! Entry format:
//! [8 bytes: LSN (Log Sequence Number)]
//! [1 byte: record type (BEGIN/OP/COMMIT/ROLLBACK/SNAPSHOT/CLASSIFIER/TOMBSTONE)]
//! [4 bytes: payload length]
//! [N bytes: payload (encoded record)]
//! [4 bytes: CRC32 of above]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Datelike, NaiveDate};
use parking_lot::Mutex;

use crate::classifier::{Classifier, ClassifierKind};
use crate::error::{EconomyError, EconomyResult};
use crate::item::{ItemStack, ItemVariant};
use crate::operation::{DailyBalanceSnapshot, LedgerOperation, ReturnTombstone};

/// Magic bytes identifying a WAL file.
const WAL_MAGIC: &[u8; 4] = b"OWAL";

/// Current WAL format version.
const WAL_VERSION: u32 = 3;

/// Header length in bytes.
const HEADER_LEN: u64 = 16;

/// Fixed bytes around each payload: lsn + type + length + crc.
const RECORD_OVERHEAD: u64 = 8 + 1 + 4 + 4;

/// WAL record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin a new batch.
    Begin = 1,
    /// A ledger operation within a batch.
    Operation = 2,
    /// Commit the batch (durable).
    Commit = 3,
    /// Roll the batch back.
    Rollback = 4,
    /// A balance snapshot within a batch.
    Snapshot = 5,
    /// A classifier row within a batch.
    Classifier = 6,
    /// A return tombstone within a batch.
    Tombstone = 7,
}

impl RecordType {
    /// Converts from u8.
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Operation),
            3 => Some(Self::Commit),
            4 => Some(Self::Rollback),
            5 => Some(Self::Snapshot),
            6 => Some(Self::Classifier),
            7 => Some(Self::Tombstone),
            _ => None,
        }
    }
}

/// A WAL record on disk.
#[derive(Clone, Debug)]
pub struct WalRecord {
    /// Log Sequence Number (unique, monotonic).
    pub lsn: u64,
    /// Record type.
    pub record_type: RecordType,
    /// Payload data.
    pub payload: Vec<u8>,
}

/// Everything a reopened log hands back to the ledger.
#[derive(Clone, Debug, Default)]
pub struct Recovered {
    /// Committed operations, in commit order.
    pub operations: Vec<LedgerOperation>,
    /// Committed snapshots, in commit order (later ones win).
    pub snapshots: Vec<DailyBalanceSnapshot>,
    /// Committed classifier rows, in commit order.
    pub classifiers: Vec<(ClassifierKind, Classifier)>,
    /// Committed return tombstones.
    pub tombstones: Vec<ReturnTombstone>,
    /// Batches that were begun but never committed.
    pub discarded_batches: usize,
}

/// Records of the batch being read back.
#[derive(Default)]
struct OpenBatch {
    operations: Vec<LedgerOperation>,
    snapshots: Vec<DailyBalanceSnapshot>,
    classifiers: Vec<(ClassifierKind, Classifier)>,
    tombstones: Vec<ReturnTombstone>,
}

impl Recovered {
    fn absorb(&mut self, batch: OpenBatch) {
        self.operations.extend(batch.operations);
        self.snapshots.extend(batch.snapshots);
        self.classifiers.extend(batch.classifiers);
        self.tombstones.extend(batch.tombstones);
    }
}

fn put_str(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => {
            buf.push(1);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        None => buf.push(0),
    }
}

fn put_stack(buf: &mut Vec<u8>, stack: &ItemStack) {
    buf.extend_from_slice(&stack.user.to_le_bytes());
    buf.extend_from_slice(&stack.section.to_le_bytes());
    buf.extend_from_slice(&stack.item.to_le_bytes());
    buf.extend_from_slice(&stack.variant.collection.to_le_bytes());
    buf.extend_from_slice(&stack.variant.quality.to_le_bytes());
}

/// Cursor over a record payload.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn i32(&mut self) -> Option<i32> {
        Some(i32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn opt_u32(&mut self) -> Option<Option<u32>> {
        match self.u8()? {
            0 => Some(None),
            1 => Some(Some(self.u32()?)),
            _ => None,
        }
    }

    fn opt_str(&mut self) -> Option<Option<String>> {
        match self.u8()? {
            0 => Some(None),
            1 => {
                let len = self.u32()? as usize;
                let bytes = self.take(len)?;
                Some(Some(String::from_utf8(bytes.to_vec()).ok()?))
            }
            _ => None,
        }
    }

    fn stack(&mut self) -> Option<ItemStack> {
        let user = self.u64()?;
        let section = self.u32()?;
        let item = self.u32()?;
        let collection = self.u32()?;
        let quality = self.u32()?;
        Some(ItemStack::new(user, section, item, ItemVariant::new(collection, quality)))
    }

    fn is_done(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Serializes an operation to bytes.
fn encode_operation(op: &LedgerOperation) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(&op.id.to_le_bytes());
    put_stack(&mut buf, &op.stack);
    buf.extend_from_slice(&op.delta.to_le_bytes());
    buf.extend_from_slice(&op.operation_type.to_le_bytes());
    buf.extend_from_slice(&op.created_at.timestamp_micros().to_le_bytes());
    put_str(&mut buf, op.correlation_id.as_deref());
    match op.recipe {
        Some(recipe) => {
            buf.push(1);
            buf.extend_from_slice(&recipe.to_le_bytes());
        }
        None => buf.push(0),
    }
    put_str(&mut buf, op.comment.as_deref());
    buf
}

/// Deserializes an operation from bytes.
fn decode_operation(data: &[u8]) -> Option<LedgerOperation> {
    let mut r = ByteReader::new(data);
    let id = r.u64()?;
    let stack = r.stack()?;
    let delta = r.i64()?;
    let operation_type = r.u32()?;
    let created_at = DateTime::from_timestamp_micros(r.i64()?)?;
    let correlation_id = r.opt_str()?;
    let recipe = r.opt_u32()?;
    let comment = r.opt_str()?;
    if !r.is_done() {
        return None;
    }
    Some(LedgerOperation {
        id,
        stack,
        delta,
        operation_type,
        correlation_id,
        recipe,
        comment,
        created_at,
    })
}

/// Serializes a snapshot to bytes.
fn encode_snapshot(snapshot: &DailyBalanceSnapshot) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    put_stack(&mut buf, &snapshot.stack);
    buf.extend_from_slice(&snapshot.date.num_days_from_ce().to_le_bytes());
    buf.extend_from_slice(&snapshot.quantity.to_le_bytes());
    buf
}

/// Deserializes a snapshot from bytes.
fn decode_snapshot(data: &[u8]) -> Option<DailyBalanceSnapshot> {
    let mut r = ByteReader::new(data);
    let stack = r.stack()?;
    let date = NaiveDate::from_num_days_from_ce_opt(r.i32()?)?;
    let quantity = r.i64()?;
    if !r.is_done() {
        return None;
    }
    Some(DailyBalanceSnapshot {
        stack,
        date,
        quantity,
    })
}

fn encode_classifier(kind: ClassifierKind, row: &Classifier) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + row.code.len());
    buf.push(kind.tag());
    buf.extend_from_slice(&row.id.to_le_bytes());
    put_str(&mut buf, Some(&row.code));
    buf
}

fn decode_classifier(data: &[u8]) -> Option<(ClassifierKind, Classifier)> {
    let mut r = ByteReader::new(data);
    let kind = ClassifierKind::from_tag(r.u8()?)?;
    let id = r.u32()?;
    let code = r.opt_str()??;
    if !r.is_done() {
        return None;
    }
    Some((kind, Classifier { id, code }))
}

fn encode_tombstone(tombstone: &ReturnTombstone) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24 + tombstone.correlation_id.len());
    put_str(&mut buf, Some(&tombstone.correlation_id));
    buf.extend_from_slice(&tombstone.user.to_le_bytes());
    buf.extend_from_slice(&tombstone.created_at.timestamp_micros().to_le_bytes());
    buf
}

fn decode_tombstone(data: &[u8]) -> Option<ReturnTombstone> {
    let mut r = ByteReader::new(data);
    let correlation_id = r.opt_str()??;
    let user = r.u64()?;
    let created_at = DateTime::from_timestamp_micros(r.i64()?)?;
    if !r.is_done() {
        return None;
    }
    Some(ReturnTombstone {
        correlation_id,
        user,
        created_at,
    })
}

/// Batch handle for grouping records.
struct Transaction<'a> {
    wal: &'a OperationLog,
    /// Set once the COMMIT record has been attempted; no ROLLBACK may follow it.
    finalized: bool,
}

impl Transaction<'_> {
    fn add(&mut self, record_type: RecordType, payload: &[u8]) -> EconomyResult<()> {
        if self.finalized {
            return Err(EconomyError::Storage("transaction already finalized".to_string()));
        }
        self.wal.write_record(record_type, payload)?;
        Ok(())
    }

    /// Commits the batch (durable).
    ///
    /// After `Ok`, the data is on disk. After `Err` the COMMIT record may or
    /// may not have reached the file, so the batch must be treated as
    /// committed until the log is reopened.
    fn commit(mut self) -> EconomyResult<()> {
        if self.finalized {
            return Err(EconomyError::Storage("transaction already finalized".to_string()));
        }
        self.finalized = true;
        self.wal.write_record(RecordType::Commit, &[])?;
        self.wal.sync()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // If not finalized, auto-rollback
        if !self.finalized {
            let _ = self.wal.write_record(RecordType::Rollback, &[]);
        }
    }
}

/// Write-Ahead Log holding the ledger's operation history.
pub struct OperationLog {
    /// Path to the WAL file.
    path: PathBuf,
    /// Next Log Sequence Number.
    current_lsn: AtomicU64,
    /// File handle (protected by mutex for writes).
    file: Mutex<BufWriter<File>>,
    #[cfg(test)]
    fail_sync: AtomicBool,
}

impl OperationLog {
    /// Opens or creates a WAL file and recovers its committed contents.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the file cannot be opened or has a foreign header.
    pub fn open(path: impl AsRef<Path>) -> EconomyResult<(Self, Recovered)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| EconomyError::Storage(format!("failed to create WAL directory: {e}")))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| EconomyError::Storage(format!("failed to open WAL: {e}")))?;

        let len = file
            .metadata()
            .map_err(|e| EconomyError::Storage(format!("failed to get metadata: {e}")))?
            .len();

        let mut writer = BufWriter::new(file);
        if len == 0 {
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            header.extend_from_slice(WAL_MAGIC);
            header.extend_from_slice(&WAL_VERSION.to_le_bytes());
            header.extend_from_slice(&0u64.to_le_bytes());
            writer
                .write_all(&header)
                .and_then(|()| writer.flush())
                .map_err(|e| EconomyError::Storage(format!("failed to write header: {e}")))?;
        }

        let (recovered, next_lsn, valid_len) = Self::recover(&path)?;

        // Cut a torn tail so the next append lands on a record boundary.
        if valid_len < len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len = len,
                "WAL tail was torn, truncating"
            );
            writer
                .get_ref()
                .set_len(valid_len)
                .map_err(|e| EconomyError::Storage(format!("truncate failed: {e}")))?;
        }

        if recovered.discarded_batches > 0 {
            tracing::warn!(
                discarded = recovered.discarded_batches,
                "WAL recovery: uncommitted batches rolled back"
            );
        }

        let log = Self {
            path,
            current_lsn: AtomicU64::new(next_lsn),
            file: Mutex::new(writer),
            #[cfg(test)]
            fail_sync: AtomicBool::new(false),
        };

        Ok((log, recovered))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin_transaction(&self) -> EconomyResult<Transaction<'_>> {
        self.write_record(RecordType::Begin, &[])?;
        Ok(Transaction {
            wal: self,
            finalized: false,
        })
    }

    /// Writes one batch of operations and tombstones and commits it.
    ///
    /// # Errors
    ///
    /// Returns an error if any record cannot be written or synced. A failure
    /// before the COMMIT record rolls the batch back; a failed sync leaves it
    /// undecided until the next open.
    pub fn append_batch(
        &self,
        operations: &[LedgerOperation],
        tombstones: &[ReturnTombstone],
    ) -> EconomyResult<()> {
        let mut txn = self.begin_transaction()?;
        for op in operations {
            txn.add(RecordType::Operation, &encode_operation(op))?;
        }
        for tombstone in tombstones {
            txn.add(RecordType::Tombstone, &encode_tombstone(tombstone))?;
        }
        txn.commit()
    }

    /// Writes one batch of operations and commits it.
    ///
    /// # Errors
    ///
    /// See [`Self::append_batch`].
    pub fn append_operations(&self, operations: &[LedgerOperation]) -> EconomyResult<()> {
        self.append_batch(operations, &[])
    }

    /// Writes one batch of snapshots and commits it.
    ///
    /// # Errors
    ///
    /// See [`Self::append_batch`].
    pub fn append_snapshots(&self, snapshots: &[DailyBalanceSnapshot]) -> EconomyResult<()> {
        let mut txn = self.begin_transaction()?;
        for snapshot in snapshots {
            txn.add(RecordType::Snapshot, &encode_snapshot(snapshot))?;
        }
        txn.commit()
    }

    /// Writes one classifier row and commits it.
    ///
    /// # Errors
    ///
    /// See [`Self::append_batch`].
    pub fn append_classifier(&self, kind: ClassifierKind, row: &Classifier) -> EconomyResult<()> {
        let mut txn = self.begin_transaction()?;
        txn.add(RecordType::Classifier, &encode_classifier(kind, row))?;
        txn.commit()
    }

    /// Makes every later sync fail, leaving written records in the buffer.
    #[cfg(test)]
    pub(crate) fn fail_syncs(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Writes a record to the WAL.
    fn write_record(&self, record_type: RecordType, payload: &[u8]) -> EconomyResult<u64> {
        let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);

        let mut frame = Vec::with_capacity(RECORD_OVERHEAD as usize + payload.len());
        frame.extend_from_slice(&lsn.to_le_bytes());
        frame.push(record_type as u8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        self.file
            .lock()
            .write_all(&frame)
            .map_err(|e| EconomyError::Storage(format!("WAL write failed: {e}")))?;

        Ok(lsn)
    }

    /// Syncs the WAL to disk.
    fn sync(&self) -> EconomyResult<()> {
        #[cfg(test)]
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(EconomyError::Storage("WAL sync failed: injected".to_string()));
        }
        let mut file = self.file.lock();
        file.flush()
            .map_err(|e| EconomyError::Storage(format!("WAL sync failed: {e}")))?;
        file.get_ref()
            .sync_data()
            .map_err(|e| EconomyError::Storage(format!("WAL sync failed: {e}")))?;
        Ok(())
    }

    /// Reads the whole file back.
    ///
    /// Returns the committed contents, the next LSN and the length of the
    /// readable prefix.
    fn recover(path: &Path) -> EconomyResult<(Recovered, u64, u64)> {
        let mut recovered = Recovered::default();

        let file = File::open(path)
            .map_err(|e| EconomyError::Storage(format!("failed to open WAL for recovery: {e}")))?;
        let mut reader = BufReader::new(file);

        // Read and verify header
        let mut header = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut header)
            .map_err(|e| EconomyError::Storage(format!("failed to read WAL header: {e}")))?;
        if &header[0..4] != WAL_MAGIC {
            return Err(EconomyError::Storage("invalid WAL magic".to_string()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != WAL_VERSION {
            return Err(EconomyError::Storage(format!("unsupported WAL version: {version}")));
        }

        let mut valid_len = HEADER_LEN;
        let mut next_lsn = 0u64;
        // Only one batch is ever open: the ledger writes under its own lock.
        let mut open: Option<OpenBatch> = None;

        while let Some(record) = Self::read_record(&mut reader) {
            valid_len += RECORD_OVERHEAD + record.payload.len() as u64;
            next_lsn = next_lsn.max(record.lsn + 1);

            match record.record_type {
                RecordType::Begin => {
                    if open.replace(OpenBatch::default()).is_some() {
                        recovered.discarded_batches += 1;
                    }
                }
                RecordType::Operation => {
                    let op = decode_operation(&record.payload)
                        .ok_or_else(|| undecodable("operation", record.lsn))?;
                    if let Some(batch) = open.as_mut() {
                        batch.operations.push(op);
                    }
                }
                RecordType::Snapshot => {
                    let snapshot = decode_snapshot(&record.payload)
                        .ok_or_else(|| undecodable("snapshot", record.lsn))?;
                    if let Some(batch) = open.as_mut() {
                        batch.snapshots.push(snapshot);
                    }
                }
                RecordType::Classifier => {
                    let row = decode_classifier(&record.payload)
                        .ok_or_else(|| undecodable("classifier", record.lsn))?;
                    if let Some(batch) = open.as_mut() {
                        batch.classifiers.push(row);
                    }
                }
                RecordType::Tombstone => {
                    let tombstone = decode_tombstone(&record.payload)
                        .ok_or_else(|| undecodable("tombstone", record.lsn))?;
                    if let Some(batch) = open.as_mut() {
                        batch.tombstones.push(tombstone);
                    }
                }
                RecordType::Commit => {
                    if let Some(batch) = open.take() {
                        recovered.absorb(batch);
                    }
                }
                RecordType::Rollback => {
                    open = None;
                }
            }
        }

        if open.is_some() {
            recovered.discarded_batches += 1;
        }

        Ok((recovered, next_lsn, valid_len))
    }

    /// Reads a single record; `None` at end of file or at the first damaged record.
    fn read_record(reader: &mut BufReader<File>) -> Option<WalRecord> {
        let mut head = [0u8; 13];
        reader.read_exact(&mut head).ok()?;

        let lsn = u64::from_le_bytes(head[0..8].try_into().ok()?);
        let record_type = RecordType::from_u8(head[8])?;
        let payload_len = u32::from_le_bytes(head[9..13].try_into().ok()?) as usize;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).ok()?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes).ok()?;
        let stored_crc = u32::from_le_bytes(crc_bytes);

        // Verify CRC
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return None;
        }

        Some(WalRecord {
            lsn,
            record_type,
            payload,
        })
    }
}

fn undecodable(what: &str, lsn: u64) -> EconomyError {
    EconomyError::Storage(format!("undecodable {what} at lsn {lsn}"))
}

impl std::fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("path", &self.path)
            .field("next_lsn", &self.current_lsn.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
