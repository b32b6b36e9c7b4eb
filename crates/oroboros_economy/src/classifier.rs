//! # Classifier Registry
//!
//! Resolves human-readable codes (`"main"`, `"stone"`, `"winter"`) to the
//! stable numeric ids stored in ledger rows, and back.
//!
//! The registry is a read-through cache over a [`ClassifierSource`]. A kind
//! is loaded from the source on first use and kept until it is invalidated.
//! Writes that go through [`ClassifierRegistry::register`] invalidate the
//! affected kind themselves; writes made to the source behind the
//! registry's back must call [`ClassifierRegistry::invalidate`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{EconomyError, EconomyResult};

/// Classifier families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    /// Storage areas.
    Section,
    /// Ledger operation types.
    OperationType,
    /// Item types.
    Item,
    /// Collection variants.
    Collection,
    /// Quality variants.
    Quality,
}

impl ClassifierKind {
    /// All kinds, in load order.
    pub const ALL: [Self; 5] = [
        Self::Section,
        Self::OperationType,
        Self::Item,
        Self::Collection,
        Self::Quality,
    ];

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Section => "section",
            Self::OperationType => "operation_type",
            Self::Item => "item",
            Self::Collection => "collection",
            Self::Quality => "quality",
        }
    }

    /// On-disk tag.
    pub(crate) const fn tag(self) -> u8 {
        match self {
            Self::Section => 1,
            Self::OperationType => 2,
            Self::Item => 3,
            Self::Collection => 4,
            Self::Quality => 5,
        }
    }

    pub(crate) const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Section),
            2 => Some(Self::OperationType),
            3 => Some(Self::Item),
            4 => Some(Self::Collection),
            5 => Some(Self::Quality),
            _ => None,
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One code/id row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classifier {
    /// Stable id.
    pub id: u32,
    /// Human-readable code.
    pub code: String,
}

/// Backing storage for classifier rows.
pub trait ClassifierSource: Send + Sync {
    /// Loads every row of one kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn load(&self, kind: ClassifierKind) -> EconomyResult<Vec<Classifier>>;

    /// Inserts a code, returning the existing row if the code is already known.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn insert(&self, kind: ClassifierKind, code: &str) -> EconomyResult<Classifier>;
}

/// In-process classifier table. Ids start at 1 per kind.
#[derive(Debug, Default)]
pub struct MemoryClassifierSource {
    rows: Mutex<HashMap<ClassifierKind, Vec<Classifier>>>,
}

impl MemoryClassifierSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClassifierSource for MemoryClassifierSource {
    fn load(&self, kind: ClassifierKind) -> EconomyResult<Vec<Classifier>> {
        Ok(self.rows.lock().get(&kind).cloned().unwrap_or_default())
    }

    fn insert(&self, kind: ClassifierKind, code: &str) -> EconomyResult<Classifier> {
        let mut rows = self.rows.lock();
        let table = rows.entry(kind).or_default();
        if let Some(existing) = table.iter().find(|row| row.code == code) {
            return Ok(existing.clone());
        }
        let id = u32::try_from(table.len() + 1)
            .map_err(|_| EconomyError::Storage(format!("{kind} table is full")))?;
        let row = Classifier {
            id,
            code: code.to_string(),
        };
        table.push(row.clone());
        Ok(row)
    }
}

/// Both directions of one kind, built at load time.
#[derive(Debug, Default)]
struct CodeTable {
    by_code: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

impl CodeTable {
    fn from_rows(rows: Vec<Classifier>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.by_code.insert(row.code.clone(), row.id);
            table.by_id.insert(row.id, row.code);
        }
        table
    }
}

/// Read-through code <-> id cache.
pub struct ClassifierRegistry {
    source: Arc<dyn ClassifierSource>,
    cache: RwLock<HashMap<ClassifierKind, Arc<CodeTable>>>,
    loads: AtomicU64,
}

impl ClassifierRegistry {
    /// Creates a registry over a source. Nothing is loaded until first use.
    #[must_use]
    pub fn new(source: Arc<dyn ClassifierSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            loads: AtomicU64::new(0),
        }
    }

    /// Creates a registry over a fresh in-memory source.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryClassifierSource::new()))
    }

    fn table(&self, kind: ClassifierKind) -> EconomyResult<Arc<CodeTable>> {
        if let Some(table) = self.cache.read().get(&kind) {
            return Ok(Arc::clone(table));
        }

        let rows = self.source.load(kind)?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(CodeTable::from_rows(rows));
        self.cache.write().insert(kind, Arc::clone(&table));
        Ok(table)
    }

    /// Resolves a code to its id.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCode` if the code is not registered.
    pub fn resolve(&self, kind: ClassifierKind, code: &str) -> EconomyResult<u32> {
        self.try_resolve(kind, code)?
            .ok_or_else(|| EconomyError::UnknownCode {
                kind,
                code: code.to_string(),
            })
    }

    /// Resolves a code, returning `None` when it is not registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    pub fn try_resolve(&self, kind: ClassifierKind, code: &str) -> EconomyResult<Option<u32>> {
        Ok(self.table(kind)?.by_code.get(code).copied())
    }

    /// Resolves an id back to its code.
    ///
    /// # Errors
    ///
    /// Returns `UnknownId` if the id is not registered.
    pub fn code(&self, kind: ClassifierKind, id: u32) -> EconomyResult<String> {
        self.table(kind)?
            .by_id
            .get(&id)
            .cloned()
            .ok_or(EconomyError::UnknownId { kind, id })
    }

    /// Registers a code (idempotent) and invalidates the cached kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the code is blank or the source write fails.
    pub fn register(&self, kind: ClassifierKind, code: &str) -> EconomyResult<u32> {
        let code = code.trim();
        if code.is_empty() {
            return Err(EconomyError::Validation(format!("{kind} code must not be empty")));
        }
        let row = self.source.insert(kind, code)?;
        self.invalidate(kind);
        Ok(row.id)
    }

    /// Registers many codes of one kind.
    ///
    /// # Errors
    ///
    /// Stops at the first failing code.
    pub fn register_all<I, S>(&self, kind: ClassifierKind, codes: I) -> EconomyResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for code in codes {
            self.register(kind, code.as_ref())?;
        }
        Ok(())
    }

    /// Drops the cached table of one kind; the next lookup reloads it.
    pub fn invalidate(&self, kind: ClassifierKind) {
        self.cache.write().remove(&kind);
    }

    /// Drops every cached table.
    pub fn invalidate_all(&self) {
        self.cache.write().clear();
    }

    /// Number of source loads so far.
    #[must_use]
    pub fn source_loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ClassifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierRegistry")
            .field("cached_kinds", &self.cache.read().len())
            .field("loads", &self.source_loads())
            .finish_non_exhaustive()
    }
}
