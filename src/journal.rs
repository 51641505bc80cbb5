//! Append-only journal of applied state changes.
//!
//! Every mutation the coordinator commits is appended after it succeeds, so replaying the
//! journal in order rebuilds the registry, the ledger and the position book. `FileJournal`
//! writes one JSON object per line and flushes each entry; `MemoryJournal` backs tests and
//! the simulator.

use crate::events::{ExchangeEvent, TransferSettled};
use crate::order::{Order, OrderStatus};
use crate::types::{Amount, CorrelationId, ExchangeOrderId, Timestamp, Token};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    BalanceSeeded {
        token: Token,
        total: Amount,
    },
    /// Order as accepted, plus what was locked for it in its settlement token.
    OrderSubmitted {
        order: Order,
        reservation: Amount,
    },
    ExchangeIdBound {
        correlation_id: CorrelationId,
        exchange_order_id: ExchangeOrderId,
    },
    CancelRequested {
        correlation_id: CorrelationId,
    },
    CancelRequestCleared {
        correlation_id: CorrelationId,
    },
    /// A sequenced exchange event, recorded once it has been applied.
    Exchange(ExchangeEvent),
    /// Terminal state decided locally (orphan sweep, reconciliation, failed placement).
    LocalTransition {
        correlation_id: CorrelationId,
        status: OrderStatus,
        reason: String,
    },
    Transfer(TransferSettled),
    BalanceAdjusted {
        token: Token,
        total: Amount,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: Timestamp,
    pub record: JournalRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Corrupt journal entry at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

pub trait Journal: Send {
    fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Every entry, oldest first.
    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryJournal {
    entries: Vec<JournalEntry>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<JournalEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Journal for MemoryJournal {
    fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(self.entries.clone())
    }
}

/// JSON-lines journal. Opened in append mode, so a restart continues the same file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        let json = serde_json::to_string(entry)?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|e| JournalError::Corrupt {
                line: index + 1,
                reason: e.to_string(),
            })?;
            entries.push(entry);
        }
        debug!(path = %self.path.display(), entries = entries.len(), "journal read");
        Ok(entries)
    }
}
