use std::io;

use thiserror::Error;

/// Result of a single step of an inventory pass.
pub type InventoryResult<T> = Result<T, InventoryError>;

/// Failures of an inventory pass, one variant per step.
///
/// Only [`InventoryError::DiscoveryEmpty`] aborts a pass. Every other variant is
/// caught where it happens and only skips the current database or PDB.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// No candidate instance survived discovery
    #[error("no databases found")]
    DiscoveryEmpty,

    /// Process table or cluster resource list could not be read
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Connection context could not be established for a database
    #[error("can't resolve environment for {db}: {reason}")]
    ResolutionFailure { db: String, reason: String },

    /// No usable SQL client after resolution
    #[error("no SQL client reachable for {db}: {reason}")]
    ClientUnavailable { db: String, reason: String },

    /// PDB listing failed or came back empty
    #[error("can't list PDBs of {db}: {reason}")]
    EnumerationFailure { db: String, reason: String },

    /// Aggregate size query failed for one PDB
    #[error("size query failed for {db}/{pdb}: {reason}")]
    SizeQueryFailure {
        db: String,
        pdb: String,
        reason: String,
    },

    /// PDB is not open read/write, no size query is attempted
    #[error("{pdb} is not open read write ({open_mode})")]
    PdbClosed { pdb: String, open_mode: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl InventoryError {
    pub fn resolution(db: &str, reason: impl ToString) -> Self {
        Self::ResolutionFailure {
            db: db.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn client_unavailable(db: &str, reason: impl ToString) -> Self {
        Self::ClientUnavailable {
            db: db.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn enumeration(db: &str, reason: impl ToString) -> Self {
        Self::EnumerationFailure {
            db: db.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn size_query(db: &str, pdb: &str, reason: impl ToString) -> Self {
        Self::SizeQueryFailure {
            db: db.to_string(),
            pdb: pdb.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the whole pass must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DiscoveryEmpty | Self::Discovery(_))
    }
}
