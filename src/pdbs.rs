use std::{fmt::Display, str::FromStr};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    client::SqlClient,
    environment::ConnectionContext,
    error::{InventoryError, InventoryResult},
};

/// Template PDB, never reported
pub const SEED_PDB: &str = "PDB$SEED";

/// Column separator in query output
pub const SEPARATOR: char = '|';

pub const LIST_PDBS_SQL: &str =
    "select name || '|' || open_mode from v$pdbs where name <> 'PDB$SEED' order by con_id;";

pub const LIST_PDB_NAMES_SQL: &str =
    "select name from v$pdbs where name <> 'PDB$SEED' order by con_id;";

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
    Mounted,
    Other,
}

impl Display for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpenMode::ReadWrite => "READ WRITE",
            OpenMode::ReadOnly => "READ ONLY",
            OpenMode::Mounted => "MOUNTED",
            OpenMode::Other => "OTHER",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OpenMode {
    type Err = std::convert::Infallible;

    /// Only the exact `v$pdbs.open_mode` spellings are recognized
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "READ WRITE" => OpenMode::ReadWrite,
            "READ ONLY" => OpenMode::ReadOnly,
            "MOUNTED" => OpenMode::Mounted,
            _ => OpenMode::Other,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PluggableDatabase {
    pub name: String,
    /// None when listed without checking the open mode
    pub open_mode: Option<OpenMode>,
}

impl PluggableDatabase {
    /// Size can be queried: open read write, or not checked at all
    pub fn is_writable(&self) -> bool {
        matches!(self.open_mode, None | Some(OpenMode::ReadWrite))
    }
}

pub fn is_seed(name: &str) -> bool {
    name.eq_ignore_ascii_case(SEED_PDB)
}

pub fn list_query(with_open_mode: bool) -> &'static str {
    if with_open_mode {
        LIST_PDBS_SQL
    } else {
        LIST_PDB_NAMES_SQL
    }
}

/// Parse `NAME|OPEN_MODE` (or `NAME`) rows
///
/// Blank names or modes are skipped, so is the seed.
pub fn parse_pdb_rows(output: &str, with_open_mode: bool) -> Vec<PluggableDatabase> {
    output
        .lines()
        .filter_map(|line| {
            let (name, open_mode) = if with_open_mode {
                let (name, mode) = line.split_once(SEPARATOR)?;
                let mode = mode.trim();
                if mode.is_empty() {
                    return None;
                }
                (name.trim(), mode.parse().ok())
            } else {
                (line.trim(), None)
            };

            if name.is_empty() || is_seed(name) {
                return None;
            }
            Some(PluggableDatabase {
                name: name.to_string(),
                open_mode,
            })
        })
        .collect()
}

/// List the PDBs of a CDB
///
/// An empty list means we didn't reach a CDB, which is a failure.
pub fn enumerate(
    client: &dyn SqlClient,
    ctx: &ConnectionContext,
    with_open_mode: bool,
) -> InventoryResult<Vec<PluggableDatabase>> {
    let pdbs: Vec<PluggableDatabase> = client
        .list_pdbs(ctx, with_open_mode)?
        .into_iter()
        .filter(|pdb| !pdb.name.trim().is_empty() && !is_seed(&pdb.name))
        .collect();

    if pdbs.is_empty() {
        return Err(InventoryError::enumeration(&ctx.db_name, "no PDB returned"));
    }
    debug!("{}: {} PDB(s)", ctx.db_name, pdbs.len());
    Ok(pdbs)
}
