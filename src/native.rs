// Native backend: this binary is spawned again in the database owner context
// (uid, ORACLE_SID, ORACLE_HOME, LD_LIBRARY_PATH), connects through OCI and prints JSON
// for the parent.

use std::{
    path::PathBuf,
    process::{Command, Stdio},
};

use log::debug;
use oracle::{Connection, Connector, Privilege};
use serde::de::DeserializeOwned;

use crate::{
    client::SqlClient,
    environment::ConnectionContext,
    error::{InventoryError, InventoryResult},
    pdbs::{self, PluggableDatabase},
    report::{self, SizeComponents},
};

/// Hidden subcommand run by the child
pub const QUERY_SUBCOMMAND: &str = "query";

pub struct NativeClient {
    exe: PathBuf,
}

impl NativeClient {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
        })
    }

    fn spawn<T: DeserializeOwned>(
        &self,
        ctx: &ConnectionContext,
        configure: impl FnOnce(&mut Command),
    ) -> Result<T, String> {
        let mut cmd = ctx.command(&self.exe);
        cmd.arg(QUERY_SUBCOMMAND)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        configure(&mut cmd);
        debug!("{}: running {cmd:?}", ctx.db_name);

        let output = cmd
            .output()
            .map_err(|e| format!("can't start {:?}: {e}", self.exe))?;

        if !output.status.success() {
            return Err(format!(
                "query process failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).map_err(|e| format!("can't read query result: {e}"))
    }
}

impl SqlClient for NativeClient {
    fn name(&self) -> &'static str {
        "native"
    }

    /// The OCI library must come with the Oracle home
    fn ensure_available(&self, ctx: &ConnectionContext) -> InventoryResult<()> {
        let lib = ctx.lib_dir().join("libclntsh.so");
        if lib.exists() {
            Ok(())
        } else {
            Err(InventoryError::client_unavailable(
                &ctx.db_name,
                format!("{lib:?} not found"),
            ))
        }
    }

    fn list_pdbs(
        &self,
        ctx: &ConnectionContext,
        with_open_mode: bool,
    ) -> InventoryResult<Vec<PluggableDatabase>> {
        self.spawn(ctx, |cmd| {
            if !with_open_mode {
                cmd.arg("--no-open-mode");
            }
        })
        .map_err(|e| InventoryError::enumeration(&ctx.db_name, e))
    }

    fn size_components(
        &self,
        ctx: &ConnectionContext,
        pdb: &str,
    ) -> InventoryResult<SizeComponents> {
        self.spawn(ctx, |cmd| {
            cmd.args(["--pdb", pdb]);
        })
        .map_err(|e| InventoryError::size_query(&ctx.db_name, pdb, e))
    }
}

/// Connect to DB using OS auth and env vars
pub fn connect() -> oracle::Result<Connection> {
    Connector::new("", "", "")
        .external_auth(true)
        .privilege(Privilege::Sysdba)
        .connect()
}

/// Rows of a single column query, one per line
fn query_lines(conn: &Connection, sql: &str) -> oracle::Result<String> {
    let mut lines = Vec::new();
    for row in conn.query_as::<Option<String>>(sql, &[])? {
        lines.push(row?.unwrap_or_default());
    }
    Ok(lines.join("\n"))
}

pub fn query_pdbs(
    conn: &Connection,
    with_open_mode: bool,
) -> anyhow::Result<Vec<PluggableDatabase>> {
    // sqlplus terminator is not valid through OCI
    let sql = pdbs::list_query(with_open_mode).trim_end_matches(';');
    let rows = query_lines(conn, sql)?;
    Ok(pdbs::parse_pdb_rows(&rows, with_open_mode))
}

pub fn query_size(conn: &Connection, pdb: &str) -> anyhow::Result<SizeComponents> {
    if !report::is_valid_identifier(pdb) {
        anyhow::bail!("{pdb:?} is not a valid identifier");
    }
    conn.execute(&format!("alter session set container = \"{pdb}\""), &[])?;
    let row = query_lines(conn, report::SIZE_SQL.trim_end_matches(';'))?;
    report::parse_size_row(&row).map_err(anyhow::Error::msg)
}

/// Child side: connect, run one query and return its JSON result
pub fn run_query(pdb: Option<&str>, with_open_mode: bool) -> anyhow::Result<String> {
    if uzers::get_effective_uid() == 0 {
        anyhow::bail!("query must run as the database owner, not root");
    }
    let conn = connect()?;
    let json = match pdb {
        Some(pdb) => serde_json::to_string(&query_size(&conn, pdb)?)?,
        None => serde_json::to_string(&query_pdbs(&conn, with_open_mode)?)?,
    };
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(home: &std::path::Path) -> ConnectionContext {
        ConnectionContext {
            db_name: "orcl".to_string(),
            oracle_sid: "ORCL".to_string(),
            oracle_home: home.to_path_buf(),
            uid: uzers::get_current_uid(),
            gid: uzers::get_current_gid(),
            groups: vec![],
        }
    }

    #[test]
    fn test_requires_client_library() {
        let client = NativeClient::new().unwrap();
        let home = tempfile::tempdir().unwrap();
        let ctx = context(home.path());

        let err = client.ensure_available(&ctx).unwrap_err();
        assert!(matches!(err, InventoryError::ClientUnavailable { ref db, .. } if db == "orcl"));
        assert!(err.to_string().contains("libclntsh.so"));

        std::fs::create_dir(home.path().join("lib")).unwrap();
        std::fs::write(home.path().join("lib/libclntsh.so"), b"").unwrap();
        assert!(client.ensure_available(&ctx).is_ok());
    }
}
