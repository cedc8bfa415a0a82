use std::{
    io::Write,
    path::PathBuf,
    process::{Output, Stdio},
};

use log::debug;

use crate::{
    environment::ConnectionContext,
    error::{InventoryError, InventoryResult},
    pdbs::{self, PluggableDatabase},
    report::{self, SizeComponents},
};

/// Executes the inventory queries against one CDB
pub trait SqlClient {
    fn name(&self) -> &'static str;

    /// Fails with `ClientUnavailable` if nothing can run queries for this database
    fn ensure_available(&self, ctx: &ConnectionContext) -> InventoryResult<()>;

    /// PDBs with their open mode, or names only
    fn list_pdbs(
        &self,
        ctx: &ConnectionContext,
        with_open_mode: bool,
    ) -> InventoryResult<Vec<PluggableDatabase>>;

    /// Switch to `pdb` and sum its files
    fn size_components(
        &self,
        ctx: &ConnectionContext,
        pdb: &str,
    ) -> InventoryResult<SizeComponents>;
}

/// Output directives: bare rows, no paging, errors end the session
pub const SQLPLUS_SETTINGS: &str = "set heading off feedback off pagesize 0 linesize 400 trimspool on verify off echo off
whenever sqlerror exit failure";

/// First `ORA-`/`SP2-` message in client output
pub fn client_error(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("ORA-") || line.starts_with("SP2-"))
}

/// `sqlplus -S / as sysdba`, one process per query
#[derive(Debug, Default)]
pub struct SqlPlus;

impl SqlPlus {
    /// `$ORACLE_HOME/bin/sqlplus`, then PATH
    pub fn locate(&self, ctx: &ConnectionContext) -> Option<PathBuf> {
        let in_home = ctx.bin_dir().join("sqlplus");
        if in_home.is_file() {
            return Some(in_home);
        }
        which::which("sqlplus").ok()
    }

    fn script(body: &str) -> String {
        format!("{SQLPLUS_SETTINGS}\n{body}\nexit\n")
    }

    /// Run a script, return stdout or a description of the failure
    pub fn run(&self, ctx: &ConnectionContext, body: &str) -> Result<String, String> {
        let sqlplus = self
            .locate(ctx)
            .ok_or_else(|| "sqlplus not found".to_string())?;
        let script = Self::script(body);
        debug!("{}: running {sqlplus:?}:\n{script}", ctx.db_name);

        let mut child = ctx
            .command(&sqlplus)
            .args(["-S", "-L", "/ as sysdba"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("can't start {sqlplus:?}: {e}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(script.as_bytes()) {
                // sqlplus exited early, reap it
                drop(stdin);
                let output = child
                    .wait_with_output()
                    .map_err(|e| format!("{sqlplus:?} failed: {e}"))?;
                return Err(format!(
                    "can't send script, {sqlplus:?} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
            }
        }
        let output = child
            .wait_with_output()
            .map_err(|e| format!("{sqlplus:?} failed: {e}"))?;

        check_output(output)
    }
}

fn check_output(output: Output) -> Result<String, String> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();

    if let Some(error) = client_error(&stdout) {
        return Err(error.to_string());
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("exited with {}: {}", output.status, stderr.trim()));
    }
    Ok(stdout)
}

impl SqlClient for SqlPlus {
    fn name(&self) -> &'static str {
        "sqlplus"
    }

    fn ensure_available(&self, ctx: &ConnectionContext) -> InventoryResult<()> {
        match self.locate(ctx) {
            Some(_) => Ok(()),
            None => Err(InventoryError::client_unavailable(
                &ctx.db_name,
                format!("sqlplus not in {:?} nor in PATH", ctx.bin_dir()),
            )),
        }
    }

    fn list_pdbs(
        &self,
        ctx: &ConnectionContext,
        with_open_mode: bool,
    ) -> InventoryResult<Vec<PluggableDatabase>> {
        let stdout = self
            .run(ctx, pdbs::list_query(with_open_mode))
            .map_err(|e| InventoryError::enumeration(&ctx.db_name, e))?;
        Ok(pdbs::parse_pdb_rows(&stdout, with_open_mode))
    }

    fn size_components(
        &self,
        ctx: &ConnectionContext,
        pdb: &str,
    ) -> InventoryResult<SizeComponents> {
        self.run(ctx, &report::size_script(pdb))
            .and_then(|stdout| report::parse_size_row(&stdout))
            .map_err(|e| InventoryError::size_query(&ctx.db_name, pdb, e))
    }
}
