use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, warn};

use crate::{
    discovery::DatabaseInstance,
    error::{InventoryError, InventoryResult},
};

pub const DEFAULT_ORATAB: &str = "/etc/oratab";

/// Everything needed to reach one database
///
/// Built once per database and passed to every query, the process environment is never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub db_name: String,
    pub oracle_sid: String,
    pub oracle_home: PathBuf,
    /// Owner of the instance, queries run with this identity
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl ConnectionContext {
    pub fn bin_dir(&self) -> PathBuf {
        self.oracle_home.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.oracle_home.join("lib")
    }

    /// Command running `program` in the context of this database
    ///
    /// When started as root, the child drops to the instance owner (uid, gid and groups)
    /// so OS authentication as SYSDBA works.
    pub fn command<S: AsRef<OsStr>>(&self, program: S) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("ORACLE_SID", &self.oracle_sid)
            .env("ORACLE_HOME", &self.oracle_home)
            .env("LD_LIBRARY_PATH", self.lib_dir());

        if uzers::get_effective_uid() == 0 && self.uid != 0 {
            let (uid, gid, groups) = (self.uid, self.gid, self.groups.clone());
            // groups must be set before giving up root
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setgroups(groups.len() as libc::size_t, groups.as_ptr()) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setgid(gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        cmd
    }
}

/// One `SID:ORACLE_HOME:<Y|N>` line of oratab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OratabEntry {
    pub sid: String,
    pub home: PathBuf,
}

pub fn parse_oratab(content: &str) -> Vec<OratabEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let sid = fields.next()?.trim();
            let home = fields.next()?.trim();
            if sid.is_empty() || home.is_empty() {
                return None;
            }
            Some(OratabEntry {
                sid: sid.to_string(),
                home: PathBuf::from(home),
            })
        })
        .collect()
}

/// Resolve connection contexts, memoized per database name
#[derive(Debug, Default)]
pub struct EnvironmentResolver {
    oratab: Vec<OratabEntry>,
    resolved: HashMap<String, ConnectionContext>,
}

impl EnvironmentResolver {
    pub fn new(oratab: Vec<OratabEntry>) -> Self {
        Self {
            oratab,
            resolved: HashMap::new(),
        }
    }

    /// A missing oratab is not an error, homes then come from the instances' environment only
    pub fn from_oratab_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::new(parse_oratab(&content)),
            Err(e) => {
                debug!("Can't read {path:?}: {e}");
                Self::default()
            }
        }
    }

    pub fn resolve(&mut self, instance: &DatabaseInstance) -> InventoryResult<ConnectionContext> {
        if let Some(ctx) = self.resolved.get(&instance.canonical_name) {
            return Ok(ctx.clone());
        }

        let ctx = self.build(instance)?;
        debug!("Resolved {}: {ctx:?}", instance.canonical_name);
        self.resolved
            .insert(instance.canonical_name.clone(), ctx.clone());
        Ok(ctx)
    }

    fn build(&self, instance: &DatabaseInstance) -> InventoryResult<ConnectionContext> {
        let db = instance.canonical_name.as_str();

        let oracle_sid =
            env_value(&instance.environ, "ORACLE_SID").unwrap_or_else(|| instance.sid.clone());
        if oracle_sid.is_empty() {
            return Err(InventoryError::resolution(db, "empty ORACLE_SID"));
        }

        let oracle_home = match env_value(&instance.environ, "ORACLE_HOME") {
            Some(home) => PathBuf::from(home),
            None => self.oratab_home(&oracle_sid, db).ok_or_else(|| {
                InventoryError::resolution(db, "ORACLE_HOME neither in process environment nor oratab")
            })?,
        };
        if !oracle_home.is_dir() {
            return Err(InventoryError::resolution(
                db,
                format!("ORACLE_HOME {oracle_home:?} is not a directory"),
            ));
        }

        let uid = instance.uid.unwrap_or_else(uzers::get_current_uid);
        let (gid, groups) = identity(uid)
            .ok_or_else(|| InventoryError::resolution(db, format!("unknown user for uid {uid}")))?;

        Ok(ConnectionContext {
            db_name: db.to_string(),
            oracle_sid,
            oracle_home,
            uid,
            gid,
            groups,
        })
    }

    fn oratab_home(&self, sid: &str, db: &str) -> Option<PathBuf> {
        let by_sid = self.oratab.iter().find(|entry| entry.sid == sid);
        let by_name = || {
            self.oratab
                .iter()
                .find(|entry| entry.sid.eq_ignore_ascii_case(db))
        };
        let entry = by_sid.or_else(by_name)?;
        if entry.sid != sid {
            warn!("Using oratab entry {} for instance {sid}", entry.sid);
        }
        Some(entry.home.clone())
    }
}

fn env_value(environ: &HashMap<OsString, OsString>, key: &str) -> Option<String> {
    environ
        .get(OsStr::new(key))
        .map(|v| v.to_string_lossy().to_string())
        .filter(|v| !v.is_empty())
}

/// Primary gid and supplementary groups of `uid`
fn identity(uid: u32) -> Option<(u32, Vec<u32>)> {
    match uzers::get_user_by_uid(uid) {
        Some(user) => {
            let gid = user.primary_group_id();
            let groups = user
                .groups()
                .map(|groups| groups.iter().map(|g| g.gid()).collect())
                .unwrap_or_else(|| vec![gid]);
            Some((gid, groups))
        }
        // no passwd entry, only usable if that's who we already are
        None if uid == uzers::get_current_uid() => {
            let gid = uzers::get_current_gid();
            Some((gid, vec![gid]))
        }
        None => None,
    }
}
