use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
    sync::OnceLock,
};

use log::{debug, info, warn};
use regex::Regex;

use crate::{
    error::{InventoryError, InventoryResult},
    filters::Filter,
};

/// Markers of instances that never host PDBs we report on: ASM, APEX support
/// and the cluster management repository
pub const DEFAULT_EXCLUDED_MARKERS: [&str; 5] =
    ["+ASM", "asm_pmon_", "+APX", "apx_pmon_", "MGMTDB"];

/// A `<prefix>_pmon_<SID>` background process, as read from /proc
#[derive(Debug, Clone, Default)]
pub struct MonitorProcess {
    pub pid: i32,
    pub uid: u32,
    /// Single argument command line, ie. `ora_pmon_ORCL_1`
    pub cmdline: String,
    /// Environment at scan time, empty if we're not allowed to read it
    pub environ: HashMap<OsString, OsString>,
}

impl MonitorProcess {
    /// Instance SID from the process name
    pub fn sid(&self) -> Option<&str> {
        monitor_regex()
            .captures(&self.cmdline)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str())
    }
}

/// A running database instance, reduced to its canonical database name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInstance {
    pub raw_process_name: String,
    /// Lowercase, instance suffix stripped
    pub canonical_name: String,
    pub sid: String,
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub environ: HashMap<OsString, OsString>,
}

impl DatabaseInstance {
    pub fn from_process(process: MonitorProcess) -> Option<Self> {
        let sid = process.sid()?.to_string();
        Some(Self {
            canonical_name: canonical_name(&sid),
            raw_process_name: process.cmdline,
            sid,
            pid: Some(process.pid),
            uid: Some(process.uid),
            environ: process.environ,
        })
    }
}

/// Where the list of databases comes from
#[derive(Debug, Clone)]
pub enum DiscoveryMode {
    /// Monitor processes in the local process table
    Process,
    /// Database resources registered in the cluster, cross-checked with the local process table
    Cluster { crsctl: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Exclusions {
    markers: Vec<String>,
}

impl Default for Exclusions {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_MARKERS)
    }
}

impl Exclusions {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Case insensitive substring match on the raw identifier
    pub fn is_excluded(&self, raw: &str) -> bool {
        let raw = raw.to_lowercase();
        self.markers.iter().any(|marker| raw.contains(marker.as_str()))
    }
}

fn monitor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z]+)_pmon_(.+)$").expect("valid regex"))
}

fn instance_suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_[0-9]+$").expect("valid regex"))
}

/// `ORCL_2` -> `orcl`
pub fn canonical_name(sid: &str) -> String {
    instance_suffix_regex().replace(sid, "").to_lowercase()
}

/// Find pmon processes
pub fn scan_monitor_processes() -> InventoryResult<Vec<MonitorProcess>> {
    let all = procfs::process::all_processes()
        .map_err(|e| InventoryError::Discovery(format!("can't read process table: {e}")))?;

    let monitors = all
        .filter_map(|proc| {
            let proc = proc.ok()?;
            let cmdline = proc.cmdline().ok()?;

            if cmdline.len() != 1 || !monitor_regex().is_match(&cmdline[0]) {
                return None;
            }
            debug!("Found pmon {}", cmdline[0]);

            let uid = proc.uid().ok()?;
            // environ is only readable by the owner or root
            let environ = proc.environ().unwrap_or_default();

            Some(MonitorProcess {
                pid: proc.pid,
                uid,
                cmdline: cmdline[0].clone(),
                environ,
            })
        })
        .collect();

    Ok(monitors)
}

/// Filter, normalize and deduplicate monitor processes
///
/// When several instances share a canonical name, the first one wins.
pub fn select_instances(
    processes: Vec<MonitorProcess>,
    exclusions: &Exclusions,
    filter: Option<&dyn Filter>,
) -> Vec<DatabaseInstance> {
    let mut instances: BTreeMap<String, DatabaseInstance> = BTreeMap::new();

    for process in processes {
        if exclusions.is_excluded(&process.cmdline) {
            debug!("Excluding {}", process.cmdline);
            continue;
        }
        if let Some(filter) = filter {
            if !filter.eval(&process) {
                debug!("Filtered out {}", process.cmdline);
                continue;
            }
        }
        let Some(instance) = DatabaseInstance::from_process(process) else {
            continue;
        };
        instances
            .entry(instance.canonical_name.clone())
            .or_insert(instance);
    }

    instances.into_values().collect()
}

/// Database names from `crsctl stat res -t`
///
/// Resource lines are `ora.<db>.db` at token position 0, the following indented lines
/// hold per-instance state and are ignored.
pub fn parse_cluster_resources(output: &str, exclusions: &Exclusions) -> Vec<String> {
    let mut names: Vec<String> = output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| token.strip_prefix("ora.")?.strip_suffix(".db"))
        .filter(|name| !name.is_empty() && !exclusions.is_excluded(name))
        .map(|name| name.to_lowercase())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// `instance` is a numbered instance of `db`: `<db><n>`
fn is_numbered_instance(db: &str, instance: &str) -> bool {
    instance
        .strip_prefix(db)
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Database served by a local instance
fn served_by<'a>(databases: &'a [String], instance: &str) -> Option<&'a String> {
    databases.iter().find(|db| db.as_str() == instance).or_else(|| {
        databases
            .iter()
            .filter(|db| is_numbered_instance(db, instance))
            .max_by_key(|db| db.len())
    })
}

/// Keep, for each cluster database, the local instance serving it
///
/// An instance serves the database of the same name, otherwise the longest database name
/// it extends with digits (RAC `orcl1` serves `orcl`), and never more than one database.
/// Databases without a local instance are logged and skipped.
pub fn match_cluster_instances(
    databases: &[String],
    local: Vec<DatabaseInstance>,
) -> Vec<DatabaseInstance> {
    databases
        .iter()
        .filter_map(|db| {
            let found = local
                .iter()
                .find(|instance| instance.canonical_name == *db)
                .or_else(|| {
                    local
                        .iter()
                        .find(|instance| served_by(databases, &instance.canonical_name) == Some(db))
                });
            match found {
                Some(instance) => Some(DatabaseInstance {
                    canonical_name: db.clone(),
                    ..instance.clone()
                }),
                None => {
                    warn!("{db} is registered in the cluster but not running here, skipping");
                    None
                }
            }
        })
        .collect()
}

/// Run `crsctl stat res -t`
pub fn cluster_status(crsctl: &Path) -> InventoryResult<String> {
    let output = Command::new(crsctl)
        .args(["stat", "res", "-t"])
        .output()
        .map_err(|e| InventoryError::Discovery(format!("can't run {crsctl:?}: {e}")))?;

    if !output.status.success() {
        return Err(InventoryError::Discovery(format!(
            "{crsctl:?} failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Locate crsctl: explicit path, then `$GRID_HOME/bin`, then PATH
pub fn locate_crsctl(explicit: Option<PathBuf>) -> InventoryResult<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(grid_home) = std::env::var_os("GRID_HOME") {
        let path = Path::new(&grid_home).join("bin").join("crsctl");
        if path.exists() {
            return Ok(path);
        }
    }
    which::which("crsctl")
        .map_err(|e| InventoryError::Discovery(format!("can't locate crsctl: {e}")))
}

/// List the databases to report on
///
/// An empty result is fatal for the pass.
pub fn discover(
    mode: &DiscoveryMode,
    exclusions: &Exclusions,
    filter: Option<&dyn Filter>,
) -> InventoryResult<Vec<DatabaseInstance>> {
    let processes = scan_monitor_processes()?;
    info!("Found {} pmon process(es)", processes.len());
    let local = select_instances(processes, exclusions, filter);

    let instances = match mode {
        DiscoveryMode::Process => local,
        DiscoveryMode::Cluster { crsctl } => {
            let status = cluster_status(crsctl)?;
            let databases = parse_cluster_resources(&status, exclusions);
            info!("Cluster databases: {}", databases.join(", "));
            match_cluster_instances(&databases, local)
        }
    };

    if instances.is_empty() {
        return Err(InventoryError::DiscoveryEmpty);
    }
    Ok(instances)
}
