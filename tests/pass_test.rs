use std::{cell::RefCell, collections::HashMap, ffi::OsString, path::Path};

use pdbsize::{
    client::SqlClient,
    discovery::{self, Exclusions, MonitorProcess},
    environment::EnvironmentResolver,
    pdbs::SEED_PDB,
    run_pass, ConnectionContext, InventoryError, InventoryResult, OpenMode, PluggableDatabase,
    ReportFormat, ReportWriter, SizeComponents, TextFormat,
};

const GIB: u64 = 1 << 30;

/// In memory CDBs, records every size query
#[derive(Default)]
struct RecordingClient {
    pdbs: HashMap<String, Vec<PluggableDatabase>>,
    sizes: HashMap<String, SizeComponents>,
    unavailable: Vec<String>,
    size_queries: RefCell<Vec<String>>,
}

impl RecordingClient {
    fn with_cdb(mut self, db: &str, pdbs: &[(&str, Option<OpenMode>)]) -> Self {
        self.pdbs.insert(
            db.to_string(),
            pdbs.iter()
                .map(|(name, open_mode)| PluggableDatabase {
                    name: name.to_string(),
                    open_mode: *open_mode,
                })
                .collect(),
        );
        self
    }

    fn with_size(mut self, pdb: &str, components: SizeComponents) -> Self {
        self.sizes.insert(pdb.to_string(), components);
        self
    }
}

impl SqlClient for RecordingClient {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn ensure_available(&self, ctx: &ConnectionContext) -> InventoryResult<()> {
        if self.unavailable.contains(&ctx.db_name) {
            return Err(InventoryError::client_unavailable(&ctx.db_name, "no sqlplus"));
        }
        Ok(())
    }

    fn list_pdbs(
        &self,
        ctx: &ConnectionContext,
        _with_open_mode: bool,
    ) -> InventoryResult<Vec<PluggableDatabase>> {
        self.pdbs.get(&ctx.db_name).cloned().ok_or_else(|| {
            InventoryError::enumeration(&ctx.db_name, "ORA-01034: ORACLE not available")
        })
    }

    fn size_components(
        &self,
        ctx: &ConnectionContext,
        pdb: &str,
    ) -> InventoryResult<SizeComponents> {
        self.size_queries.borrow_mut().push(pdb.to_string());
        self.sizes
            .get(pdb)
            .copied()
            .ok_or_else(|| InventoryError::size_query(&ctx.db_name, pdb, "ORA-00942"))
    }
}

fn pmon(pid: i32, cmdline: &str, home: &Path) -> MonitorProcess {
    let mut environ = HashMap::new();
    environ.insert(OsString::from("ORACLE_HOME"), home.as_os_str().to_os_string());
    MonitorProcess {
        pid,
        uid: uzers::get_current_uid(),
        cmdline: cmdline.to_string(),
        environ,
    }
}

fn size(used_gib: u64) -> SizeComponents {
    SizeComponents {
        datafile_bytes: used_gib * GIB,
        ..Default::default()
    }
}

fn text_writer() -> ReportWriter<Vec<u8>> {
    ReportWriter::new(Vec::new(), ReportFormat::Text(TextFormat::default()))
}

#[test]
fn test_full_pass() {
    let home = tempfile::tempdir().unwrap();
    let processes = vec![
        pmon(100, "ora_pmon_ORCL_1", home.path()),
        pmon(101, "ora_pmon_ORCL_2", home.path()),
        pmon(102, "asm_pmon_+ASM1", home.path()),
        pmon(103, "ora_pmon_HR", home.path()),
    ];
    let instances = discovery::select_instances(processes, &Exclusions::default(), None);

    let client = RecordingClient::default()
        .with_cdb(
            "orcl",
            &[
                ("SALESDB", Some(OpenMode::ReadWrite)),
                (SEED_PDB, Some(OpenMode::ReadOnly)),
                ("ARCHIVE", Some(OpenMode::Mounted)),
                ("BROKEN", Some(OpenMode::ReadWrite)),
            ],
        )
        .with_cdb("hr", &[("PAYROLL", Some(OpenMode::ReadWrite))])
        .with_size(
            "SALESDB",
            SizeComponents {
                datafile_bytes: 70 * GIB,
                tempfile_bytes: 20 * GIB,
                redolog_bytes: 10 * GIB,
                free_bytes: 20 * GIB,
            },
        )
        .with_size("PAYROLL", size(3));

    let mut resolver = EnvironmentResolver::default();
    let mut writer = text_writer();
    let summary = run_pass(&instances, &mut resolver, &client, true, &mut writer).unwrap();

    let out = String::from_utf8(writer.into_inner()).unwrap();
    assert_eq!(
        out,
        "payroll             3.00           \n\
         salesdb             80.00          \n\
         archive             pdb is down    \n\
         broken              error          \n"
    );
    assert!(!out.to_lowercase().contains("pdb$seed"));

    assert_eq!(summary.databases, 2);
    assert_eq!(summary.skipped_databases, 0);
    assert_eq!((summary.ok, summary.down, summary.errors), (2, 1, 1));

    // closed PDBs are never queried
    assert_eq!(
        *client.size_queries.borrow(),
        vec!["PAYROLL".to_string(), "SALESDB".to_string(), "BROKEN".to_string()]
    );
}

#[test]
fn test_non_writable_pdbs_never_queried() {
    let home = tempfile::tempdir().unwrap();
    let instances = discovery::select_instances(
        vec![pmon(100, "ora_pmon_CDB1", home.path())],
        &Exclusions::default(),
        None,
    );
    let client = RecordingClient::default().with_cdb(
        "cdb1",
        &[
            ("RO", Some(OpenMode::ReadOnly)),
            ("MNT", Some(OpenMode::Mounted)),
            ("MIG", Some(OpenMode::Other)),
        ],
    );

    let mut writer = text_writer();
    let summary = run_pass(
        &instances,
        &mut EnvironmentResolver::default(),
        &client,
        true,
        &mut writer,
    )
    .unwrap();

    assert_eq!(summary.down, 3);
    assert!(client.size_queries.borrow().is_empty());
    let out = String::from_utf8(writer.into_inner()).unwrap();
    assert!(out.lines().all(|line| line.ends_with("pdb is down    ")));
}

#[test]
fn test_without_open_mode_every_pdb_is_queried() {
    let home = tempfile::tempdir().unwrap();
    let instances = discovery::select_instances(
        vec![pmon(100, "ora_pmon_CDB1", home.path())],
        &Exclusions::default(),
        None,
    );
    let client = RecordingClient::default()
        .with_cdb("cdb1", &[("APP1", None), ("APP2", None)])
        .with_size("APP1", size(1));

    let mut writer = text_writer();
    let summary = run_pass(
        &instances,
        &mut EnvironmentResolver::default(),
        &client,
        false,
        &mut writer,
    )
    .unwrap();

    assert_eq!((summary.ok, summary.errors), (1, 1));
    assert_eq!(client.size_queries.borrow().len(), 2);
}

#[test]
fn test_failing_databases_are_skipped() {
    let home = tempfile::tempdir().unwrap();
    let mut nohome = pmon(200, "ora_pmon_NOHOME", home.path());
    nohome.environ.clear();
    let processes = vec![
        nohome,
        pmon(201, "ora_pmon_NOCLIENT", home.path()),
        pmon(202, "ora_pmon_DOWNCDB", home.path()),
        pmon(203, "ora_pmon_EMPTY", home.path()),
        pmon(204, "ora_pmon_GOOD", home.path()),
    ];
    let instances = discovery::select_instances(processes, &Exclusions::default(), None);

    let mut client = RecordingClient::default()
        .with_cdb("empty", &[(SEED_PDB, Some(OpenMode::ReadOnly))])
        .with_cdb("noclient", &[("X", Some(OpenMode::ReadWrite))])
        .with_cdb("good", &[("APP", Some(OpenMode::ReadWrite))])
        .with_size("APP", size(2));
    client.unavailable.push("noclient".to_string());

    let mut writer = text_writer();
    let summary = run_pass(
        &instances,
        &mut EnvironmentResolver::default(),
        &client,
        true,
        &mut writer,
    )
    .unwrap();

    assert_eq!(summary.databases, 1);
    assert_eq!(summary.skipped_databases, 4);
    let out = String::from_utf8(writer.into_inner()).unwrap();
    assert_eq!(out, "app                 2.00           \n");
}

#[test]
fn test_no_instance_is_fatal() {
    let client = RecordingClient::default();
    let mut writer = text_writer();

    let err = run_pass(
        &[],
        &mut EnvironmentResolver::default(),
        &client,
        true,
        &mut writer,
    )
    .unwrap_err();

    assert!(matches!(err, InventoryError::DiscoveryEmpty));
    assert!(err.is_fatal());
    assert!(writer.into_inner().is_empty());
}

#[test]
fn test_only_excluded_instances_is_fatal() {
    let home = tempfile::tempdir().unwrap();
    let instances = discovery::select_instances(
        vec![
            pmon(1, "asm_pmon_+ASM1", home.path()),
            pmon(2, "apx_pmon_+APX1", home.path()),
            pmon(3, "mdb_pmon_-MGMTDB", home.path()),
        ],
        &Exclusions::default(),
        None,
    );
    assert!(instances.is_empty());

    let err = run_pass(
        &instances,
        &mut EnvironmentResolver::default(),
        &RecordingClient::default(),
        true,
        &mut text_writer(),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "no databases found");
}
