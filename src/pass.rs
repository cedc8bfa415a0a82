use std::{io::Write, path::PathBuf};

use itertools::Itertools;
use log::{info, warn};

use crate::{
    client::{SqlClient, SqlPlus},
    discovery::{self, DatabaseInstance, DiscoveryMode, Exclusions},
    environment::EnvironmentResolver,
    error::{InventoryError, InventoryResult},
    filters::Filter,
    native::NativeClient,
    pdbs,
    report::{self, ReportFormat, ReportStatus, ReportWriter, SizeReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    SqlPlus,
    Native,
}

#[derive(Debug)]
pub struct PassConfig {
    pub discovery: DiscoveryMode,
    pub exclusions: Exclusions,
    pub filter: Option<Box<dyn Filter>>,
    pub oratab: PathBuf,
    pub backend: Backend,
    /// List PDBs with their open mode, only READ WRITE ones get a size query
    pub with_open_mode: bool,
    pub format: ReportFormat,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub databases: usize,
    pub skipped_databases: usize,
    pub ok: usize,
    pub down: usize,
    pub errors: usize,
}

impl PassSummary {
    fn record(&mut self, report: &SizeReport) {
        match report.status {
            ReportStatus::Ok => self.ok += 1,
            ReportStatus::Down => self.down += 1,
            ReportStatus::Error => self.errors += 1,
        }
    }
}

/// Report every PDB of every instance, one database after the other
///
/// Per database and per PDB failures are logged and skipped, only an empty
/// instance list or a failing output aborts.
pub fn run_pass<W: Write>(
    instances: &[DatabaseInstance],
    resolver: &mut EnvironmentResolver,
    client: &dyn SqlClient,
    with_open_mode: bool,
    writer: &mut ReportWriter<W>,
) -> InventoryResult<PassSummary> {
    if instances.is_empty() {
        return Err(InventoryError::DiscoveryEmpty);
    }

    let mut summary = PassSummary::default();
    for instance in instances {
        let db = instance.canonical_name.as_str();
        info!("Processing {db} ({})", instance.raw_process_name);

        let ctx = match resolver
            .resolve(instance)
            .and_then(|ctx| client.ensure_available(&ctx).map(|_| ctx))
        {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("{e}, skipping {db}");
                summary.skipped_databases += 1;
                continue;
            }
        };

        let pdbs = match pdbs::enumerate(client, &ctx, with_open_mode) {
            Ok(pdbs) => pdbs,
            Err(e) => {
                warn!("{e}, skipping {db}");
                summary.skipped_databases += 1;
                continue;
            }
        };

        summary.databases += 1;
        for pdb in &pdbs {
            let report = report::report_pdb(client, &ctx, pdb);
            summary.record(&report);
            writer.write(&report)?;
        }
    }

    Ok(summary)
}

/// Discover instances and run a full pass with the configured backend
pub fn run<W: Write>(config: PassConfig, out: W) -> InventoryResult<PassSummary> {
    let instances = discovery::discover(
        &config.discovery,
        &config.exclusions,
        config.filter.as_deref(),
    )?;
    info!(
        "Databases: {}",
        instances.iter().map(|i| &i.canonical_name).join(", ")
    );

    let mut resolver = EnvironmentResolver::from_oratab_file(&config.oratab);
    let client: Box<dyn SqlClient> = match config.backend {
        Backend::SqlPlus => Box::new(SqlPlus),
        Backend::Native => Box::new(NativeClient::new()?),
    };
    info!("Using {} client", client.name());

    let mut writer = ReportWriter::new(out, config.format);
    run_pass(
        &instances,
        &mut resolver,
        client.as_ref(),
        config.with_open_mode,
        &mut writer,
    )
}
