// Report used size of every pluggable database running on this host
// - Run as root, or as the owner of the databases
// - Report goes to stdout, diagnostics to stderr (RUST_LOG=debug for SQL scripts)

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use pdbsize::{
    discovery::{self, DiscoveryMode, Exclusions},
    environment::{EnvironmentResolver, DEFAULT_ORATAB},
    filters, native,
    report::DEFAULT_DOWN_LABEL,
    Backend, InventoryError, PassConfig, ReportFormat, TextFormat,
};

const AFTER_HELP: &str = r"Exit status is 1 only if no database is found, failures on a single database or PDB are logged and skipped.

Available filters (restrict which pmon processes are considered):
    - true()
    - false()
    - or(..)
    - and(..)
    - not(..)
    - uid(<uid>)
    - pid(<pid>)
    - sid(<ORACLE_SID>)
    - env_k(<env key>)
    - env_kv(<env key, env value>)
Limitation:
    - ALL filters require trailing parenthesis
Examples:
    - Instances of user 1001: uid(1001)
    - Instances of a given Oracle home: env_kv(ORACLE_HOME,/u01/app/oracle/product/19c/dbhome_1)
    - Everything but the TEST instance: not(sid(TEST))";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DiscoveryArg {
    /// pmon processes of the local process table
    Process,
    /// Database resources of the cluster, running locally
    Cluster,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClientArg {
    /// sqlplus -S / as sysdba
    Sqlplus,
    /// OCI through this binary, run as the database owner
    Native,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = AFTER_HELP)]
struct Cli {
    #[arg(long, value_enum, default_value_t = DiscoveryArg::Process)]
    discovery: DiscoveryArg,

    #[arg(long, env = "CRSCTL", help = "crsctl path, defaults to $GRID_HOME/bin/crsctl then PATH")]
    crsctl: Option<PathBuf>,

    #[arg(
        short = 'x',
        long,
        action = clap::ArgAction::Append,
        help = "Skip instances whose pmon name contains this marker, replaces the defaults (+ASM, +APX, MGMTDB)"
    )]
    exclude: Vec<String>,

    #[arg(short, long, help = "Filter to consider only a subset of instances. See below for syntax")]
    filter: Option<String>,

    #[arg(long, env = "ORATAB", default_value = DEFAULT_ORATAB)]
    oratab: PathBuf,

    #[arg(short, long, value_enum, default_value_t = ClientArg::Sqlplus)]
    client: ClientArg,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(hide = true)]
    Query {
        #[arg(long)]
        pdb: Option<String>,

        #[arg(long)]
        no_open_mode: bool,
    },
    /// List discovered databases and their environment
    Instances,
    /// Used size of each PDB
    Report {
        #[arg(long, help = "Don't check open mode, query every PDB")]
        no_open_mode: bool,

        #[arg(long, help = "Append GB to sizes")]
        unit_suffix: bool,

        #[arg(long, help = "Print column titles")]
        header: bool,

        #[arg(long, default_value = DEFAULT_DOWN_LABEL)]
        down_label: String,

        #[arg(long, value_enum, default_value_t = FormatArg::Text)]
        format: FormatArg,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Commands::Query { pdb, no_open_mode } = &cli.commands {
        // subprogram started by the native client, in the database owner context
        // parent reads stdout as JSON, only the result must go there
        match native::run_query(pdb.as_deref(), !no_open_mode) {
            Ok(json) => {
                println!("{json}");
                std::process::exit(0);
            }
            Err(e) => {
                error!("{e:#}");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = run(cli) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if uzers::get_effective_uid() != 0 {
        warn!("Not running as root, only databases of the current user can be reached");
    }

    let filter = cli
        .filter
        .as_deref()
        .map(filters::parse_filter)
        .transpose()?;

    let exclusions = if cli.exclude.is_empty() {
        Exclusions::default()
    } else {
        Exclusions::new(&cli.exclude)
    };

    let discovery = match cli.discovery {
        DiscoveryArg::Process => DiscoveryMode::Process,
        DiscoveryArg::Cluster => DiscoveryMode::Cluster {
            crsctl: discovery::locate_crsctl(cli.crsctl.clone())?,
        },
    };

    let backend = match cli.client {
        ClientArg::Sqlplus => Backend::SqlPlus,
        ClientArg::Native => Backend::Native,
    };

    match cli.commands {
        Commands::Query { .. } => unreachable!(),
        Commands::Instances => {
            let instances = discovery::discover(&discovery, &exclusions, filter.as_deref())?;
            let mut resolver = EnvironmentResolver::from_oratab_file(&cli.oratab);

            println!("{:<20} {:<16} {:>8} {:>8}  ORACLE_HOME", "DATABASE", "SID", "PID", "UID");
            for instance in &instances {
                let home = match resolver.resolve(instance) {
                    Ok(ctx) => ctx.oracle_home.display().to_string(),
                    Err(e) => {
                        warn!("{e}");
                        "-".to_string()
                    }
                };
                println!(
                    "{:<20} {:<16} {:>8} {:>8}  {}",
                    instance.canonical_name,
                    instance.sid,
                    instance.pid.map(|p| p.to_string()).unwrap_or_default(),
                    instance.uid.map(|u| u.to_string()).unwrap_or_default(),
                    home
                );
            }
        }
        Commands::Report {
            no_open_mode,
            unit_suffix,
            header,
            down_label,
            format,
        } => {
            let format = match format {
                FormatArg::Text => ReportFormat::Text(TextFormat {
                    unit_suffix,
                    header,
                    down_label,
                }),
                FormatArg::Json => ReportFormat::Json,
            };
            let config = PassConfig {
                discovery,
                exclusions,
                filter,
                oratab: cli.oratab,
                backend,
                with_open_mode: !no_open_mode,
                format,
            };

            let chrono = std::time::Instant::now();
            let summary = match pdbsize::run(config, std::io::stdout().lock()) {
                Err(InventoryError::DiscoveryEmpty) => anyhow::bail!("no databases found"),
                x => x.context("Inventory pass failed")?,
            };
            info!(
                "{} database(s) reported, {} skipped; PDBs: {} ok, {} down, {} error(s) in {:?}",
                summary.databases,
                summary.skipped_databases,
                summary.ok,
                summary.down,
                summary.errors,
                chrono.elapsed()
            );
        }
    }

    Ok(())
}
