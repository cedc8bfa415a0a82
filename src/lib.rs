// Inventory of Oracle pluggable databases running on this host
//
// pmon processes (or cluster resources) -> connection context -> v$pdbs -> used size per PDB
//
// cat /etc/oratab
// crsctl stat res -t
// sqlplus -S / as sysdba <<< "select name, open_mode from v\$pdbs;"

pub mod client;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod filters;
pub mod native;
pub mod pass;
pub mod pdbs;
pub mod report;

pub use discovery::{DatabaseInstance, DiscoveryMode, Exclusions};
pub use environment::{ConnectionContext, EnvironmentResolver};
pub use error::{InventoryError, InventoryResult};
pub use pass::{run, run_pass, Backend, PassConfig, PassSummary};
pub use pdbs::{OpenMode, PluggableDatabase};
pub use report::{ReportFormat, ReportStatus, ReportWriter, SizeComponents, SizeReport, TextFormat};
