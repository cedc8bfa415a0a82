use std::{io::Write, sync::OnceLock};

use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    client::SqlClient,
    environment::ConnectionContext,
    error::InventoryError,
    pdbs::{PluggableDatabase, SEPARATOR},
};

pub const NAME_WIDTH: usize = 20;
pub const VALUE_WIDTH: usize = 15;
pub const DEFAULT_DOWN_LABEL: &str = "pdb is down";
pub const ERROR_LABEL: &str = "error";

const GIB: f64 = (1u64 << 30) as f64;

/// Byte totals, each from an independent scan
pub const SIZE_SQL: &str = "select (select nvl(sum(bytes), 0) from dba_data_files) || '|' ||
       (select nvl(sum(bytes), 0) from dba_temp_files) || '|' ||
       (select nvl(sum(bytes), 0) from v$log) || '|' ||
       (select nvl(sum(bytes), 0) from dba_free_space)
  from dual;";

/// Totals returned by the size query, in bytes
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeComponents {
    pub datafile_bytes: u64,
    pub tempfile_bytes: u64,
    pub redolog_bytes: u64,
    pub free_bytes: u64,
}

impl SizeComponents {
    /// (datafiles + tempfiles + redo logs - free space) in GiB, rounded to 2 decimals
    pub fn used_gigabytes(&self) -> f64 {
        let allocated =
            self.datafile_bytes as f64 + self.tempfile_bytes as f64 + self.redolog_bytes as f64;
        let used = (allocated - self.free_bytes as f64) / GIB;
        // -0.0 would print as -0.00
        (used * 100.0).round() / 100.0 + 0.0
    }
}

/// Parse the `datafiles|tempfiles|redologs|free` row
pub fn parse_size_row(output: &str) -> Result<SizeComponents, String> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| "empty output".to_string())?;

    let values: Vec<u64> = line
        .split(SEPARATOR)
        .map(|v| v.trim().parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("can't parse {line:?}: {e}"))?;

    match values[..] {
        [datafile_bytes, tempfile_bytes, redolog_bytes, free_bytes] => Ok(SizeComponents {
            datafile_bytes,
            tempfile_bytes,
            redolog_bytes,
            free_bytes,
        }),
        _ => Err(format!("expected 4 columns, got {line:?}")),
    }
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_$#]{0,127}$").expect("valid regex"))
}

/// PDB names go into `alter session set container`, they must be plain identifiers
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

/// Container switch followed by the size query
pub fn size_script(pdb: &str) -> String {
    format!("alter session set container = \"{pdb}\";\n{SIZE_SQL}")
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportStatus {
    Ok,
    Down,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SizeReport {
    pub cdb: String,
    /// Lowercase
    #[serde(rename = "pdb")]
    pub pdb_name: String,
    #[serde(rename = "used_gb")]
    pub used_gigabytes: Option<f64>,
    pub status: ReportStatus,
}

impl SizeReport {
    fn new(cdb: &str, pdb: &str, used_gigabytes: Option<f64>, status: ReportStatus) -> Self {
        Self {
            cdb: cdb.to_lowercase(),
            pdb_name: pdb.to_lowercase(),
            used_gigabytes,
            status,
        }
    }

    pub fn ok(cdb: &str, pdb: &str, used_gigabytes: f64) -> Self {
        Self::new(cdb, pdb, Some(used_gigabytes), ReportStatus::Ok)
    }

    pub fn down(cdb: &str, pdb: &str) -> Self {
        Self::new(cdb, pdb, None, ReportStatus::Down)
    }

    pub fn error(cdb: &str, pdb: &str) -> Self {
        Self::new(cdb, pdb, None, ReportStatus::Error)
    }
}

/// Compute the report of one PDB
///
/// Only writable PDBs are queried, failures become an ERROR report.
pub fn report_pdb(
    client: &dyn SqlClient,
    ctx: &ConnectionContext,
    pdb: &PluggableDatabase,
) -> SizeReport {
    let db = ctx.db_name.as_str();

    if let Some(open_mode) = pdb.open_mode.filter(|_| !pdb.is_writable()) {
        let closed = InventoryError::PdbClosed {
            pdb: pdb.name.clone(),
            open_mode: open_mode.to_string(),
        };
        info!("{db}: {closed}");
        return SizeReport::down(db, &pdb.name);
    }

    if !is_valid_identifier(&pdb.name) {
        warn!("{}", InventoryError::size_query(db, &pdb.name, "not a valid identifier"));
        return SizeReport::error(db, &pdb.name);
    }

    match client.size_components(ctx, &pdb.name) {
        Ok(components) => SizeReport::ok(db, &pdb.name, components.used_gigabytes()),
        Err(e) => {
            warn!("{e}");
            SizeReport::error(db, &pdb.name)
        }
    }
}

/// Fixed width text layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFormat {
    /// Append ` GB` to sizes
    pub unit_suffix: bool,
    /// Column titles before the first line
    pub header: bool,
    pub down_label: String,
}

impl Default for TextFormat {
    fn default() -> Self {
        Self {
            unit_suffix: false,
            header: false,
            down_label: DEFAULT_DOWN_LABEL.to_string(),
        }
    }
}

impl TextFormat {
    pub fn header_line(&self) -> Option<String> {
        self.header.then(|| {
            format!(
                "{:<name$}{:<value_w$}",
                "PDB",
                "USED_GB",
                name = NAME_WIDTH,
                value_w = VALUE_WIDTH
            )
        })
    }

    pub fn line(&self, report: &SizeReport) -> String {
        let value = match (report.status, report.used_gigabytes) {
            (ReportStatus::Ok, Some(size)) if self.unit_suffix => format!("{size:.2} GB"),
            (ReportStatus::Ok, Some(size)) => format!("{size:.2}"),
            (ReportStatus::Down, _) => self.down_label.clone(),
            _ => ERROR_LABEL.to_string(),
        };
        format!(
            "{:<name$}{:<value_w$}",
            report.pdb_name,
            value,
            name = NAME_WIDTH,
            value_w = VALUE_WIDTH
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFormat {
    Text(TextFormat),
    /// One JSON object per line
    Json,
}

/// Writes reports to the primary output, nothing else goes there
pub struct ReportWriter<W: Write> {
    out: W,
    format: ReportFormat,
    started: bool,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(out: W, format: ReportFormat) -> Self {
        Self {
            out,
            format,
            started: false,
        }
    }

    pub fn write(&mut self, report: &SizeReport) -> std::io::Result<()> {
        match &self.format {
            ReportFormat::Text(text) => {
                if !self.started {
                    if let Some(header) = text.header_line() {
                        writeln!(self.out, "{header}")?;
                    }
                }
                writeln!(self.out, "{}", text.line(report))?;
            }
            ReportFormat::Json => {
                let line = serde_json::to_string(report)?;
                writeln!(self.out, "{line}")?;
            }
        }
        self.started = true;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB_U: u64 = 1 << 30;

    #[test]
    fn test_used_gigabytes() {
        let components = SizeComponents {
            datafile_bytes: 70 * GIB_U,
            tempfile_bytes: 20 * GIB_U,
            redolog_bytes: 10 * GIB_U,
            free_bytes: 20 * GIB_U,
        };
        assert_eq!(components.used_gigabytes(), 80.0);

        let components = SizeComponents {
            datafile_bytes: GIB_U + GIB_U / 3,
            ..Default::default()
        };
        assert_eq!(components.used_gigabytes(), 1.33);
    }

    #[test]
    fn test_free_space_above_allocated() {
        let components = SizeComponents {
            datafile_bytes: GIB_U,
            free_bytes: GIB_U + (1 << 20),
            ..Default::default()
        };
        assert_eq!(format!("{:.2}", components.used_gigabytes()), "0.00");
        let report = SizeReport::ok("orcl", "salesdb", components.used_gigabytes());
        assert_eq!(
            TextFormat::default().line(&report),
            "salesdb             0.00           "
        );
    }

    #[test]
    fn test_parse_size_row() {
        let components = parse_size_row("\n  1073741824|536870912|209715200|1048576\n").unwrap();
        assert_eq!(
            components,
            SizeComponents {
                datafile_bytes: 1073741824,
                tempfile_bytes: 536870912,
                redolog_bytes: 209715200,
                free_bytes: 1048576,
            }
        );

        assert!(parse_size_row("").is_err());
        assert!(parse_size_row("1|2|3").is_err());
        assert!(parse_size_row("ORA-01031: insufficient privileges").is_err());
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("SALESDB"));
        assert!(is_valid_identifier("PDB_2$X#"));
        assert!(!is_valid_identifier("2PDB"));
        assert!(!is_valid_identifier("X\"; drop user y; --"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_size_script() {
        let script = size_script("SALESDB");
        assert!(script.starts_with("alter session set container = \"SALESDB\";\n"));
        assert!(script.ends_with(SIZE_SQL));
    }

    #[test]
    fn test_text_line() {
        let format = TextFormat::default();
        let line = format.line(&SizeReport::ok("orcl", "salesdb", 80.0));
        assert_eq!(line, "salesdb             80.00          ");
        assert_eq!(line.len(), NAME_WIDTH + VALUE_WIDTH);

        let line = format.line(&SizeReport::down("orcl", "HRDB"));
        assert_eq!(line, "hrdb                pdb is down    ");

        let line = format.line(&SizeReport::error("orcl", "hrdb"));
        assert_eq!(line, "hrdb                error          ");
    }

    #[test]
    fn test_text_line_variants() {
        let format = TextFormat {
            unit_suffix: true,
            header: true,
            down_label: "down".to_string(),
        };
        assert_eq!(
            format.line(&SizeReport::ok("orcl", "salesdb", 1234.5)),
            "salesdb             1234.50 GB     "
        );
        assert_eq!(
            format.line(&SizeReport::down("orcl", "hrdb")),
            "hrdb                down           "
        );
        assert_eq!(
            format.header_line().unwrap(),
            "PDB                 USED_GB        "
        );
        assert!(TextFormat::default().header_line().is_none());
    }

    #[test]
    fn test_long_names_are_not_truncated() {
        let report = SizeReport::ok("orcl", "a_very_long_pdb_name_x", 1.0);
        let line = TextFormat::default().line(&report);
        assert_eq!(line, "a_very_long_pdb_name_x1.00           ");
    }

    #[test]
    fn test_writer() {
        let mut writer = ReportWriter::new(
            Vec::new(),
            ReportFormat::Text(TextFormat {
                header: true,
                ..Default::default()
            }),
        );
        writer.write(&SizeReport::ok("orcl", "salesdb", 80.0)).unwrap();
        writer.write(&SizeReport::down("orcl", "hrdb")).unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(
            out,
            "PDB                 USED_GB        \n\
             salesdb             80.00          \n\
             hrdb                pdb is down    \n"
        );
    }

    #[test]
    fn test_writer_json() {
        let mut writer = ReportWriter::new(Vec::new(), ReportFormat::Json);
        writer.write(&SizeReport::ok("ORCL", "SALESDB", 80.0)).unwrap();
        writer.write(&SizeReport::down("orcl", "hrdb")).unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["cdb"], "orcl");
        assert_eq!(lines[0]["pdb"], "salesdb");
        assert_eq!(lines[0]["status"], "OK");
        assert_eq!(lines[0]["used_gb"], 80.0);
        assert_eq!(lines[1]["status"], "DOWN");
        assert!(lines[1]["used_gb"].is_null());
    }
}
