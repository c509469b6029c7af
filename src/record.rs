use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use tracing::debug;

/// Lines starting with this are column headers, one per concatenated file.
pub const HEADER_MARKER: &str = "Provider";
/// Every sales row starts with this provider name.
pub const RECORD_MARKER: &str = "APPLE";

pub const COLUMN_VERSION: usize = 5;
pub const COLUMN_DOWNLOAD_TYPE: usize = 6;
pub const COLUMN_UNITS: usize = 7;
pub const COLUMN_DATE: usize = 9;
pub const COLUMN_PROMO: usize = 16;

pub const DOWNLOAD_TYPE_INSTALL: &str = "1T";
pub const DOWNLOAD_TYPE_UPGRADE: &str = "7T";
pub const PROMO_EDUCATIONAL: &str = "EDU";

/// Date format used by the sales portal.
pub const DATE_FORMAT: &str = "%m/%d/%Y";

/// What kind of download a sales row counts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DownloadType {
    Install,
    Upgrade,
    /// Any other product type code. Kept so it can be logged, never counted.
    Other(String),
}

impl From<&str> for DownloadType {
    fn from(code: &str) -> Self {
        match code {
            DOWNLOAD_TYPE_INSTALL => Self::Install,
            DOWNLOAD_TYPE_UPGRADE => Self::Upgrade,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One row of a daily sales report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SalesRecord {
    pub date: NaiveDate,
    pub download_type: DownloadType,
    pub units: u64,
    pub promo: String,
    pub version: String,
}

impl SalesRecord {
    /// Reports whether this row is an install through the educational channel.
    #[must_use]
    pub fn is_educational(&self) -> bool {
        self.promo == PROMO_EDUCATIONAL
    }
}

impl TryFrom<&StringRecord> for SalesRecord {
    type Error = anyhow::Error;

    fn try_from(row: &StringRecord) -> Result<Self, Self::Error> {
        let field = |index: usize| {
            row.get(index)
                .map(str::trim)
                .ok_or_else(|| anyhow!("row has {} columns, wanted {}", row.len(), index + 1))
        };
        let date = field(COLUMN_DATE)?;
        let units = field(COLUMN_UNITS)?;
        Ok(Self {
            date: NaiveDate::parse_from_str(date, DATE_FORMAT)
                .with_context(|| format!("bad date {date:?}"))?,
            download_type: DownloadType::from(field(COLUMN_DOWNLOAD_TYPE)?),
            units: units
                .parse()
                .with_context(|| format!("bad unit count {units:?}"))?,
            promo: row
                .get(COLUMN_PROMO)
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            version: field(COLUMN_VERSION)?.to_string(),
        })
    }
}

/// Parses the sales rows out of one or more concatenated tab-delimited reports.
///
/// Header lines are dropped. Lines that don't start with [`RECORD_MARKER`],
/// and rows whose date or unit count can't be parsed, are logged and skipped.
/// A row that stops before the promo column is kept with an empty promo code:
/// the upstream format changes from time to time, and a stray line should
/// never cost us the whole report.
#[must_use]
pub fn parse_records(source: &str) -> Vec<SalesRecord> {
    let mut retained = String::with_capacity(source.len());
    for line in source.lines() {
        if line.trim().is_empty() || line.starts_with(HEADER_MARKER) {
            continue;
        }
        if !line.starts_with(RECORD_MARKER) {
            debug!(line, "skipping unrecognised line");
            continue;
        }
        retained.push_str(line);
        retained.push('\n');
    }
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(retained.as_bytes());
    let mut records = Vec::new();
    for result in rdr.records() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                debug!(error = %e, "skipping unreadable row");
                continue;
            }
        };
        match SalesRecord::try_from(&row) {
            Ok(record) => records.push(record),
            Err(e) => debug!(error = %e, "skipping malformed row"),
        }
    }
    records
}
