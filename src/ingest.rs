use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    archive::{Archive, ARCHIVE_PREFIX, DAILY_REPORT_MARKER},
    Error, Result,
};

/// The command that downloads the latest report, unless configured otherwise.
pub const DEFAULT_INGEST_COMMAND: &str = "java Autoingestion";

/// Arguments after the credentials: which report to download.
const REPORT_SELECTOR: [&str; 3] = ["Sales", "Daily", "Summary"];

/// Sign-in details for the sales portal.
#[derive(Clone)]
pub struct PortalCredentials {
    pub login: String,
    pub password: String,
    pub vendor_id: String,
}

impl std::fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("login", &self.login)
            .field("vendor_id", &self.vendor_id)
            .finish_non_exhaustive()
    }
}

/// Runs the external program that downloads sales reports from the portal.
///
/// The program is run as:
///
/// ```txt
/// COMMAND... LOGIN PASSWORD VENDOR_ID Sales Daily Summary
/// ```
///
/// in a fresh scratch directory, where it is expected to leave one file named
/// `S_D_<VENDOR_ID>_<DATE>.txt.gz`. Files the program needs beside it, such
/// as `Autoingestion.class` and its properties file, are copied into the
/// scratch directory first from the directory given to
/// [`with_support_files`](Self::with_support_files).
#[derive(Clone, Debug)]
pub struct Ingestor {
    command: Vec<String>,
    support_files: Option<PathBuf>,
}

impl Ingestor {
    /// Creates an ingestor from a shell-style command line such as
    /// `java -cp /opt/autoingestion Autoingestion`.
    ///
    /// # Errors
    ///
    /// Returns an error if `command_line` has unbalanced quotes or is empty.
    pub fn new(command_line: &str) -> Result<Self> {
        let command = shell_words::split(command_line)?;
        if command.is_empty() {
            return Err(Error::EmptyCommand);
        }
        Ok(Self {
            command,
            support_files: None,
        })
    }

    /// Copies the contents of `dir` into the scratch directory before each run.
    #[must_use]
    pub fn with_support_files(mut self, dir: impl Into<PathBuf>) -> Self {
        self.support_files = Some(dir.into());
        self
    }

    /// Downloads the latest daily report and stores it in `archive`.
    ///
    /// Returns the archive key for the report. In a dry run the report is
    /// downloaded but not stored. The scratch directory is removed however
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IngestionFailed`] if the program exits unsuccessfully,
    /// [`Error::NoOutputFile`] if it leaves no report behind, or any error
    /// from running it or storing the result. Nothing is retried.
    pub fn fetch_and_archive(
        &self,
        archive: &dyn Archive,
        credentials: &PortalCredentials,
        dry_run: bool,
    ) -> Result<String> {
        let scratch = tempfile::Builder::new().prefix("sales-digest").tempdir()?;
        let (program, args) = self.command.split_first().ok_or(Error::EmptyCommand)?;
        if let Some(dir) = &self.support_files {
            copy_tree(dir, scratch.path())?;
        }
        info!(vendor_id = %credentials.vendor_id, "retrieving the latest daily report");
        let output = Command::new(program)
            .args(args)
            .args([
                &credentials.login,
                &credentials.password,
                &credentials.vendor_id,
            ])
            .args(REPORT_SELECTOR)
            .current_dir(scratch.path())
            .output()?;
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "ingestion finished");
        if !output.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&output.stderr), "ingestion failed");
            return Err(Error::IngestionFailed {
                command: self.command.join(" "),
                status: output.status,
            });
        }

        let path = find_report(scratch.path(), &credentials.vendor_id)?;
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Err(Error::NoOutputFile {
                pattern: report_glob(&credentials.vendor_id),
            });
        };
        let key = format!("{ARCHIVE_PREFIX}/{name}");
        if dry_run {
            info!(key = %key, "dry run, not archiving the report");
        } else {
            info!(key = %key, archive = %archive.name(), "archiving the report");
            archive.put(&key, &fs::read(&path)?)?;
        }
        Ok(key)
    }
}

/// Copies every file under `from` into `to`, keeping relative paths.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            debug!(file = %relative.display(), "copying ingestion support file");
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn report_glob(vendor_id: &str) -> String {
    format!("{DAILY_REPORT_MARKER}{vendor_id}_*.txt.gz")
}

/// Returns the first downloaded report in `dir`, by name.
fn find_report(dir: &Path, vendor_id: &str) -> Result<PathBuf> {
    let pattern = Regex::new(&format!(
        r"^{}{}_.*\.txt\.gz$",
        DAILY_REPORT_MARKER,
        regex::escape(vendor_id)
    ))?;
    let mut matches = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if pattern.is_match(&entry.file_name().to_string_lossy()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    matches.into_iter().next().ok_or_else(|| Error::NoOutputFile {
        pattern: report_glob(vendor_id),
    })
}
