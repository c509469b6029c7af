use flate2::read::GzDecoder;
use tracing::{debug, info};
use url::Url;
use walkdir::WalkDir;

use std::{
    borrow::Cow,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{Error, Result};

/// Every archived report lives under this key prefix.
pub const ARCHIVE_PREFIX: &str = "itunes";
/// Daily sales reports carry this in their file name.
pub const DAILY_REPORT_MARKER: &str = "S_D_";
/// How long a download link for an archived report stays valid.
pub const LINK_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// A bucket of report files, addressed by `/`-separated keys.
///
/// Objects are only ever added; nothing here modifies or removes one.
pub trait Archive {
    /// A human-readable name for log messages.
    fn name(&self) -> String;

    /// Returns every key starting with `prefix`, in lexical order.
    ///
    /// # Errors
    ///
    /// Returns any error from reading the underlying store.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Returns the contents of the object at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no such object, or it can't be read.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Stores `body` at `key`, replacing any existing object.
    ///
    /// # Errors
    ///
    /// Returns any error from writing to the underlying store.
    fn put(&self, key: &str, body: &[u8]) -> Result<()>;

    /// Returns a URL from which the object at `key` can be downloaded for
    /// at least `expires_in`.
    ///
    /// # Errors
    ///
    /// Returns an error if no URL can be formed for `key`.
    fn download_url(&self, key: &str, expires_in: Duration) -> Result<Url>;
}

/// An [`Archive`] kept in a local directory, one file per key.
///
/// If the directory is published by a web server, give its address as
/// `public_url` and download links will point there; otherwise they are
/// `file://` URLs.
#[derive(Debug)]
pub struct DirArchive {
    root: PathBuf,
    public_url: Option<Url>,
}

impl DirArchive {
    /// Opens the archive at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns any error from creating or resolving `root`.
    pub fn open(root: impl AsRef<Path>, public_url: Option<Url>) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let root = root.as_ref().canonicalize()?;
        let public_url = public_url.map(|mut url| {
            if !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
            url
        });
        Ok(Self { root, public_url })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Archive for DirArchive {
    fn name(&self) -> String {
        self.root.display().to_string()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path(key)).map_err(|source| Error::Archive {
            key: key.to_string(),
            source,
        })
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, body)?;
        Ok(())
    }

    fn download_url(&self, key: &str, expires_in: Duration) -> Result<Url> {
        let Some(base) = &self.public_url else {
            return Url::from_file_path(self.path(key)).map_err(|()| Error::Archive {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not an absolute path"),
            });
        };
        let mut url = base.join(key)?;
        let expires = (SystemTime::now() + expires_in)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string());
        Ok(url)
    }
}

/// Decompresses every archived daily report and concatenates their contents.
///
/// Reports are read in listing order; the result is not sorted.
///
/// # Errors
///
/// Returns an error if the archive can't be listed, or an object can't be
/// read or isn't valid gzip data.
pub fn collect_source(archive: &dyn Archive) -> Result<String> {
    info!(archive = %archive.name(), "reading archived download reports");
    let mut buffer = String::new();
    let mut count = 0;
    for key in archive.list(ARCHIVE_PREFIX)? {
        if !key.contains(DAILY_REPORT_MARKER) {
            continue;
        }
        debug!(key = %key, "decompressing report");
        let body = archive.get(&key)?;
        let mut text = Vec::new();
        GzDecoder::new(body.as_slice())
            .read_to_end(&mut text)
            .map_err(|source| Error::Archive {
                key: key.clone(),
                source,
            })?;
        match String::from_utf8_lossy(&text) {
            Cow::Borrowed(text) => buffer.push_str(text),
            Cow::Owned(text) => {
                debug!(key = %key, "report is not valid UTF-8, replacing bad bytes");
                buffer.push_str(&text);
            }
        }
        if !buffer.is_empty() && !buffer.ends_with('\n') {
            buffer.push('\n');
        }
        count += 1;
    }
    info!(count, "done reading download reports");
    Ok(buffer)
}

/// Returns a year-long download link for the newest archived report.
///
/// Report names embed their date, so the newest is the last key in lexical
/// order. Returns `None` if the archive is empty.
///
/// # Errors
///
/// Returns any error from listing the archive or forming the link.
pub fn latest_download_link(archive: &dyn Archive) -> Result<Option<Url>> {
    let keys = archive.list(ARCHIVE_PREFIX)?;
    let Some(latest) = keys.iter().max() else {
        return Ok(None);
    };
    debug!(key = %latest, "linking latest report");
    archive.download_url(latest, LINK_LIFETIME).map(Some)
}
