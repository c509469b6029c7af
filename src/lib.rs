#![doc = include_str!("../README.md")]
pub mod archive;
pub mod chart;
pub mod config;
pub mod email;
mod error;
pub mod ingest;
pub mod record;
pub mod report;

pub use archive::{collect_source, latest_download_link, Archive, DirArchive};
pub use config::{Args, Config};
pub use email::{deliver, Digest, Mailer, SmtpMailer};
pub use error::{Error, Result};
pub use ingest::{Ingestor, PortalCredentials};
pub use record::{parse_records, DownloadType, SalesRecord};
pub use report::{Aggregator, Bucket, Granularity, Period, Report};
