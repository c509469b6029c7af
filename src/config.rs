//! Command-line options and the run configuration built from them.

use clap::Parser;
use tracing::level_filters::LevelFilter;
use url::Url;

use std::path::PathBuf;

use crate::{
    chart::DEFAULT_CHART_SERVICE,
    ingest::{Ingestor, PortalCredentials, DEFAULT_INGEST_COMMAND},
    Error, Result,
};

/// Archives daily app-store sales reports and emails a download summary.
///
/// Every option can also be given in the environment variable shown.
///
/// Examples:
///   sales-digest --fetch --bucket /srv/reports
///   sales-digest --daily --weekly --email me@example.com --smtp-host smtp.example.com
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Log each step, and print the summary tables
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Download reports and build summaries, but don't archive or send anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Download the latest daily report and add it to the archive
    #[arg(long)]
    pub fetch: bool,

    /// Summarise the archive by day
    #[arg(long)]
    pub daily: bool,

    /// Summarise the archive by week
    #[arg(long)]
    pub weekly: bool,

    /// Count installs only, without upgrade and educational figures
    #[arg(long)]
    pub no_breakdown: bool,

    /// Send the summary to this address
    #[arg(short, long, env = "MAILTO", value_name = "ADDRESS")]
    pub email: Option<String>,

    /// Sales portal login
    #[arg(short, long, env = "ITUNES_CONNECT_LOGIN")]
    pub login: Option<String>,

    /// Sales portal password
    #[arg(short, long, env = "ITUNES_CONNECT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Sales portal vendor ID
    #[arg(long, env = "ITUNES_CONNECT_VENDORID")]
    pub vendor_id: Option<String>,

    /// Program that downloads a report, with any leading arguments
    #[arg(long, env = "INGEST_COMMAND", default_value = DEFAULT_INGEST_COMMAND)]
    pub ingest_command: String,

    /// Directory of files the ingestion program needs in its working
    /// directory, such as Autoingestion.class
    #[arg(long, env = "INGEST_FILES", value_name = "DIR")]
    pub ingest_files: Option<PathBuf>,

    /// Directory holding the report archive
    #[arg(short, long, env = "REPORT_BUCKET", value_name = "DIR")]
    pub bucket: Option<PathBuf>,

    /// Public address of the archive directory, for download links
    #[arg(long, env = "REPORT_BUCKET_URL", value_name = "URL")]
    pub bucket_url: Option<Url>,

    /// Outgoing mail server
    #[arg(long, env = "SMTP_HOST")]
    pub smtp_host: Option<String>,

    #[arg(long, env = "SMTP_PORT", default_value_t = 25)]
    pub smtp_port: u16,

    #[arg(long, env = "SMTP_LOGIN")]
    pub smtp_login: Option<String>,

    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    pub smtp_password: Option<String>,

    /// Chart rendering service
    #[arg(long, env = "CHART_SERVICE_URL", default_value = DEFAULT_CHART_SERVICE)]
    pub chart_service: Url,
}

impl Args {
    /// Returns the log level asked for by `--verbose` or `--quiet`.
    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::DEBUG
        } else if self.quiet {
            LevelFilter::WARN
        } else {
            LevelFilter::INFO
        }
    }
}

/// How to reach the outgoing mail server.
#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

/// Where to send the summary, and how.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub email: String,
    pub smtp: SmtpSettings,
}

/// Everything one run needs, checked up front.
#[derive(Clone, Debug)]
pub struct Config {
    pub dry_run: bool,
    pub verbose: bool,
    pub daily: bool,
    pub weekly: bool,
    pub breakdown: bool,
    pub bucket: PathBuf,
    pub bucket_url: Option<Url>,
    /// Present when `--fetch` was given.
    pub fetch: Option<(Ingestor, PortalCredentials)>,
    /// Present when a summary should be emailed.
    pub delivery: Option<Delivery>,
    pub chart_service: Url,
}

impl Config {
    /// Checks `args` and builds the configuration for this run.
    ///
    /// Only the options the requested actions need are required: portal
    /// credentials for `--fetch`, and a mail server when a summary is to be
    /// emailed. The archive is always required.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCredential`] naming the first missing option,
    /// or an error if the ingestion command can't be parsed.
    pub fn from_args(args: Args) -> Result<Self> {
        let bucket = required(args.bucket, "bucket")?;
        let fetch = if args.fetch {
            let credentials = PortalCredentials {
                login: required(args.login, "login")?,
                password: required(args.password, "password")?,
                vendor_id: required(args.vendor_id, "vendor-id")?,
            };
            let mut ingestor = Ingestor::new(&args.ingest_command)?;
            if let Some(dir) = args.ingest_files {
                ingestor = ingestor.with_support_files(dir);
            }
            Some((ingestor, credentials))
        } else {
            None
        };
        let summarise = args.daily || args.weekly;
        let delivery = match args.email {
            Some(email) if summarise => Some(Delivery {
                email,
                smtp: SmtpSettings {
                    host: required(args.smtp_host, "smtp-host")?,
                    port: args.smtp_port,
                    login: args.smtp_login,
                    password: args.smtp_password,
                },
            }),
            _ => None,
        };
        Ok(Self {
            dry_run: args.dry_run,
            verbose: args.verbose,
            daily: args.daily,
            weekly: args.weekly,
            breakdown: !args.no_breakdown,
            bucket,
            bucket_url: args.bucket_url,
            fetch,
            delivery,
            chart_service: args.chart_service,
        })
    }
}

fn required<T>(value: Option<T>, flag: &'static str) -> Result<T> {
    value.ok_or(Error::MissingCredential(flag))
}
