use std::process::ExitStatus;

/// Errors that abort a run.
///
/// Noisy input (unrecognised lines, unknown download codes) is never an
/// error; those rows are skipped by [`crate::parse_records`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("--{0} is a required option")]
    MissingCredential(&'static str),

    #[error("ingestion command {command:?} failed with {status}")]
    IngestionFailed { command: String, status: ExitStatus },

    #[error("no downloaded report matching {pattern} was found")]
    NoOutputFile { pattern: String },

    #[error("neither a daily nor a weekly report was given")]
    NoReports,

    #[error("reading archive object {key}: {source}")]
    Archive {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Template(#[from] tera::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error("composing email: {0}")]
    Email(String),

    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error(transparent)]
    Pattern(#[from] regex::Error),

    #[error("the ingestion command is empty")]
    EmptyCommand,

    #[error("bad ingestion command: {0}")]
    Command(#[from] shell_words::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
