use chrono::NaiveDate;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use serde::Serialize;
use tera::{Context, Tera};
use tracing::{debug, error, info};
use url::Url;

use crate::{
    chart::{Charts, CHART_HEIGHT, CHART_WIDTH},
    config::SmtpSettings,
    report::Report,
    Error, Result,
};

const TEMPLATE: &str = include_str!("../templates/digest.html");

/// Date format for the subject line and heading.
const HEADING_DATE_FORMAT: &str = "%A, %B %d, %Y";

/// The latest figures shown at the top of a digest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Headline {
    pub latest_daily: u64,
    pub latest_weekly: u64,
    pub upgrades: u64,
    pub educational: u64,
    pub cumulative: u64,
}

/// A chart image to be embedded in the HTML body.
#[derive(Clone, Debug)]
pub struct InlineImage {
    pub cid: &'static str,
    pub alt: &'static str,
    pub png: Vec<u8>,
}

#[derive(Serialize)]
struct Figure {
    label: &'static str,
    value: String,
}

#[derive(Serialize)]
struct ImageRef {
    cid: &'static str,
    alt: &'static str,
}

#[derive(Serialize)]
struct View {
    report_date: String,
    figures: Vec<Figure>,
    images: Vec<ImageRef>,
    width: u32,
    height: u32,
    download_link: Option<String>,
}

/// The summary email for one run.
#[derive(Clone, Debug)]
pub struct Digest {
    daily: Option<Report>,
    weekly: Option<Report>,
    download_link: Option<Url>,
    report_date: NaiveDate,
    breakdown: bool,
}

impl Digest {
    /// Creates a digest of the reports for `report_date`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoReports`] if both reports are missing.
    pub fn new(
        daily: Option<Report>,
        weekly: Option<Report>,
        download_link: Option<Url>,
        report_date: NaiveDate,
    ) -> Result<Self> {
        if daily.is_none() && weekly.is_none() {
            return Err(Error::NoReports);
        }
        Ok(Self {
            daily,
            weekly,
            download_link,
            report_date,
            breakdown: true,
        })
    }

    /// Sets whether upgrade and educational figures are shown.
    #[must_use]
    pub fn with_breakdown(mut self, breakdown: bool) -> Self {
        self.breakdown = breakdown;
        self
    }

    #[must_use]
    pub fn daily(&self) -> Option<&Report> {
        self.daily.as_ref()
    }

    #[must_use]
    pub fn weekly(&self) -> Option<&Report> {
        self.weekly.as_ref()
    }

    /// Returns the latest figures. Anything a missing or empty report would
    /// have supplied is zero.
    #[must_use]
    pub fn headline(&self) -> Headline {
        let latest = |report: Option<&Report>| report.and_then(|r| r.last()).map(|(_, b)| *b);
        let daily = latest(self.daily());
        let weekly = latest(self.weekly());
        let main = daily.or(weekly).unwrap_or_default();
        Headline {
            latest_daily: daily.map_or(0, |b| b.installs),
            latest_weekly: weekly.map_or(0, |b| b.installs),
            upgrades: main.upgrades,
            educational: main.educational,
            cumulative: main.cumulative,
        }
    }

    #[must_use]
    pub fn subject(&self) -> String {
        format!(
            "Sales report for {}",
            self.report_date.format(HEADING_DATE_FORMAT)
        )
    }

    fn figures(&self) -> Vec<Figure> {
        let h = self.headline();
        let mut figures = Vec::new();
        if self.daily.is_some() {
            figures.push(Figure {
                label: "Downloads",
                value: thousands(h.latest_daily),
            });
        }
        if self.weekly.is_some() {
            figures.push(Figure {
                label: "This week",
                value: thousands(h.latest_weekly),
            });
        }
        if self.breakdown {
            figures.push(Figure {
                label: "Updates",
                value: thousands(h.upgrades),
            });
            figures.push(Figure {
                label: "Educational",
                value: thousands(h.educational),
            });
        }
        figures.push(Figure {
            label: "Cumulative",
            value: thousands(h.cumulative),
        });
        figures
    }

    /// Returns the plain-text body, for mail clients that won't show HTML.
    #[must_use]
    pub fn text_body(&self) -> String {
        let mut text = format!("{}\n\n", self.subject());
        for figure in self.figures() {
            text.push_str(&format!("{}: {}\n", figure.label, figure.value));
        }
        if let Some(link) = &self.download_link {
            text.push_str(&format!("\nDownload today's report: {link}\n"));
        }
        text
    }

    /// Renders the HTML body, referring to `images` by content ID.
    ///
    /// # Errors
    ///
    /// Returns any error from rendering the template.
    pub fn html_body(&self, images: &[InlineImage]) -> Result<String> {
        let view = View {
            report_date: self.report_date.format(HEADING_DATE_FORMAT).to_string(),
            figures: self.figures(),
            images: images
                .iter()
                .map(|i| ImageRef {
                    cid: i.cid,
                    alt: i.alt,
                })
                .collect(),
            width: CHART_WIDTH,
            height: CHART_HEIGHT,
            download_link: self.download_link.as_ref().map(Url::to_string),
        };
        Ok(Tera::one_off(
            TEMPLATE,
            &Context::from_serialize(&view)?,
            true,
        )?)
    }

    /// Builds the email from and to `address`, with `images` attached inline.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` isn't a valid mailbox, or the message
    /// can't be rendered or assembled.
    pub fn compose(&self, address: &str, images: Vec<InlineImage>) -> Result<Message> {
        let mailbox: Mailbox = address
            .parse()
            .map_err(|e| Error::Email(format!("bad address {address:?}: {e}")))?;
        let html = self.html_body(&images)?;
        let png = ContentType::parse("image/png").map_err(|e| Error::Email(e.to_string()))?;
        let mut related =
            MultiPart::related().multipart(MultiPart::alternative_plain_html(self.text_body(), html));
        for image in images {
            related = related.singlepart(
                Attachment::new_inline(image.cid.to_string()).body(image.png, png.clone()),
            );
        }
        Message::builder()
            .from(mailbox.clone())
            .to(mailbox)
            .subject(self.subject())
            .multipart(related)
            .map_err(|e| Error::Email(e.to_string()))
    }
}

/// Fetches whichever charts exist, in the order they appear in the email.
pub fn inline_images(
    charts: &Charts,
    mut fetch: impl FnMut(&Url) -> Option<Vec<u8>>,
) -> Vec<InlineImage> {
    [
        (&charts.daily, "daily.png", "Daily Downloads"),
        (&charts.weekly, "weekly.png", "Weekly Downloads"),
        (&charts.cumulative, "cumulative.png", "Cumulative Downloads"),
        (&charts.daily_recent, "daily-recent.png", "Recent Daily Downloads"),
    ]
    .into_iter()
    .filter_map(|(url, cid, alt)| {
        let png = fetch(url.as_ref()?)?;
        Some(InlineImage { cid, alt, png })
    })
    .collect()
}

/// Sends email messages.
pub trait Mailer {
    /// Sends `message` to its recipients.
    ///
    /// # Errors
    ///
    /// Returns any error from the mail transport.
    fn send(&self, message: &Message) -> Result<()>;
}

/// A [`Mailer`] that relays through an SMTP server using STARTTLS.
pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    /// # Errors
    ///
    /// Returns an error if the TLS settings for `settings.host` can't be set up.
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let mut builder = SmtpTransport::starttls_relay(&settings.host)?.port(settings.port);
        if let (Some(login), Some(password)) = (&settings.login, &settings.password) {
            builder = builder.credentials(Credentials::new(login.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
        })
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, message: &Message) -> Result<()> {
        self.transport.send(message)?;
        Ok(())
    }
}

/// Sends `message`, unless this is a dry run.
///
/// A failure to send is logged rather than returned: by now the reports
/// have been archived and built, and there is nothing to undo. Returns
/// whether the message was sent.
pub fn deliver(mailer: &dyn Mailer, message: &Message, dry_run: bool) -> bool {
    if dry_run {
        info!("dry run, not sending the report email");
        debug!(message = %String::from_utf8_lossy(&message.formatted()));
        return false;
    }
    match mailer.send(message) {
        Ok(()) => {
            info!("sent the report email");
            true
        }
        Err(e) => {
            error!(error = %e, "couldn't send the report email");
            false
        }
    }
}

/// Formats `n` with commas between groups of three digits.
fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
