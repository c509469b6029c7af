use anyhow::{Context, Result};
use chrono::{Days, Local};
use clap::{CommandFactory, Parser};
use reqwest::blocking::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::{io, process};

use sales_digest::{
    chart::{fetch_png, Charts},
    collect_source, deliver,
    email::inline_images,
    latest_download_link, parse_records, Aggregator, Args, Config, Digest, DirArchive, Error,
    SmtpMailer,
};

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e @ Error::MissingCredential(_)) => {
            eprintln!("{e}\n");
            Args::command().print_help()?;
            process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };
    run(&config)
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::builder()
        .with_default_directive(args.log_level().into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn run(config: &Config) -> Result<()> {
    let archive = DirArchive::open(&config.bucket, config.bucket_url.clone())
        .with_context(|| format!("opening archive {}", config.bucket.display()))?;

    if let Some((ingestor, credentials)) = &config.fetch {
        let key = ingestor
            .fetch_and_archive(&archive, credentials, config.dry_run)
            .context("fetching the latest report")?;
        info!(key = %key, "fetched the latest report");
    }

    if !config.daily && !config.weekly {
        return Ok(());
    }
    let source = collect_source(&archive)?;
    let records = parse_records(&source);
    info!(records = records.len(), "building summaries");
    let aggregator = Aggregator::new(config.breakdown);
    let daily = config.daily.then(|| aggregator.build_daily(&records));
    let weekly = config.weekly.then(|| aggregator.build_weekly(&records));

    for report in daily.iter().chain(weekly.iter()) {
        if config.verbose {
            println!("# {} summary", report.granularity());
            report.write_tsv(io::stdout().lock())?;
        } else if config.delivery.is_none() {
            println!("{report}");
        }
    }

    let Some(delivery) = &config.delivery else {
        return Ok(());
    };
    let download_link = latest_download_link(&archive)?;
    let yesterday = Local::now().date_naive() - Days::new(1);
    let digest =
        Digest::new(daily, weekly, download_link, yesterday)?.with_breakdown(config.breakdown);
    let charts = Charts::for_reports(digest.daily(), digest.weekly(), &config.chart_service);
    let client = Client::builder().build()?;
    let images = inline_images(&charts, |url| fetch_png(&client, url));
    let message = digest
        .compose(&delivery.email, images)
        .context("composing the report email")?;
    let mailer = SmtpMailer::new(&delivery.smtp)?;
    deliver(&mailer, &message, config.dry_run);
    Ok(())
}
