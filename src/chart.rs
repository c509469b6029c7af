use chrono::Days;
use reqwest::blocking::Client;
use tracing::{debug, warn};
use url::Url;

use crate::{
    report::{Period, Report},
    Result,
};

/// A chart service speaking the Google Image Charts URL dialect.
pub const DEFAULT_CHART_SERVICE: &str = "https://image-charts.com/chart";

pub const CHART_WIDTH: u32 = 700;
pub const CHART_HEIGHT: u32 = 300;

/// How many days the daily chart covers.
const DAILY_WINDOW: usize = 180;
/// How many days the recent-daily chart covers.
const RECENT_WINDOW: usize = 90;
/// The recent chart is compared with the same weekdays a year earlier.
const YEAR_AGO: Days = Days::new(52 * 7);

const COLOURS: &str = "3D7930,FF9900";
const FILL_MARKER: &str = "B,C5D4B5BB,0,0,0";
const GRID: &str = "0,10,2,6";

/// A line chart, rendered by fetching its URL from a chart service.
///
/// The first series is drawn filled; an optional second series is drawn
/// as a plain line for comparison.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LineChart {
    title: String,
    series: Vec<Vec<u64>>,
}

impl LineChart {
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            series: Vec::new(),
        }
    }

    /// Adds a data series, unless it's empty.
    #[must_use]
    pub fn series(mut self, data: &[u64]) -> Self {
        if !data.is_empty() {
            self.series.push(data.to_vec());
        }
        self
    }

    /// Returns the image URL for this chart, or `None` if it has no data.
    #[must_use]
    pub fn url(&self, service: &Url) -> Option<Url> {
        let values = self.series.iter().flatten().copied();
        let min = values.clone().min()?;
        let max = values.max()?.max(1);
        let data = self
            .series
            .iter()
            .map(|s| s.iter().map(u64::to_string).collect::<Vec<_>>().join(","))
            .collect::<Vec<_>>()
            .join("|");
        let mut url = service.clone();
        url.query_pairs_mut()
            .append_pair("cht", "lc")
            .append_pair("chs", &format!("{CHART_WIDTH}x{CHART_HEIGHT}"))
            .append_pair("chtt", &self.title)
            .append_pair("chd", &format!("t:{data}"))
            .append_pair("chds", &format!("0,{max}"))
            .append_pair("chxt", "y,r")
            .append_pair("chxr", &format!("0,0,{max}"))
            .append_pair("chxl", &format!("1:|{min}|{max}"))
            .append_pair("chco", COLOURS)
            .append_pair("chm", FILL_MARKER)
            .append_pair("chg", GRID);
        Some(url)
    }
}

/// Image URLs for the charts in a digest. Any of them may be missing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Charts {
    pub daily: Option<Url>,
    pub weekly: Option<Url>,
    pub cumulative: Option<Url>,
    pub daily_recent: Option<Url>,
}

impl Charts {
    /// Lays out the standard charts for whichever reports are present.
    ///
    /// Cumulative installs come from the daily report if there is one,
    /// otherwise from the weekly.
    #[must_use]
    pub fn for_reports(daily: Option<&Report>, weekly: Option<&Report>, service: &Url) -> Self {
        let daily_installs = daily.map(Report::installs).unwrap_or_default();
        let weekly_installs = weekly.map(Report::installs).unwrap_or_default();
        let cumulative = daily
            .or(weekly)
            .map(Report::cumulative)
            .unwrap_or_default();
        let start = daily_installs.len().saturating_sub(DAILY_WINDOW);

        let charts = Self {
            daily: LineChart::new("Daily Downloads")
                .series(&daily_installs[start..])
                .url(service),
            weekly: LineChart::new("Weekly Downloads")
                .series(&weekly_installs)
                .url(service),
            cumulative: LineChart::new("Cumulative Downloads")
                .series(&cumulative)
                .url(service),
            daily_recent: daily.and_then(|d| recent_chart(d).url(service)),
        };
        debug!(?charts, "laid out charts");
        charts
    }
}

/// The last few months of daily installs, against the same stretch a year
/// earlier when the report goes back that far.
fn recent_chart(daily: &Report) -> LineChart {
    let installs = daily.installs();
    let start = installs.len().saturating_sub(RECENT_WINDOW);
    let chart = LineChart::new("Recent Daily Downloads (filled is now)").series(&installs[start..]);
    let Some(first) = daily.periods().nth(start) else {
        return chart;
    };
    let year_ago = Period::day(first.date() - YEAR_AGO);
    match daily.position(&year_ago) {
        Some(i) => {
            let end = (i + RECENT_WINDOW).min(installs.len());
            chart.series(&installs[i..end])
        }
        None => chart,
    }
}

/// Downloads the PNG image for a chart.
///
/// Returns `None`, after logging why, if the chart service can't be reached
/// or returns an error; a digest with a missing chart is still worth sending.
#[must_use]
pub fn fetch_png(client: &Client, url: &Url) -> Option<Vec<u8>> {
    let fetch = || -> Result<Vec<u8>> {
        let response = client.get(url.clone()).send()?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    };
    match fetch() {
        Ok(png) => Some(png),
        Err(e) => {
            warn!(error = %e, %url, "couldn't fetch chart image");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::SalesRecord, Aggregator};

    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn service() -> Url {
        Url::parse(DEFAULT_CHART_SERVICE).unwrap()
    }

    fn param(url: &Url, name: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    fn daily_installs(start: NaiveDate, days: u64) -> Report {
        let records: Vec<SalesRecord> = (0..days)
            .map(|n| SalesRecord {
                date: start + Days::new(n),
                download_type: "1T".into(),
                units: n % 7 + 1,
                promo: String::new(),
                version: "1.0".into(),
            })
            .collect();
        Aggregator::default().build_daily(&records)
    }

    #[test]
    fn url_fn_encodes_series_and_axes() {
        let url = LineChart::new("Weekly Downloads")
            .series(&[3, 9, 4])
            .series(&[1, 2])
            .url(&service())
            .unwrap();
        assert_eq!(url.host_str(), Some("image-charts.com"));
        assert_eq!(param(&url, "chtt"), "Weekly Downloads");
        assert_eq!(param(&url, "chd"), "t:3,9,4|1,2");
        assert_eq!(param(&url, "chxr"), "0,0,9");
        assert_eq!(param(&url, "chxl"), "1:|1|9");
        assert_eq!(param(&url, "chs"), "700x300");
    }

    #[test]
    fn url_fn_returns_none_for_empty_chart() {
        assert_eq!(LineChart::new("Nothing").series(&[]).url(&service()), None);
    }

    #[test]
    fn for_reports_fn_tolerates_missing_reports() {
        let weekly = daily_installs(NaiveDate::from_ymd_opt(2020, 1, 6).unwrap(), 3);
        let charts = Charts::for_reports(None, Some(&weekly), &service());
        assert_eq!(charts.daily, None);
        assert_eq!(charts.daily_recent, None);
        assert!(charts.weekly.is_some());
        assert_eq!(param(&charts.cumulative.unwrap(), "chd"), "t:1,3,6");
    }

    #[test]
    fn for_reports_fn_limits_daily_chart_to_recent_days() {
        let daily = daily_installs(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 200);
        let charts = Charts::for_reports(Some(&daily), None, &service());
        let points = param(&charts.daily.unwrap(), "chd");
        assert_eq!(points.trim_start_matches("t:").split(',').count(), DAILY_WINDOW);
        assert_eq!(charts.weekly, None);
    }

    #[test]
    fn recent_chart_fn_compares_with_year_ago_when_available() {
        let short = daily_installs(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 100);
        assert_eq!(recent_chart(&short).series.len(), 1);

        let long = daily_installs(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(), 500);
        let chart = recent_chart(&long);
        assert_eq!(chart.series.len(), 2);
        assert_eq!(chart.series[0].len(), RECENT_WINDOW);
        assert_eq!(chart.series[1].len(), RECENT_WINDOW);
        // 364 days is a whole number of weeks, so the weekly pattern lines up.
        assert_eq!(chart.series[0], chart.series[1]);
    }
}
