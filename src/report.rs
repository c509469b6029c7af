use anyhow::Context;
use chrono::{Datelike, Days, NaiveDate};
use serde::Serialize;
use serde_with::SerializeDisplay;
use tracing::debug;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    io,
    str::FromStr,
};

use crate::record::{DownloadType, SalesRecord};

/// Format of period keys, as they appear in summaries and charts.
pub const PERIOD_FORMAT: &str = "%Y/%m/%d";

/// The first day of a reporting period.
///
/// Periods sort chronologically, which is also the lexical order of their
/// formatted keys.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, SerializeDisplay)]
pub struct Period(NaiveDate);

impl Period {
    #[must_use]
    pub fn day(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Returns the period for the ISO week containing `date`.
    ///
    /// Weeks are anchored on Monday, so a week that straddles New Year is
    /// keyed by a December date even for its January days.
    #[must_use]
    pub fn week_of(date: NaiveDate) -> Self {
        let offset = date.weekday().num_days_from_monday();
        Self(date - Days::new(u64::from(offset)))
    }

    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0.format(PERIOD_FORMAT).to_string())
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let date = NaiveDate::parse_from_str(s, PERIOD_FORMAT)
            .with_context(|| format!("bad period {s:?}"))?;
        Ok(Self(date))
    }
}

/// How records are grouped into periods.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Granularity {
    Daily,
    Weekly,
}

impl Granularity {
    #[must_use]
    pub fn period(self, date: NaiveDate) -> Period {
        match self {
            Self::Daily => Period::day(date),
            Self::Weekly => Period::week_of(date),
        }
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        })
    }
}

/// Download counts for one period.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Bucket {
    pub installs: u64,
    pub upgrades: u64,
    pub educational: u64,
    /// Installs in this period and every earlier one.
    pub cumulative: u64,
}

impl Bucket {
    /// Adds `tally` to this bucket, given the running install total before
    /// it. Returns `None` if any count would overflow.
    fn merged(&self, tally: &Bucket, cumulative: u64) -> Option<Bucket> {
        Some(Bucket {
            installs: self.installs.checked_add(tally.installs)?,
            upgrades: self.upgrades.checked_add(tally.upgrades)?,
            educational: self.educational.checked_add(tally.educational)?,
            cumulative: cumulative.checked_add(tally.installs)?,
        })
    }
}

/// Download counts grouped by period, in chronological order.
///
/// Build one with an [`Aggregator`]. Its [`Display`] implementation prints a
/// table; [`Report::write_tsv`] writes the same rows in machine-readable form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Report {
    granularity: Granularity,
    periods: BTreeMap<Period, Bucket>,
}

impl Report {
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.periods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    #[must_use]
    pub fn get(&self, period: &Period) -> Option<&Bucket> {
        self.periods.get(period)
    }

    /// Returns the zero-based position of `period` in the report, if present.
    #[must_use]
    pub fn position(&self, period: &Period) -> Option<usize> {
        self.periods
            .contains_key(period)
            .then(|| self.periods.range(..period).count())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Period, &Bucket)> {
        self.periods.iter()
    }

    pub fn periods(&self) -> impl Iterator<Item = Period> + '_ {
        self.periods.keys().copied()
    }

    /// Returns the most recent period and its counts.
    #[must_use]
    pub fn last(&self) -> Option<(&Period, &Bucket)> {
        self.periods.last_key_value()
    }

    #[must_use]
    pub fn installs(&self) -> Vec<u64> {
        self.periods.values().map(|b| b.installs).collect()
    }

    #[must_use]
    pub fn cumulative(&self) -> Vec<u64> {
        self.periods.values().map(|b| b.cumulative).collect()
    }

    /// Writes the report as tab-separated values, with a header row.
    ///
    /// # Errors
    ///
    /// Returns any error from writing to `wtr`.
    pub fn write_tsv<W: io::Write>(&self, wtr: W) -> crate::Result<()> {
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(wtr);
        for (period, bucket) in self.iter() {
            wtr.serialize(Row {
                period,
                installs: bucket.installs,
                upgrades: bucket.upgrades,
                educational: bucket.educational,
                cumulative: bucket.cumulative,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct Row<'a> {
    period: &'a Period,
    installs: u64,
    upgrades: u64,
    educational: u64,
    cumulative: u64,
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Downloads ({})", self.granularity)?;
        writeln!(
            f,
            "{:10} {:>10} {:>10} {:>12} {:>12}",
            "Period", "Installs", "Upgrades", "Educational", "Cumulative"
        )?;
        let length = 58;
        writeln!(f, "{:-<length$}", "")?;
        for (period, b) in self.iter() {
            writeln!(
                f,
                "{period:10} {:>10} {:>10} {:>12} {:>12}",
                b.installs, b.upgrades, b.educational, b.cumulative
            )?;
        }
        writeln!(f, "{:-<length$}", "")?;
        let total = self.last().map_or(0, |(_, b)| b.cumulative);
        writeln!(f, "{:10} {total:>47}", "Total")?;
        Ok(())
    }
}

/// Groups sales records into [`Report`]s.
///
/// With `breakdown` off, only installs are counted: upgrade rows are ignored
/// like any other product type, and educational installs aren't singled out.
#[derive(Clone, Copy, Debug)]
pub struct Aggregator {
    pub breakdown: bool,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self { breakdown: true }
    }
}

impl Aggregator {
    #[must_use]
    pub fn new(breakdown: bool) -> Self {
        Self { breakdown }
    }

    /// Summarises `records` by calendar day.
    #[must_use]
    pub fn build_daily(&self, records: &[SalesRecord]) -> Report {
        self.build(records, Granularity::Daily)
    }

    /// Summarises `records` by ISO week, keyed by the week's Monday.
    #[must_use]
    pub fn build_weekly(&self, records: &[SalesRecord]) -> Report {
        self.build(records, Granularity::Weekly)
    }

    /// Summarises `records` into periods of the given granularity.
    ///
    /// Records may arrive in any order; they are visited by date, and every
    /// bucket's `cumulative` is the running install total as of the last
    /// record counted in it. Periods with no countable records are absent.
    /// A record that would overflow any count is logged and skipped.
    #[must_use]
    pub fn build(&self, records: &[SalesRecord], granularity: Granularity) -> Report {
        let mut sorted: Vec<&SalesRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.date);
        let (periods, _) = sorted.into_iter().fold(
            (BTreeMap::<Period, Bucket>::new(), 0_u64),
            |(mut periods, cumulative), record| {
                let Some(tally) = self.tally(record) else {
                    return (periods, cumulative);
                };
                let period = granularity.period(record.date);
                let current = periods.get(&period).copied().unwrap_or_default();
                let Some(updated) = current.merged(&tally, cumulative) else {
                    debug!(units = record.units, date = %record.date, "skipping row that overflows the totals");
                    return (periods, cumulative);
                };
                periods.insert(period, updated);
                let cumulative = updated.cumulative;
                (periods, cumulative)
            },
        );
        Report {
            granularity,
            periods,
        }
    }

    /// Returns what `record` contributes to its period, or `None` if it
    /// doesn't count.
    fn tally(&self, record: &SalesRecord) -> Option<Bucket> {
        match &record.download_type {
            DownloadType::Install => Some(Bucket {
                installs: record.units,
                educational: if self.breakdown && record.is_educational() {
                    record.units
                } else {
                    0
                },
                ..Bucket::default()
            }),
            DownloadType::Upgrade if self.breakdown => Some(Bucket {
                upgrades: record.units,
                ..Bucket::default()
            }),
            DownloadType::Upgrade => None,
            DownloadType::Other(code) => {
                debug!(code = %code, date = %record.date, "ignoring download type");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_records;

    use pretty_assertions::assert_eq;

    fn date(m: u32, d: u32, y: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(date: NaiveDate, code: &str, units: u64, promo: &str) -> SalesRecord {
        SalesRecord {
            date,
            download_type: DownloadType::from(code),
            units,
            promo: promo.into(),
            version: "1.0".into(),
        }
    }

    fn bucket(installs: u64, upgrades: u64, educational: u64, cumulative: u64) -> Bucket {
        Bucket {
            installs,
            upgrades,
            educational,
            cumulative,
        }
    }

    fn rows(report: &Report) -> Vec<(String, Bucket)> {
        report.iter().map(|(p, b)| (p.to_string(), *b)).collect()
    }

    #[test]
    fn build_daily_fn_sums_installs_upgrades_and_educational() {
        let records = vec![
            record(date(1, 1, 2020), "1T", 10, "promoA"),
            record(date(1, 1, 2020), "1T", 5, "EDU"),
            record(date(1, 2, 2020), "7T", 3, "-"),
        ];
        let report = Aggregator::default().build_daily(&records);
        assert_eq!(
            rows(&report),
            vec![
                ("2020/01/01".into(), bucket(15, 0, 5, 15)),
                ("2020/01/02".into(), bucket(0, 3, 0, 15)),
            ]
        );
    }

    #[test]
    fn build_daily_fn_keeps_running_total_in_date_order() {
        let records = vec![
            record(date(3, 5, 2021), "1T", 7, ""),
            record(date(3, 1, 2021), "1T", 2, ""),
            record(date(3, 3, 2021), "1T", 0, ""),
            record(date(3, 3, 2021), "IA1", 40, ""),
            record(date(3, 1, 2021), "1T", 9, ""),
        ];
        let report = Aggregator::default().build_daily(&records);
        let cumulative = report.cumulative();
        assert_eq!(cumulative, vec![11, 11, 18]);
        assert!(cumulative.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(report.last().unwrap().1.cumulative, 18);
        assert_eq!(report.get(&Period::day(date(3, 3, 2021))), Some(&bucket(0, 0, 0, 11)));
    }

    #[test]
    fn build_daily_fn_ignores_unrecognised_lines() {
        let source = std::fs::read_to_string("testdata/S_D_85012345_20200103.txt").unwrap();
        let noisy = format!("garbage\n{source}Provider\tagain\n\n{source}trailing junk\n");
        let doubled = format!("{source}{source}");
        let aggregator = Aggregator::default();
        assert_eq!(
            aggregator.build_daily(&parse_records(&noisy)),
            aggregator.build_daily(&parse_records(&doubled)),
        );
    }

    #[test]
    fn build_daily_fn_correctly_summarises_sample_report() {
        let source = std::fs::read_to_string("testdata/S_D_85012345_20200103.txt").unwrap();
        let report = Aggregator::default().build_daily(&parse_records(&source));
        assert_eq!(
            rows(&report),
            vec![
                ("2019/12/31".into(), bucket(1, 0, 0, 1)),
                ("2020/01/01".into(), bucket(15, 0, 5, 16)),
                ("2020/01/02".into(), bucket(0, 3, 0, 16)),
                ("2020/01/03".into(), bucket(4, 0, 0, 20)),
            ]
        );
    }

    #[test]
    fn build_weekly_fn_anchors_weeks_on_monday_across_new_year() {
        let source = std::fs::read_to_string("testdata/S_D_85012345_20200103.txt").unwrap();
        let report = Aggregator::default().build_weekly(&parse_records(&source));
        assert_eq!(report.granularity(), Granularity::Weekly);
        assert_eq!(rows(&report), vec![("2019/12/30".into(), bucket(20, 3, 5, 20))]);
    }

    #[test]
    fn build_weekly_fn_matches_daily_totals_for_a_full_week() {
        // Monday 6th to Sunday 12th January 2020, plus a day either side.
        let mut records = Vec::new();
        for day in 5..=13 {
            records.push(record(date(1, day, 2020), "1T", u64::from(day), ""));
            records.push(record(date(1, day, 2020), "7T", 1, ""));
            records.push(record(date(1, day, 2020), "1T", 2, "EDU"));
        }
        let aggregator = Aggregator::default();
        let daily = aggregator.build_daily(&records);
        let weekly = aggregator.build_weekly(&records);
        assert_eq!(weekly.len(), 3);

        let week = weekly.get(&"2020/01/06".parse().unwrap()).unwrap();
        let days: Vec<&Bucket> = daily
            .iter()
            .filter(|(p, _)| (6..=12).contains(&p.date().day()))
            .map(|(_, b)| b)
            .collect();
        assert_eq!(days.len(), 7);
        assert_eq!(week.installs, days.iter().map(|b| b.installs).sum::<u64>());
        assert_eq!(week.upgrades, days.iter().map(|b| b.upgrades).sum::<u64>());
        assert_eq!(week.educational, days.iter().map(|b| b.educational).sum::<u64>());
        assert_eq!(week.cumulative, days.last().unwrap().cumulative);
    }

    #[test]
    fn build_weekly_fn_is_independent_of_input_order() {
        let source = std::fs::read_to_string("testdata/S_D_85012345_20200103.txt").unwrap();
        let mut records = parse_records(&source);
        records.push(record(date(12, 20, 2019), "1T", 3, ""));
        records.push(record(date(1, 9, 2020), "7T", 8, ""));
        let aggregator = Aggregator::default();
        let forward = aggregator.build_weekly(&records);
        records.reverse();
        let backward = aggregator.build_weekly(&records);
        assert_eq!(forward.to_string(), backward.to_string());
        assert_eq!(
            forward.periods().map(|p| p.to_string()).collect::<Vec<_>>(),
            vec!["2019/12/16", "2019/12/30", "2020/01/06"]
        );
    }

    #[test]
    fn build_fn_returns_empty_report_for_no_countable_records() {
        let records = vec![record(date(1, 1, 2020), "IA1", 3, "")];
        let report = Aggregator::default().build_daily(&records);
        assert!(report.is_empty());
        assert_eq!(report.last(), None);
        assert!(Aggregator::default()
            .build_weekly(&parse_records("nothing useful\n"))
            .is_empty());
    }

    #[test]
    fn build_fn_without_breakdown_counts_installs_only() {
        let records = vec![
            record(date(1, 1, 2020), "1T", 5, "EDU"),
            record(date(1, 2, 2020), "7T", 3, ""),
        ];
        let report = Aggregator::new(false).build_daily(&records);
        assert_eq!(rows(&report), vec![("2020/01/01".into(), bucket(5, 0, 0, 5))]);
    }

    #[test]
    fn build_fn_skips_rows_that_overflow_totals() {
        let records = vec![
            record(date(1, 1, 2020), "1T", u64::MAX, ""),
            record(date(1, 1, 2020), "1T", 1, ""),
            record(date(1, 2, 2020), "7T", 2, ""),
        ];
        let report = Aggregator::default().build_daily(&records);
        assert_eq!(
            rows(&report),
            vec![
                ("2020/01/01".into(), bucket(u64::MAX, 0, 0, u64::MAX)),
                ("2020/01/02".into(), bucket(0, 2, 0, u64::MAX)),
            ]
        );
    }

    #[test]
    fn display_fn_labels_table_with_granularity() {
        let records = vec![record(date(1, 1, 2020), "1T", 3, "")];
        let aggregator = Aggregator::default();
        let daily = aggregator.build_daily(&records).to_string();
        let weekly = aggregator.build_weekly(&records).to_string();
        assert_eq!(daily.lines().next(), Some("Downloads (daily)"));
        assert_eq!(weekly.lines().next(), Some("Downloads (weekly)"));
        assert!(daily.contains("2020/01/01"));
        assert!(weekly.contains("2019/12/30"));
    }

    #[test]
    fn position_fn_finds_period_index() {
        let records = vec![
            record(date(1, 1, 2020), "1T", 1, ""),
            record(date(1, 4, 2020), "1T", 1, ""),
        ];
        let report = Aggregator::default().build_daily(&records);
        assert_eq!(report.position(&Period::day(date(1, 4, 2020))), Some(1));
        assert_eq!(report.position(&Period::day(date(1, 2, 2020))), None);
    }

    #[test]
    fn write_tsv_fn_writes_header_and_rows() {
        let records = vec![record(date(1, 1, 2020), "1T", 10, "EDU")];
        let report = Aggregator::default().build_daily(&records);
        let mut out = Vec::new();
        report.write_tsv(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "period\tinstalls\tupgrades\teducational\tcumulative\n2020/01/01\t10\t0\t10\t10\n"
        );
    }

    #[test]
    fn period_fn_round_trips_key_format() {
        let period: Period = "2020/02/29".parse().unwrap();
        assert_eq!(period.date(), date(2, 29, 2020));
        assert_eq!(period.to_string(), "2020/02/29");
        assert!("02/29/2020".parse::<Period>().is_err());
    }
}
