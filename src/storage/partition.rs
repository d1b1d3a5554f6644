//! Calendar partitioning of candle streams into period files.
//!
//! Short intervals produce one file per day, longer ones per ISO week, month,
//! quarter or year. `partition_for` is a pure function of (interval,
//! timestamp); `periods_in_range` walks every period overlapping a query
//! window exactly once.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use crate::models::Interval;

// =============================================================================
// PATTERN
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodPattern {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl PeriodPattern {
    pub fn for_interval(interval: Interval) -> Self {
        match interval {
            Interval::M1 | Interval::M3 => Self::Daily,
            Interval::M5 | Interval::M15 => Self::Weekly,
            Interval::M30 | Interval::H1 => Self::Monthly,
            Interval::H2 | Interval::H4 => Self::Quarterly,
            Interval::H8 | Interval::H12 | Interval::D1 => Self::Yearly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }
}

// =============================================================================
// PARTITION
// =============================================================================

/// One calendar period of one interval stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub pattern: PeriodPattern,
    /// Period file stem: YYYY-MM-DD, YYYY-Www, YYYY-MM, YYYY-Qq or YYYY.
    pub period: String,
    /// Inclusive period start (ms).
    pub start_ts: i64,
    /// Inclusive period end (ms).
    pub end_ts: i64,
}

fn utc_date(ts_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap())
}

fn day_start_ms(date: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap())
        .timestamp_millis()
}

/// Compute the period containing `ts_ms` for the given interval.
pub fn partition_for(interval: Interval, ts_ms: i64) -> Partition {
    let pattern = PeriodPattern::for_interval(interval);
    let dt = utc_date(ts_ms);
    let date = dt.date_naive();

    match pattern {
        PeriodPattern::Daily => {
            let start = day_start_ms(date);
            Partition {
                pattern,
                period: date.format("%Y-%m-%d").to_string(),
                start_ts: start,
                end_ts: start + 86_400_000 - 1,
            }
        }
        PeriodPattern::Weekly => {
            // ISO week: the Thursday of a week decides its year.
            let iso = date.iso_week();
            let monday = NaiveDate::from_isoywd_opt(iso.year(), iso.week(), chrono::Weekday::Mon)
                .unwrap_or(date);
            let start = day_start_ms(monday);
            Partition {
                pattern,
                period: format!("{}-W{:02}", iso.year(), iso.week()),
                start_ts: start,
                end_ts: start + 7 * 86_400_000 - 1,
            }
        }
        PeriodPattern::Monthly => {
            let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap();
            let next = if date.month() == 12 {
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).unwrap()
            } else {
                NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1).unwrap()
            };
            Partition {
                pattern,
                period: format!("{}-{:02}", date.year(), date.month()),
                start_ts: day_start_ms(first),
                end_ts: day_start_ms(next) - 1,
            }
        }
        PeriodPattern::Quarterly => {
            let quarter = (date.month0() / 3) + 1;
            let first_month = (quarter - 1) * 3 + 1;
            let first = NaiveDate::from_ymd_opt(date.year(), first_month, 1).unwrap();
            let next = if quarter == 4 {
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).unwrap()
            } else {
                NaiveDate::from_ymd_opt(date.year(), first_month + 3, 1).unwrap()
            };
            Partition {
                pattern,
                period: format!("{}-Q{}", date.year(), quarter),
                start_ts: day_start_ms(first),
                end_ts: day_start_ms(next) - 1,
            }
        }
        PeriodPattern::Yearly => {
            let first = NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap();
            let next = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).unwrap();
            Partition {
                pattern,
                period: format!("{}", date.year()),
                start_ts: day_start_ms(first),
                end_ts: day_start_ms(next) - 1,
            }
        }
    }
}

/// Every unique period whose [start, end] overlaps [start_ms, end_ms],
/// ascending. Together the returned periods cover the range exactly once.
pub fn periods_in_range(interval: Interval, start_ms: i64, end_ms: i64) -> Vec<Partition> {
    let mut periods = Vec::new();
    if end_ms < start_ms {
        return periods;
    }

    let mut cursor = start_ms;
    loop {
        let part = partition_for(interval, cursor);
        let next = part.end_ts + 1;
        periods.push(part);
        if next > end_ms {
            break;
        }
        cursor = next;
    }
    periods
}

/// Upper bound on the look-back window when only an end bound is known.
pub fn default_lookback(interval: Interval) -> Duration {
    match PeriodPattern::for_interval(interval) {
        PeriodPattern::Daily => Duration::days(14),
        PeriodPattern::Weekly => Duration::weeks(12),
        PeriodPattern::Monthly => Duration::days(366),
        PeriodPattern::Quarterly => Duration::days(2 * 366),
        PeriodPattern::Yearly => Duration::days(5 * 366),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14 22:13:20 UTC
    const TS: i64 = 1_700_000_000_000;

    #[test]
    fn daily_pattern() {
        let p = partition_for(Interval::M1, TS);
        assert_eq!(p.pattern, PeriodPattern::Daily);
        assert_eq!(p.period, "2023-11-14");
        assert_eq!(p.end_ts - p.start_ts, 86_400_000 - 1);
        assert!(p.start_ts <= TS && TS <= p.end_ts);
    }

    #[test]
    fn weekly_pattern_iso() {
        let p = partition_for(Interval::M5, TS);
        assert_eq!(p.pattern, PeriodPattern::Weekly);
        assert_eq!(p.period, "2023-W46");
        assert_eq!(p.end_ts - p.start_ts, 7 * 86_400_000 - 1);

        // 2021-01-01 is a Friday and belongs to ISO week 2020-W53.
        let jan1 = Utc
            .with_ymd_and_hms(2021, 1, 1, 12, 0, 0)
            .unwrap()
            .timestamp_millis();
        let p = partition_for(Interval::M15, jan1);
        assert_eq!(p.period, "2020-W53");
    }

    #[test]
    fn monthly_quarterly_yearly_patterns() {
        let p = partition_for(Interval::H1, TS);
        assert_eq!(p.period, "2023-11");

        let p = partition_for(Interval::H4, TS);
        assert_eq!(p.period, "2023-Q4");

        let p = partition_for(Interval::D1, TS);
        assert_eq!(p.period, "2023");
        assert!(p.start_ts <= TS && TS <= p.end_ts);
    }

    #[test]
    fn quarter_boundaries() {
        let mar31 = Utc
            .with_ymd_and_hms(2024, 3, 31, 23, 59, 59)
            .unwrap()
            .timestamp_millis();
        let apr1 = Utc
            .with_ymd_and_hms(2024, 4, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(partition_for(Interval::H2, mar31).period, "2024-Q1");
        assert_eq!(partition_for(Interval::H2, apr1).period, "2024-Q2");
        assert_eq!(partition_for(Interval::H2, mar31).end_ts + 1, apr1);
    }

    #[test]
    fn range_covers_exactly_once() {
        // Four days straddling a month boundary.
        let start = Utc
            .with_ymd_and_hms(2023, 10, 30, 6, 0, 0)
            .unwrap()
            .timestamp_millis();
        let end = Utc
            .with_ymd_and_hms(2023, 11, 2, 18, 0, 0)
            .unwrap()
            .timestamp_millis();
        let periods = periods_in_range(Interval::M1, start, end);
        let names: Vec<&str> = periods.iter().map(|p| p.period.as_str()).collect();
        assert_eq!(names, vec!["2023-10-30", "2023-10-31", "2023-11-01", "2023-11-02"]);

        // Contiguous, non-overlapping.
        for pair in periods.windows(2) {
            assert_eq!(pair[0].end_ts + 1, pair[1].start_ts);
        }
        assert!(periods.first().unwrap().start_ts <= start);
        assert!(periods.last().unwrap().end_ts >= end);
    }

    #[test]
    fn range_single_period() {
        let periods = periods_in_range(Interval::D1, TS, TS + 1);
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].period, "2023");
    }

    #[test]
    fn empty_range() {
        assert!(periods_in_range(Interval::M1, TS, TS - 1).is_empty());
    }
}
