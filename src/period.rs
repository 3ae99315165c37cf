use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

/// Query period. Student-dimension answers compose week/month rollup
/// buckets, so periods are calendar-shaped rather than free date ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    All,
    Week { start: NaiveDate },
    Month { year: i32, month: u32 },
    Months { from: (i32, u32), to: (i32, u32) },
}

pub fn day_bucket(at: DateTime<Utc>) -> String {
    at.date_naive().format("%Y-%m-%d").to_string()
}

pub fn week_bucket(at: DateTime<Utc>) -> String {
    week_label(at.date_naive())
}

pub fn month_bucket(at: DateTime<Utc>) -> String {
    month_label(at.year(), at.month())
}

pub fn week_label(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{:04}-W{:02}", iso.year(), iso.week())
}

pub fn month_label(year: i32, month: u32) -> String {
    format!("{:04}-{:02}", year, month)
}

pub fn day_label(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Label of the bucket a given day falls into under a trend granularity.
pub fn bucket_for(granularity: Granularity, date: NaiveDate) -> String {
    match granularity {
        Granularity::Day => day_label(date),
        Granularity::Week => week_label(date),
        Granularity::Month => month_label(date.year(), date.month()),
    }
}

pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| format!("expected YYYY-MM-DD, got {:?}", s))
}

pub fn parse_month(s: &str) -> Result<(i32, u32), String> {
    let t = s.trim();
    let Some((y, m)) = t.split_once('-') else {
        return Err(format!("expected YYYY-MM, got {:?}", s));
    };
    let year = y
        .parse::<i32>()
        .map_err(|_| "month year must be numeric".to_string())?;
    let month = m
        .parse::<u32>()
        .map_err(|_| "month must be numeric".to_string())?;
    if !(1..=12).contains(&month) {
        return Err("month must be between 01 and 12".to_string());
    }
    Ok((year, month))
}

pub fn parse_period(v: Option<&serde_json::Value>) -> Result<Period, String> {
    let Some(v) = v else { return Ok(Period::All) };
    if v.is_null() {
        return Ok(Period::All);
    }
    let Some(obj) = v.as_object() else {
        return Err("period must be an object".to_string());
    };
    let kind = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| "period.type must be a string".to_string())?;
    match kind {
        "all" => Ok(Period::All),
        "week" => {
            let start = obj
                .get("start")
                .and_then(|s| s.as_str())
                .ok_or_else(|| "week period needs start".to_string())?;
            Ok(Period::Week {
                start: monday_of(parse_date(start)?),
            })
        }
        "month" => {
            let month = obj
                .get("month")
                .and_then(|s| s.as_str())
                .ok_or_else(|| "month period needs month".to_string())?;
            let (year, month) = parse_month(month)?;
            Ok(Period::Month { year, month })
        }
        "months" => {
            let from = obj
                .get("from")
                .and_then(|s| s.as_str())
                .ok_or_else(|| "months period needs from".to_string())?;
            let to = obj
                .get("to")
                .and_then(|s| s.as_str())
                .ok_or_else(|| "months period needs to".to_string())?;
            let from = parse_month(from)?;
            let to = parse_month(to)?;
            if from > to {
                return Err("months period: from must be <= to".to_string());
            }
            Ok(Period::Months { from, to })
        }
        other => Err(format!("unknown period type: {}", other)),
    }
}

impl Period {
    /// Inclusive day range covered by this period, if it is bounded.
    pub fn day_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        match *self {
            Period::All => None,
            Period::Week { start } => Some((start, start + Duration::days(6))),
            Period::Month { year, month } => Some((
                first_day_of_month(year, month),
                last_day_of_month(year, month),
            )),
            Period::Months { from, to } => Some((
                first_day_of_month(from.0, from.1),
                last_day_of_month(to.0, to.1),
            )),
        }
    }

    /// Rollup bucket labels this period maps onto for student dimensions:
    /// week periods read week buckets, month-shaped periods read month
    /// buckets, `All` reads every bucket (None).
    pub fn student_buckets(&self) -> Option<(Granularity, Vec<String>)> {
        match *self {
            Period::All => None,
            Period::Week { start } => Some((Granularity::Week, vec![week_label(start)])),
            Period::Month { year, month } => {
                Some((Granularity::Month, vec![month_label(year, month)]))
            }
            Period::Months { from, to } => Some((Granularity::Month, month_labels(from, to))),
        }
    }
}

pub fn month_labels(from: (i32, u32), to: (i32, u32)) -> Vec<String> {
    let mut labels = Vec::new();
    let (mut y, mut m) = from;
    while (y, m) <= to {
        labels.push(month_label(y, m));
        if m == 12 {
            y += 1;
            m = 1;
        } else {
            m += 1;
        }
    }
    labels
}

pub fn first_day_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).expect("valid month")
}

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.expect("valid month") - Duration::days(1)
}

/// Continuous bucket-label sequence covering [from, to] at a granularity.
/// Trend lines must never skip an empty sub-period.
pub fn labels_between(granularity: Granularity, from: NaiveDate, to: NaiveDate) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut day = from;
    while day <= to {
        let label = bucket_for(granularity, day);
        if labels.last() != Some(&label) {
            labels.push(label);
        }
        day += Duration::days(1);
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).expect("date")
    }

    #[test]
    fn bucket_labels_are_calendar_shaped() {
        let at = DateTime::parse_from_rfc3339("2025-04-14T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(day_bucket(at), "2025-04-14");
        assert_eq!(week_bucket(at), "2025-W16");
        assert_eq!(month_bucket(at), "2025-04");
    }

    #[test]
    fn week_label_uses_iso_year_at_boundaries() {
        // 2024-12-30 is a Monday belonging to ISO week 1 of 2025.
        assert_eq!(week_label(d("2024-12-30")), "2025-W01");
        assert_eq!(week_label(d("2025-01-05")), "2025-W01");
        assert_eq!(week_label(d("2025-01-06")), "2025-W02");
    }

    #[test]
    fn labels_between_fills_every_subperiod() {
        let weeks = labels_between(Granularity::Week, d("2025-03-31"), d("2025-04-20"));
        assert_eq!(weeks, vec!["2025-W14", "2025-W15", "2025-W16"]);

        let months = labels_between(Granularity::Month, d("2024-11-15"), d("2025-02-01"));
        assert_eq!(months, vec!["2024-11", "2024-12", "2025-01", "2025-02"]);

        let days = labels_between(Granularity::Day, d("2025-04-28"), d("2025-05-02"));
        assert_eq!(days.len(), 5);
        assert_eq!(days[0], "2025-04-28");
        assert_eq!(days[4], "2025-05-02");
    }

    #[test]
    fn month_labels_cross_year_boundary() {
        assert_eq!(
            month_labels((2024, 11), (2025, 1)),
            vec!["2024-11", "2024-12", "2025-01"]
        );
    }

    #[test]
    fn period_parsing_normalizes_and_validates() {
        assert_eq!(parse_period(None).expect("none"), Period::All);
        assert_eq!(
            parse_period(Some(&json!({ "type": "week", "start": "2025-04-16" }))).expect("week"),
            // Wednesday normalizes back to the ISO week's Monday.
            Period::Week { start: d("2025-04-14") }
        );
        assert_eq!(
            parse_period(Some(&json!({ "type": "month", "month": "2025-04" }))).expect("month"),
            Period::Month { year: 2025, month: 4 }
        );
        assert!(parse_period(Some(&json!({ "type": "month", "month": "2025-13" }))).is_err());
        assert!(parse_period(Some(&json!({ "type": "months", "from": "2025-05", "to": "2025-01" })))
            .is_err());
    }

    #[test]
    fn week_period_day_range_spans_monday_to_sunday() {
        let p = Period::Week { start: d("2025-04-14") };
        assert_eq!(p.day_range(), Some((d("2025-04-14"), d("2025-04-20"))));
        let m = Period::Month { year: 2025, month: 2 };
        assert_eq!(m.day_range(), Some((d("2025-02-01"), d("2025-02-28"))));
    }
}
