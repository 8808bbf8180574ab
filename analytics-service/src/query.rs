//! Query-string parsing and local -> UTC conversion.
//!
//! Clients send `start`/`end` in local display time without a zone
//! (`2024-05-01T00:00:00` or `2024-05-01 00:00:00`). They are converted by
//! subtracting the configured fixed offset. A timestamp that already carries
//! a zone (RFC 3339) is taken as-is.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use telemetry_model::{Category, Interval};

use crate::engine::bucket_start;
use crate::error::QueryError;
use crate::source::{SampleFilter, UtcRange};

const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalParams {
    pub device_id: Option<String>,
    pub category: Option<String>,
    pub trashbin_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketQuery {
    pub filter: SampleFilter,
    pub range: UtcRange,
    pub interval: Interval,
}

/// Local wall-clock time to UTC under `offset`. A bare date means local
/// midnight.
pub fn parse_local(
    param: &'static str,
    value: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, QueryError> {
    let value = value.trim();
    let bad = || QueryError::BadTimestamp {
        param,
        value: value.to_string(),
    };

    if let Ok(zoned) = DateTime::parse_from_rfc3339(value) {
        return Ok(zoned.with_timezone(&Utc));
    }

    let naive = LOCAL_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(bad)?;

    let utc = naive
        .checked_sub_signed(chrono::Duration::seconds(i64::from(offset.local_minus_utc())))
        .ok_or_else(bad)?;
    Ok(utc.and_utc())
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl IntervalParams {
    pub fn into_query(
        self,
        offset: FixedOffset,
        default_interval: Interval,
    ) -> Result<BucketQuery, QueryError> {
        let start = non_empty(self.start).ok_or(QueryError::MissingParam("start"))?;
        let end = non_empty(self.end).ok_or(QueryError::MissingParam("end"))?;

        let interval = match non_empty(self.interval) {
            Some(s) => s.parse::<Interval>()?,
            None => default_interval,
        };
        let category = non_empty(self.category)
            .map(|c| c.parse::<Category>())
            .transpose()?;

        let start = parse_local("start", &start, offset)?;
        let end = parse_local("end", &end, offset)?;
        // An end on the bucket grid (`01:00:00`) closes the last bucket; any
        // other end (`00:59:59`) names the last second wanted.
        let on_grid = end.timestamp_subsec_nanos() == 0
            && bucket_start(end, interval, offset) == end.timestamp();
        let range = if on_grid {
            UtcRange::new(start, end)
        } else {
            UtcRange::inclusive(start, end)
        };

        Ok(BucketQuery {
            filter: SampleFilter {
                device_id: non_empty(self.device_id),
                category,
                trashbin_id: non_empty(self.trashbin_id),
            },
            range,
            interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wib() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn params(start: &str, end: &str) -> IntervalParams {
        IntervalParams {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Default::default()
        }
    }

    #[test]
    fn local_midnight_is_previous_day_in_utc() {
        let utc = parse_local("start", "2024-05-01T00:00:00", wib()).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 4, 30, 17, 0, 0).unwrap());
        let spaced = parse_local("start", "2024-05-01 00:00:00", wib()).unwrap();
        assert_eq!(spaced, utc);
        let date_only = parse_local("start", "2024-05-01", wib()).unwrap();
        assert_eq!(date_only, utc);
    }

    #[test]
    fn zoned_timestamp_is_taken_as_is() {
        let utc = parse_local("start", "2024-05-01T00:00:00Z", wib()).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let err = parse_local("end", "yesterday", wib()).unwrap_err();
        assert!(matches!(err, QueryError::BadTimestamp { param: "end", .. }));
    }

    #[test]
    fn timestamps_at_the_calendar_limits_are_rejected() {
        let err = parse_local("start", "-262143-01-01T00:00:00", wib()).unwrap_err();
        assert!(matches!(err, QueryError::BadTimestamp { param: "start", .. }));

        let est = FixedOffset::west_opt(5 * 3600).unwrap();
        let err = parse_local("end", "+262142-12-31T23:59:59", est).unwrap_err();
        assert!(matches!(err, QueryError::BadTimestamp { param: "end", .. }));
    }

    #[test]
    fn builds_query_with_defaults() {
        let q = params("2024-05-01T00:00:00", "2024-05-01T01:00:00")
            .into_query(wib(), Interval::FiveMinutes)
            .unwrap();
        assert_eq!(q.interval, Interval::FiveMinutes);
        assert_eq!(q.filter, SampleFilter::default());
        assert_eq!(q.range.end - q.range.start, chrono::Duration::hours(1));
    }

    #[test]
    fn parses_filters_and_interval_alias() {
        let mut p = params("2024-05-01T00:00:00", "2024-05-02T00:00:00");
        p.interval = Some("1h".into());
        p.category = Some("Anorganic".into());
        p.device_id = Some("DEV-LT2-ANO".into());
        let q = p.into_query(wib(), Interval::FiveMinutes).unwrap();
        assert_eq!(q.interval, Interval::Hourly);
        assert_eq!(q.filter.category, Some(Category::Inorganic));
        assert_eq!(q.filter.device_id.as_deref(), Some("DEV-LT2-ANO"));
    }

    #[test]
    fn rejects_missing_and_unknown_params() {
        let missing = IntervalParams::default().into_query(wib(), Interval::Hourly);
        assert!(matches!(missing, Err(QueryError::MissingParam("start"))));

        let mut p = params("2024-05-01T00:00:00", "2024-05-01T01:00:00");
        p.interval = Some("daily".into());
        assert!(matches!(p.into_query(wib(), Interval::Hourly), Err(QueryError::Interval(_))));
    }

    #[test]
    fn end_off_the_grid_is_inclusive() {
        let open = params("2024-05-01T00:00:00", "2024-05-01T01:00:00")
            .into_query(wib(), Interval::FiveMinutes)
            .unwrap();
        assert!(!open.range.end_inclusive);

        let closed = params("2024-05-01T00:00:00", "2024-05-01T00:59:59")
            .into_query(wib(), Interval::FiveMinutes)
            .unwrap();
        assert!(closed.range.end_inclusive);
        assert!(closed.range.contains(closed.range.end));
    }

    #[test]
    fn inverted_range_still_parses() {
        let q = params("2024-05-01T01:00:00", "2024-05-01T00:00:00")
            .into_query(wib(), Interval::Hourly)
            .unwrap();
        assert!(q.range.is_empty());
    }
}
