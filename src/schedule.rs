//! Calendar views over a tutor's open windows. Read-only.

use std::collections::BTreeMap;

use chrono::{FixedOffset, NaiveDate, TimeZone};

use crate::engine::{EngineError, ReservationEngine};
use crate::limits::*;
use crate::model::*;

/// A local calendar day with at least one open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDay {
    pub date: NaiveDate,
    pub open_windows: usize,
}

#[derive(Clone)]
pub struct SchedulingService {
    engine: ReservationEngine,
}

impl SchedulingService {
    pub fn new(engine: ReservationEngine) -> Self {
        Self { engine }
    }

    /// Open windows lying entirely inside the local month, sorted by start.
    pub async fn open_windows_in_month(
        &self,
        owner_id: &str,
        year: i32,
        month: u32,
        utc_offset_minutes: i32,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let (from, to) = month_bounds(year, month, utc_offset_minutes)?;
        let mut windows = self.engine.windows_in_range(owner_id, from, to).await?;
        windows.retain(|w| !w.held);
        Ok(windows)
    }

    /// Local days of the month with their open-window counts, in date order.
    pub async fn open_days(
        &self,
        owner_id: &str,
        year: i32,
        month: u32,
        utc_offset_minutes: i32,
    ) -> Result<Vec<OpenDay>, EngineError> {
        let offset = utc_offset(utc_offset_minutes)?;
        let windows = self
            .open_windows_in_month(owner_id, year, month, utc_offset_minutes)
            .await?;
        Ok(group_by_day(&windows, &offset))
    }
}

fn utc_offset(minutes: i32) -> Result<FixedOffset, EngineError> {
    if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(EngineError::InvalidInput(format!(
            "utc offset {minutes} minutes out of range"
        )));
    }
    FixedOffset::east_opt(minutes * 60)
        .ok_or_else(|| EngineError::InvalidInput(format!("invalid utc offset {minutes}")))
}

/// `[start of month, start of next month]` in Unix ms, both taken at local
/// midnight for the given offset. The upper bound is inclusive so a window
/// ending exactly at midnight on the 1st still belongs to the month.
pub fn month_bounds(year: i32, month: u32, utc_offset_minutes: i32) -> Result<(Ms, Ms), EngineError> {
    if !(1..=12).contains(&month) {
        return Err(EngineError::InvalidInput(format!("month {month} not in 1..=12")));
    }
    if !(MIN_CALENDAR_YEAR..=MAX_CALENDAR_YEAR).contains(&year) {
        return Err(EngineError::InvalidInput(format!(
            "year {year} not in {MIN_CALENDAR_YEAR}..={MAX_CALENDAR_YEAR}"
        )));
    }
    let offset = utc_offset(utc_offset_minutes)?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    Ok((
        local_midnight(&offset, year, month)?,
        local_midnight(&offset, next_year, next_month)?,
    ))
}

fn local_midnight(offset: &FixedOffset, year: i32, month: u32) -> Result<Ms, EngineError> {
    let invalid = || EngineError::InvalidInput(format!("invalid date {year}-{month:02}-01"));
    let midnight = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(invalid)?;
    let local = offset
        .from_local_datetime(&midnight)
        .single()
        .ok_or_else(invalid)?;
    Ok(local.timestamp_millis())
}

/// Bucket windows by the local date of their start.
fn group_by_day(windows: &[AvailabilityWindow], offset: &FixedOffset) -> Vec<OpenDay> {
    let mut days: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for w in windows {
        if let Some(start) = offset.timestamp_millis_opt(w.span.start).single() {
            *days.entry(start.date_naive()).or_default() += 1;
        }
    }
    days.into_iter()
        .map(|(date, open_windows)| OpenDay { date, open_windows })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::Utc;
    use ulid::Ulid;

    use crate::notify::NotifyHub;
    use crate::store::{WalBookingStore, WalWindowStore};

    const M: Ms = 60_000;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorslot_test_schedule");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn service(name: &str) -> (SchedulingService, ReservationEngine) {
        let windows =
            WalWindowStore::open(&test_wal_path(&format!("{name}_windows.wal"))).unwrap();
        let bookings =
            WalBookingStore::open(&test_wal_path(&format!("{name}_bookings.wal"))).unwrap();
        let engine = ReservationEngine::new(
            Arc::new(windows),
            Arc::new(bookings),
            Arc::new(NotifyHub::new()),
        );
        (SchedulingService::new(engine.clone()), engine)
    }

    #[test]
    fn month_bounds_in_utc() {
        let (from, to) = month_bounds(2025, 6, 0).unwrap();
        assert_eq!(from, utc(2025, 6, 1, 0, 0));
        assert_eq!(to, utc(2025, 7, 1, 0, 0));
    }

    #[test]
    fn month_bounds_shift_with_offset() {
        // Local midnight at UTC+02:00 is 22:00 UTC the day before.
        let (from, to) = month_bounds(2025, 6, 120).unwrap();
        assert_eq!(from, utc(2025, 5, 31, 22, 0));
        assert_eq!(to, utc(2025, 6, 30, 22, 0));

        let (from, _) = month_bounds(2025, 6, -300).unwrap();
        assert_eq!(from, utc(2025, 6, 1, 5, 0));
    }

    #[test]
    fn december_rolls_into_next_year() {
        let (from, to) = month_bounds(2025, 12, 0).unwrap();
        assert_eq!(from, utc(2025, 12, 1, 0, 0));
        assert_eq!(to, utc(2026, 1, 1, 0, 0));
    }

    #[test]
    fn invalid_calendar_input_rejected() {
        for (year, month, offset) in [
            (2025, 0, 0),
            (2025, 13, 0),
            (1969, 6, 0),
            (10_000, 1, 0),
            (2025, 6, 19 * 60),
        ] {
            assert!(
                matches!(
                    month_bounds(year, month, offset),
                    Err(EngineError::InvalidInput(_))
                ),
                "{year}-{month} offset {offset} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn month_view_keeps_only_open_windows_inside_month() {
        let (svc, engine) = service("month_view");
        let target = Ulid::new();
        let booked = Ulid::new();
        let last_slot = Ulid::new();
        let july = Ulid::new();
        engine
            .publish_window(target, "tutor-ana", utc(2025, 6, 10, 9, 0), utc(2025, 6, 10, 9, 30))
            .await
            .unwrap();
        engine
            .publish_window(booked, "tutor-ana", utc(2025, 6, 11, 9, 0), utc(2025, 6, 11, 9, 30))
            .await
            .unwrap();
        engine
            .publish_window(last_slot, "tutor-ana", utc(2025, 6, 30, 23, 30), utc(2025, 7, 1, 0, 0))
            .await
            .unwrap();
        engine
            .publish_window(july, "tutor-ana", utc(2025, 7, 1, 0, 0), utc(2025, 7, 1, 0, 30))
            .await
            .unwrap();
        engine.claim(booked, "student-1").await.unwrap();

        let ids: Vec<Ulid> = svc
            .open_windows_in_month("tutor-ana", 2025, 6, 0)
            .await
            .unwrap()
            .iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec![target, last_slot]);

        // At UTC+01:00 the last slot falls on 1 July local time.
        let ids: Vec<Ulid> = svc
            .open_windows_in_month("tutor-ana", 2025, 6, 60)
            .await
            .unwrap()
            .iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec![target]);
    }

    #[tokio::test]
    async fn open_days_bucket_by_local_date() {
        let (svc, engine) = service("open_days");
        let day = |d| NaiveDate::from_ymd_opt(2025, 6, d).unwrap();
        for (start, len) in [
            (utc(2025, 6, 10, 9, 0), 30 * M),
            (utc(2025, 6, 10, 10, 0), 30 * M),
            (utc(2025, 6, 10, 23, 30), 30 * M),
            (utc(2025, 6, 12, 8, 0), 60 * M),
        ] {
            engine
                .publish_window(Ulid::new(), "tutor-ana", start, start + len)
                .await
                .unwrap();
        }

        let utc_days = svc.open_days("tutor-ana", 2025, 6, 0).await.unwrap();
        assert_eq!(
            utc_days,
            vec![
                OpenDay { date: day(10), open_windows: 3 },
                OpenDay { date: day(12), open_windows: 1 },
            ]
        );

        // 23:30 UTC is already the 11th at UTC+02:00.
        let cest_days = svc.open_days("tutor-ana", 2025, 6, 120).await.unwrap();
        assert_eq!(
            cest_days,
            vec![
                OpenDay { date: day(10), open_windows: 2 },
                OpenDay { date: day(11), open_windows: 1 },
                OpenDay { date: day(12), open_windows: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn empty_month_has_no_days() {
        let (svc, _engine) = service("empty_month");
        assert!(svc.open_days("tutor-ana", 2025, 2, 0).await.unwrap().is_empty());
        assert!(matches!(
            svc.open_days("tutor-ana", 2025, 13, 0).await,
            Err(EngineError::InvalidInput(_))
        ));
    }
}
