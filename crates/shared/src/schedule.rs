//! Studio opening hours, booking rules and slot availability
//!
//! Ranges are half-open: `[start, end)`. A session ending at 14:00 does not
//! conflict with one starting at 14:00.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::types::SiteSettings;

/// A half-open time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl TimeRange {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, BookingRuleError> {
        if end <= start {
            return Err(BookingRuleError::InvalidRange);
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.start <= instant && instant < self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).whole_minutes()
    }
}

/// Why a requested booking window is not allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BookingRuleError {
    #[error("end must be after start")]
    InvalidRange,
    #[error("cannot book a time in the past")]
    InPast,
    #[error("booking is too far in advance")]
    BeyondHorizon,
    #[error("booking must start and end on a slot boundary")]
    Misaligned,
    #[error("booking is shorter than the minimum length")]
    TooShort,
    #[error("booking is longer than the maximum length")]
    TooLong,
    #[error("booking is outside opening hours")]
    OutsideOpeningHours,
    #[error("the studio is closed on that day")]
    ClosedDay,
}

/// Opening hours and booking rules in the studio's local time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudioHours {
    pub offset: UtcOffset,
    /// Minutes after local midnight
    pub opening_minute: i32,
    pub closing_minute: i32,
    pub slot_minutes: i32,
    pub min_booking_minutes: i32,
    pub max_booking_minutes: i32,
    pub booking_horizon_days: i32,
    pub cancellation_notice_hours: i32,
    /// 0 = Monday
    pub closed_weekdays: Vec<u8>,
}

impl StudioHours {
    pub fn from_settings(settings: &SiteSettings) -> Self {
        Self {
            offset: UtcOffset::from_whole_seconds(settings.utc_offset_minutes * 60)
                .unwrap_or(UtcOffset::UTC),
            opening_minute: settings.opening_minute,
            closing_minute: settings.closing_minute,
            slot_minutes: settings.slot_minutes.max(1),
            min_booking_minutes: settings.min_booking_minutes,
            max_booking_minutes: settings.max_booking_minutes,
            booking_horizon_days: settings.booking_horizon_days,
            cancellation_notice_hours: settings.cancellation_notice_hours,
            closed_weekdays: settings
                .closed_weekdays
                .iter()
                .filter_map(|d| u8::try_from(*d).ok())
                .filter(|d| *d < 7)
                .collect(),
        }
    }

    fn minute_of_day(&self, instant: OffsetDateTime) -> i32 {
        let local = instant.to_offset(self.offset);
        i32::from(local.hour()) * 60 + i32::from(local.minute())
    }

    fn is_closed(&self, date: Date) -> bool {
        self.closed_weekdays
            .contains(&date.weekday().number_days_from_monday())
    }

    /// Check a requested booking window against the studio rules
    pub fn validate_booking(
        &self,
        range: &TimeRange,
        now: OffsetDateTime,
    ) -> Result<(), BookingRuleError> {
        if range.end <= range.start {
            return Err(BookingRuleError::InvalidRange);
        }
        if range.start < now {
            return Err(BookingRuleError::InPast);
        }
        if range.start > now + Duration::days(i64::from(self.booking_horizon_days)) {
            return Err(BookingRuleError::BeyondHorizon);
        }

        let slot = i64::from(self.slot_minutes);
        let start_minute = self.minute_of_day(range.start);
        let duration = range.duration_minutes();
        let local_start = range.start.to_offset(self.offset);
        let on_minute = local_start.second() == 0
            && local_start.nanosecond() == 0
            && (range.end - range.start).whole_seconds() % 60 == 0;
        if !on_minute
            || i64::from(start_minute - self.opening_minute).rem_euclid(slot) != 0
            || duration % slot != 0
        {
            return Err(BookingRuleError::Misaligned);
        }

        if duration < i64::from(self.min_booking_minutes) {
            return Err(BookingRuleError::TooShort);
        }
        if duration > i64::from(self.max_booking_minutes) {
            return Err(BookingRuleError::TooLong);
        }

        let end_minute = i64::from(start_minute) + duration;
        if start_minute < self.opening_minute || end_minute > i64::from(self.closing_minute) {
            return Err(BookingRuleError::OutsideOpeningHours);
        }

        if self.is_closed(local_start.date()) {
            return Err(BookingRuleError::ClosedDay);
        }

        Ok(())
    }

    /// The whole local day as a UTC range, used to fetch busy ranges
    pub fn local_day(&self, date: Date) -> TimeRange {
        let start = PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_offset(self.offset);
        TimeRange {
            start,
            end: start + Duration::days(1),
        }
    }

    /// Local calendar date of an instant
    pub fn local_date(&self, instant: OffsetDateTime) -> Date {
        instant.to_offset(self.offset).date()
    }

    /// Free slot-sized windows for a local date
    pub fn day_slots(&self, date: Date, busy: &[TimeRange], now: OffsetDateTime) -> Vec<TimeRange> {
        if self.is_closed(date) {
            return Vec::new();
        }

        let midnight = self.local_day(date).start;
        let slot = Duration::minutes(i64::from(self.slot_minutes));
        let mut slots = Vec::new();
        let mut minute = self.opening_minute;

        while minute + self.slot_minutes <= self.closing_minute {
            let start = midnight + Duration::minutes(i64::from(minute));
            let candidate = TimeRange {
                start,
                end: start + slot,
            };
            if candidate.start >= now && find_conflict(&candidate, busy).is_none() {
                slots.push(candidate);
            }
            minute += self.slot_minutes;
        }

        slots
    }

    /// Local wall-clock rendering used in emails, e.g. `02/06/2025 14:00`
    pub fn format_local(&self, instant: OffsetDateTime) -> String {
        instant
            .to_offset(self.offset)
            .format(format_description!("[day]/[month]/[year] [hour]:[minute]"))
            .unwrap_or_else(|_| instant.to_string())
    }

    /// Customers may cancel only with enough notice
    pub fn can_cancel(&self, starts_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        starts_at - now >= Duration::hours(i64::from(self.cancellation_notice_hours))
    }
}

/// First busy range overlapping `range`
pub fn find_conflict<'a>(range: &TimeRange, busy: &'a [TimeRange]) -> Option<&'a TimeRange> {
    busy.iter().find(|b| b.overlaps(range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset};

    fn hours() -> StudioHours {
        StudioHours {
            offset: offset!(-3),
            opening_minute: 9 * 60,
            closing_minute: 22 * 60,
            slot_minutes: 60,
            min_booking_minutes: 60,
            max_booking_minutes: 240,
            booking_horizon_days: 30,
            cancellation_notice_hours: 24,
            // Sunday
            closed_weekdays: vec![6],
        }
    }

    // Monday 2025-06-02 08:00 local
    const NOW: OffsetDateTime = datetime!(2025-06-02 08:00 -3);

    fn range(start: OffsetDateTime, end: OffsetDateTime) -> TimeRange {
        TimeRange::new(start, end).unwrap()
    }

    #[test]
    fn test_half_open_ranges_do_not_overlap_at_boundary() {
        let a = range(datetime!(2025-06-02 10:00 -3), datetime!(2025-06-02 12:00 -3));
        let b = range(datetime!(2025-06-02 12:00 -3), datetime!(2025-06-02 13:00 -3));
        let c = range(datetime!(2025-06-02 11:00 -3), datetime!(2025-06-02 12:30 -3));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_invalid_range() {
        let t = datetime!(2025-06-02 10:00 -3);
        assert_eq!(TimeRange::new(t, t), Err(BookingRuleError::InvalidRange));
    }

    #[test]
    fn test_valid_booking() {
        let r = range(datetime!(2025-06-03 14:00 -3), datetime!(2025-06-03 16:00 -3));
        assert_eq!(hours().validate_booking(&r, NOW), Ok(()));
    }

    #[test]
    fn test_booking_given_in_utc_is_checked_in_local_time() {
        // 17:00 UTC is 14:00 local
        let r = range(datetime!(2025-06-03 17:00 UTC), datetime!(2025-06-03 18:00 UTC));
        assert_eq!(hours().validate_booking(&r, NOW), Ok(()));
    }

    #[test]
    fn test_booking_in_past() {
        let r = range(datetime!(2025-06-01 10:00 -3), datetime!(2025-06-01 11:00 -3));
        assert_eq!(hours().validate_booking(&r, NOW), Err(BookingRuleError::InPast));
    }

    #[test]
    fn test_booking_beyond_horizon() {
        let r = range(datetime!(2025-08-01 10:00 -3), datetime!(2025-08-01 11:00 -3));
        assert_eq!(
            hours().validate_booking(&r, NOW),
            Err(BookingRuleError::BeyondHorizon)
        );
    }

    #[test]
    fn test_misaligned_booking() {
        let r = range(datetime!(2025-06-03 10:30 -3), datetime!(2025-06-03 11:30 -3));
        assert_eq!(
            hours().validate_booking(&r, NOW),
            Err(BookingRuleError::Misaligned)
        );
    }

    #[test]
    fn test_length_limits() {
        let h = hours();
        let long = range(datetime!(2025-06-03 09:00 -3), datetime!(2025-06-03 15:00 -3));
        assert_eq!(h.validate_booking(&long, NOW), Err(BookingRuleError::TooLong));

        let mut h = hours();
        h.min_booking_minutes = 120;
        let short = range(datetime!(2025-06-03 10:00 -3), datetime!(2025-06-03 11:00 -3));
        assert_eq!(h.validate_booking(&short, NOW), Err(BookingRuleError::TooShort));
    }

    #[test]
    fn test_outside_opening_hours() {
        let late = range(datetime!(2025-06-03 21:00 -3), datetime!(2025-06-03 23:00 -3));
        assert_eq!(
            hours().validate_booking(&late, NOW),
            Err(BookingRuleError::OutsideOpeningHours)
        );
    }

    #[test]
    fn test_closed_day() {
        // 2025-06-08 is a Sunday
        let r = range(datetime!(2025-06-08 10:00 -3), datetime!(2025-06-08 11:00 -3));
        assert_eq!(hours().validate_booking(&r, NOW), Err(BookingRuleError::ClosedDay));
    }

    #[test]
    fn test_find_conflict() {
        let busy = vec![
            range(datetime!(2025-06-03 10:00 -3), datetime!(2025-06-03 12:00 -3)),
            range(datetime!(2025-06-03 15:00 -3), datetime!(2025-06-03 16:00 -3)),
        ];
        let req = range(datetime!(2025-06-03 11:00 -3), datetime!(2025-06-03 13:00 -3));
        assert_eq!(find_conflict(&req, &busy), Some(&busy[0]));

        let free = range(datetime!(2025-06-03 12:00 -3), datetime!(2025-06-03 15:00 -3));
        assert_eq!(find_conflict(&free, &busy), None);
    }

    #[test]
    fn test_day_slots_skip_busy_and_past() {
        let h = hours();
        let busy = vec![range(
            datetime!(2025-06-02 10:00 -3),
            datetime!(2025-06-02 12:00 -3),
        )];
        // now is 09:30 local, so the 09:00 slot is gone
        let now = datetime!(2025-06-02 09:30 -3);
        let slots = h.day_slots(date!(2025-06-02), &busy, now);

        assert_eq!(slots.first().map(|s| s.start), Some(datetime!(2025-06-02 12:00 -3)));
        assert_eq!(slots.last().map(|s| s.end), Some(datetime!(2025-06-02 22:00 -3)));
        assert_eq!(slots.len(), 10);
    }

    #[test]
    fn test_day_slots_closed_day() {
        assert!(hours().day_slots(date!(2025-06-08), &[], NOW).is_empty());
    }

    #[test]
    fn test_can_cancel_respects_notice() {
        let h = hours();
        assert!(h.can_cancel(datetime!(2025-06-03 08:00 -3), NOW));
        assert!(!h.can_cancel(datetime!(2025-06-03 07:59 -3), NOW));
    }

    #[test]
    fn test_local_day_bounds() {
        let day = hours().local_day(date!(2025-06-02));
        assert_eq!(day.start, datetime!(2025-06-02 03:00 UTC));
        assert_eq!(day.duration_minutes(), 24 * 60);
    }

    #[test]
    fn test_local_date_uses_studio_offset() {
        let h = hours();
        assert_eq!(h.local_date(datetime!(2025-06-03 01:30 UTC)), date!(2025-06-02));
        assert_eq!(h.local_date(datetime!(2025-06-03 03:00 UTC)), date!(2025-06-03));
    }

    #[test]
    fn test_format_local() {
        let h = hours();
        assert_eq!(h.format_local(datetime!(2025-06-02 17:00 UTC)), "02/06/2025 14:00");
    }
}
