//! Shared helpers for admin routes

use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::routes::public::parse_local_date;

/// Log database error details for an admin write before it is mapped to a
/// response
pub fn log_db_err(entity_id: Uuid, step: &'static str, e: &sqlx::Error) {
    if let Some(db) = e.as_database_error() {
        tracing::error!(
            %entity_id,
            step,
            code = ?db.code(),
            message = db.message(),
            table = ?db.table(),
            constraint = ?db.constraint(),
            "Database query failed"
        );
    } else {
        tracing::error!(%entity_id, step, error = ?e, "Non-database SQLx error");
    }
}

/// Convert a sqlx error after logging it
pub fn db_err(entity_id: Uuid, step: &'static str) -> impl FnOnce(sqlx::Error) -> ApiError {
    move |e| {
        log_db_err(entity_id, step, &e);
        ApiError::from(e)
    }
}

/// Optional `from`/`to` local dates turned into a UTC window; `to` is inclusive
pub fn date_window(
    from: Option<&str>,
    to: Option<&str>,
    to_utc: impl Fn(Date) -> (OffsetDateTime, OffsetDateTime),
) -> ApiResult<(Option<OffsetDateTime>, Option<OffsetDateTime>)> {
    let start = from.map(parse_local_date).transpose()?.map(|d| to_utc(d).0);
    let end = to.map(parse_local_date).transpose()?.map(|d| to_utc(d).1);
    if let (Some(start), Some(end)) = (start, end) {
        if end <= start {
            return Err(ApiError::validation("`to` must not be before `from`"));
        }
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};
    use time::{Duration, PrimitiveDateTime, Time};

    fn utc_day(d: Date) -> (OffsetDateTime, OffsetDateTime) {
        let start = PrimitiveDateTime::new(d, Time::MIDNIGHT).assume_offset(offset!(-3));
        (start, start + Duration::days(1))
    }

    #[test]
    fn test_date_window() {
        let (start, end) = date_window(Some("2025-06-01"), Some("2025-06-02"), utc_day).unwrap();
        assert_eq!(start, Some(datetime!(2025-06-01 03:00 UTC)));
        assert_eq!(end, Some(datetime!(2025-06-03 03:00 UTC)));

        assert_eq!(date_window(None, None, utc_day).unwrap(), (None, None));
        assert!(date_window(Some("2025-06-02"), Some("2025-06-01"), utc_day).is_err());
        assert!(date_window(Some("junk"), None, utc_day).is_err());
    }
}
