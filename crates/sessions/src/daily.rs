//! Daily-boundary arithmetic shared by the Scheduler's quota-reset and
//! usage-cleanup tasks (§4.7).

use chrono::{DateTime, Utc};

/// Has the most recent `hour:00` UTC boundary been crossed between
/// `last_run` and `now`? Used to decide whether a once-a-day task is due.
pub fn crossed_hour_boundary(last_run: DateTime<Utc>, now: DateTime<Utc>, hour: u8) -> bool {
    if now.signed_duration_since(last_run).num_seconds() < 60 {
        return false;
    }

    let Some(today_boundary) = now.date_naive().and_hms_opt(hour as u32, 0, 0) else {
        return false;
    };
    let today_boundary = today_boundary.and_utc();

    let boundary = if now >= today_boundary {
        today_boundary
    } else {
        today_boundary - chrono::Duration::days(1)
    };

    last_run < boundary && now >= boundary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn boundary_crossed_same_day() {
        let last = Utc.with_ymd_and_hms(2026, 1, 15, 3, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 5, 0, 0).unwrap();
        assert!(crossed_hour_boundary(last, now, 4));
    }

    #[test]
    fn boundary_not_crossed_twice_same_day() {
        let last = Utc.with_ymd_and_hms(2026, 1, 15, 5, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap();
        assert!(!crossed_hour_boundary(last, now, 4));
    }

    #[test]
    fn boundary_crossed_across_midnight() {
        let last = Utc.with_ymd_and_hms(2026, 1, 14, 23, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 5, 0, 0).unwrap();
        assert!(crossed_hour_boundary(last, now, 4));
    }
}
