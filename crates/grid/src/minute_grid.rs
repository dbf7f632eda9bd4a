//! Canonical 10,080-slot week grid. A slot encodes
//! `day_of_week * 1440 + hour * 60 + minute` with Monday = day 0, all UTC.
//! All slot arithmetic is modular; curves indexed by slot wrap at week
//! boundaries.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

pub const SLOTS_PER_WEEK: u32 = 10_080;
pub const SLOTS_PER_DAY: u32 = 1_440;

const DAY_LABELS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Map a UTC instant to its minute slot.
pub fn datetime_to_slot(t: DateTime<Utc>) -> u32 {
    t.weekday().num_days_from_monday() * SLOTS_PER_DAY + t.hour() * 60 + t.minute()
}

/// Monday 00:00:00 UTC of the week containing `t`.
pub fn week_start_of(t: DateTime<Utc>) -> DateTime<Utc> {
    let days_back = t.weekday().num_days_from_monday() as i64;
    let monday = t.date_naive() - Duration::days(days_back);
    DateTime::from_naive_utc_and_offset(
        monday.and_hms_opt(0, 0, 0).unwrap_or_default(),
        Utc,
    )
}

/// UTC instant of `slot` within the week starting at `week_start`.
pub fn slot_to_datetime(slot: u32, week_start: DateTime<Utc>) -> DateTime<Utc> {
    week_start + Duration::minutes(i64::from(slot % SLOTS_PER_WEEK))
}

/// Earliest UTC instant `>= t` whose slot equals `slot`. When `t` already
/// lies inside the slot's minute, `t` itself is returned.
pub fn next_occurrence_after(slot: u32, t: DateTime<Utc>) -> DateTime<Utc> {
    let slot = slot % SLOTS_PER_WEEK;
    if datetime_to_slot(t) == slot {
        return t;
    }
    let mut candidate = slot_to_datetime(slot, week_start_of(t));
    if candidate < t {
        candidate += Duration::days(7);
    }
    candidate
}

/// Closed interval `[slot - radius, slot + radius]` modulo the week.
pub fn neighborhood(slot: u32, radius: u32) -> Vec<u32> {
    let slot = slot % SLOTS_PER_WEEK;
    let radius = radius.min((SLOTS_PER_WEEK - 1) / 2);
    let span = 2 * radius + 1;
    let start = (slot + SLOTS_PER_WEEK - radius) % SLOTS_PER_WEEK;
    (0..span).map(|i| (start + i) % SLOTS_PER_WEEK).collect()
}

/// Human-readable label for a slot, e.g. `"Mon 09:00"`.
pub fn slot_label(slot: u32) -> String {
    let slot = slot % SLOTS_PER_WEEK;
    let day = (slot / SLOTS_PER_DAY) as usize;
    let hour = (slot % SLOTS_PER_DAY) / 60;
    let minute = slot % 60;
    format!("{} {:02}:{:02}", DAY_LABELS[day], hour, minute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_slot_encoding() {
        // 2024-01-01 is a Monday.
        assert_eq!(datetime_to_slot(utc(2024, 1, 1, 0, 0, 0)), 0);
        assert_eq!(datetime_to_slot(utc(2024, 1, 1, 9, 0, 0)), 540);
        assert_eq!(datetime_to_slot(utc(2024, 1, 2, 0, 0, 0)), 1440);
        // Sunday 23:59 is the last slot of the week.
        assert_eq!(
            datetime_to_slot(utc(2024, 1, 7, 23, 59, 0)),
            SLOTS_PER_WEEK - 1
        );
    }

    #[test]
    fn test_slot_roundtrip_law() {
        for t in [
            utc(2024, 1, 1, 0, 0, 0),
            utc(2024, 3, 15, 13, 37, 12),
            utc(2024, 12, 31, 23, 59, 59),
            utc(2025, 6, 8, 4, 4, 4),
        ] {
            let slot = datetime_to_slot(t);
            let back = slot_to_datetime(slot, week_start_of(t));
            assert_eq!(datetime_to_slot(back), slot);
        }
    }

    #[test]
    fn test_week_start_is_monday_midnight() {
        let ws = week_start_of(utc(2024, 1, 4, 17, 30, 0)); // a Thursday
        assert_eq!(ws, utc(2024, 1, 1, 0, 0, 0));
        assert_eq!(week_start_of(ws), ws);
        // Sunday still belongs to the week that started the previous Monday.
        assert_eq!(week_start_of(utc(2024, 1, 7, 23, 59, 59)), utc(2024, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_next_occurrence_after() {
        let now = utc(2024, 1, 3, 12, 0, 0); // Wednesday noon
        // Slot 540 = Monday 09:00 has passed this week; expect next Monday.
        assert_eq!(next_occurrence_after(540, now), utc(2024, 1, 8, 9, 0, 0));
        // A slot later the same day stays in this week.
        let slot = datetime_to_slot(utc(2024, 1, 3, 15, 0, 0));
        assert_eq!(next_occurrence_after(slot, now), utc(2024, 1, 3, 15, 0, 0));
        // An instant already inside the slot's minute is returned as-is.
        let in_slot = utc(2024, 1, 3, 12, 0, 30);
        assert_eq!(next_occurrence_after(datetime_to_slot(now), in_slot), in_slot);
    }

    #[test]
    fn test_neighborhood_wraps_week_boundary() {
        let n = neighborhood(0, 2);
        assert_eq!(n, vec![SLOTS_PER_WEEK - 2, SLOTS_PER_WEEK - 1, 0, 1, 2]);
        assert_eq!(neighborhood(540, 0), vec![540]);
        assert_eq!(neighborhood(540, 1).len(), 3);
    }

    #[test]
    fn test_slot_labels() {
        assert_eq!(slot_label(0), "Mon 00:00");
        assert_eq!(slot_label(540), "Mon 09:00");
        assert_eq!(slot_label(SLOTS_PER_WEEK - 1), "Sun 23:59");
    }
}
