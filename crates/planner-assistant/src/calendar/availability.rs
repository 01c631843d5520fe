//! Free-slot search over busy intervals.
use super::{local_hour, local_midnight, TimeRange};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Hours used when the caller allows scheduling outside working hours.
pub const EXTENDED_START_HOUR: u32 = 8;
pub const EXTENDED_END_HOUR: u32 = 20;

#[derive(Debug, Clone)]
pub struct SlotSearch {
    pub duration: Duration,
    pub start_at: DateTime<Utc>,
    pub days_ahead: u32,
    pub allow_outside: bool,
    pub earliest_hour: Option<u32>,
    pub latest_hour: Option<u32>,
    pub work_start_hour: u32,
    pub work_end_hour: u32,
    pub max_slots: usize,
}

impl SlotSearch {
    /// Everything the search may look at, from `start_at` to the end of the last day.
    pub fn horizon(&self, tz: Tz) -> TimeRange {
        let first_day = self.start_at.with_timezone(&tz).date_naive();
        let last_day = first_day + Duration::days(self.days_ahead as i64 + 1);
        TimeRange::new(self.start_at, local_midnight(tz, last_day))
    }

    /// The bookable window on `day`, or None when it is empty.
    pub fn working_window(&self, day: NaiveDate, tz: Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (mut start_hour, mut end_hour) = if self.allow_outside {
            (EXTENDED_START_HOUR, EXTENDED_END_HOUR)
        } else {
            (self.work_start_hour, self.work_end_hour)
        };
        if let Some(earliest) = self.earliest_hour {
            start_hour = start_hour.max(earliest);
        }
        if let Some(latest) = self.latest_hour {
            end_hour = end_hour.min(latest);
        }
        if start_hour >= end_hour {
            return None;
        }
        Some((local_hour(tz, day, start_hour), local_hour(tz, day, end_hour)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// First-fit scan day by day: the gap before each busy interval, then the
/// tail of the window. Returns at most `max_slots` slots in chronological order.
pub fn find_slots(busy: &[(DateTime<Utc>, DateTime<Utc>)], search: &SlotSearch, tz: Tz) -> Vec<Slot> {
    let mut slots = Vec::new();
    if search.duration <= Duration::zero() || search.max_slots == 0 {
        return slots;
    }
    let today = search.start_at.with_timezone(&tz).date_naive();

    for offset in 0..=search.days_ahead {
        let day = today + Duration::days(offset as i64);
        let Some((mut day_start, day_end)) = search.working_window(day, tz) else {
            continue;
        };
        if day == today {
            day_start = day_start.max(search.start_at);
        }
        if day_start >= day_end {
            continue;
        }

        let mut day_busy: Vec<(DateTime<Utc>, DateTime<Utc>)> = busy
            .iter()
            .filter(|(start, end)| *end > day_start && *start < day_end)
            .map(|(start, end)| ((*start).max(day_start), (*end).min(day_end)))
            .collect();
        day_busy.sort();

        let mut cursor = day_start;
        for (busy_start, busy_end) in day_busy {
            if busy_start - cursor >= search.duration {
                slots.push(Slot { start: cursor, end: cursor + search.duration });
                if slots.len() >= search.max_slots {
                    return slots;
                }
            }
            cursor = cursor.max(busy_end);
        }
        if day_end - cursor >= search.duration {
            slots.push(Slot { start: cursor, end: cursor + search.duration });
            if slots.len() >= search.max_slots {
                return slots;
            }
        }
    }
    slots
}
