//! Resolution of the loose date and time strings the model passes to tools.
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Local hour that natural-language todo dates resolve to.
pub const DEFAULT_TODO_HOUR: u32 = 9;

const WEEKDAYS: [(&str, Weekday); 7] = [
    ("monday", Weekday::Mon),
    ("tuesday", Weekday::Tue),
    ("wednesday", Weekday::Wed),
    ("thursday", Weekday::Thu),
    ("friday", Weekday::Fri),
    ("saturday", Weekday::Sat),
    ("sunday", Weekday::Sun),
];

const NAIVE_FORMATS: [&str; 4] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

/// The next `weekday` strictly after `today` (a week ahead when today matches).
pub fn next_weekday(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let current = today.weekday().num_days_from_monday() as i64;
    let target = weekday.num_days_from_monday() as i64;
    let mut ahead = target - current;
    if ahead <= 0 {
        ahead += 7;
    }
    today + Duration::days(ahead)
}

/// Resolves `today`, `tomorrow`, weekday names, `next week` (next Monday)
/// and `YYYY-MM-DD` against `today`.
pub fn resolve_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    if let Some(date) = text.get(..10).and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()) {
        return Some(date);
    }
    if text.contains("today") {
        return Some(today);
    }
    if text.contains("tomorrow") {
        return Some(today + Duration::days(1));
    }
    if let Some((_, weekday)) = WEEKDAYS.iter().find(|(name, _)| text.contains(name)) {
        return Some(next_weekday(today, *weekday));
    }
    if text.contains("next week") {
        return Some(next_weekday(today, Weekday::Mon));
    }
    None
}

fn from_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive).earliest().map(|dt| dt.with_timezone(&Utc))
}

/// Parses an ISO 8601 timestamp. One without an offset is local time in `tz`.
pub fn parse_iso_datetime(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .and_then(|naive| from_local(tz, naive))
}

/// A todo date: an ISO timestamp as given, otherwise any resolvable date at
/// 09:00 local time.
pub fn resolve_todo_date(text: &str, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(dt) = parse_iso_datetime(text, tz) {
        return Some(dt);
    }
    let today = now.with_timezone(&tz).date_naive();
    let date = resolve_date(text, today)?;
    from_local(tz, date.and_hms_opt(DEFAULT_TODO_HOUR, 0, 0)?)
}

/// Hour bounds and whether extended hours apply, for a time-of-day phrase.
pub fn time_window(preference: &str) -> (Option<u32>, Option<u32>, bool) {
    let preference = preference.to_lowercase();
    if preference.contains("morning") {
        (Some(7), Some(12), false)
    } else if preference.contains("afternoon") {
        (Some(12), Some(17), false)
    } else if preference.contains("evening") || preference.contains("after work") {
        (Some(17), Some(21), true)
    } else {
        (None, None, false)
    }
}
