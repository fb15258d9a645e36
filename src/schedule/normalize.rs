use super::CalendarEvent;
use chrono::{Days, NaiveDate};

/// Titles for which the school only publishes a reliable start date.
const SEASON_START_TITLES: [&str; 4] = [
    "동계방학",
    "하계방학",
    "동계 계절수업 기간",
    "하계 계절수업 기간",
];

/// Suffix marking an event as the start of a season.
const SEASON_START_SUFFIX: &str = " (시작)";

const NEW_YEAR_TITLE: &str = "신정";

/// Cleans up anomalies in parsed school events.
///
/// The upstream page repeats the New Year's Day entry; once it shows up a second time the rest of
/// the list is dropped. Every retained event keeps its relative order.
pub fn normalize_school_events(events: Vec<CalendarEvent>, year: i32) -> Vec<CalendarEvent> {
    let new_year = NaiveDate::from_ymd_opt(year, 1, 1);
    let mut new_year_count = 0;
    let mut out = Vec::with_capacity(events.len());

    for event in events {
        if event.title.trim() == NEW_YEAR_TITLE && Some(event.start) == new_year {
            new_year_count += 1;
            if new_year_count >= 2 {
                log::debug!("repeated new year entry, keeping the first {} events", out.len());
                break;
            }
        }

        out.push(mark_season_start(fix_invalid_end(event)));
    }

    out
}

/// Drops an end date that isn't after the start date.
fn fix_invalid_end(mut event: CalendarEvent) -> CalendarEvent {
    if event.end.is_some_and(|end| end <= event.start) {
        event.end = None;
    }
    event
}

/// Rewrites season-start-only events into a single day marker.
fn mark_season_start(mut event: CalendarEvent) -> CalendarEvent {
    let title = event.title.trim();
    if !SEASON_START_TITLES.contains(&title) {
        return event;
    }

    let title = format!("{title}{SEASON_START_SUFFIX}");
    event.title = title;
    event.end = event.start.checked_add_days(Days::new(1));
    event.all_day = true;
    event
}
