//! Extraction of calendar events from the `yearSchdul.do` page.
//!
//! The page lists one `li` per month inside `#timeTableList.yearSchdul`:
//!
//! ```html
//! <div id="timeTableList" class="yearSchdul">
//!   <ul>
//!     <li>
//!       <h3>1월</h3>
//!       <dl>
//!         <dt><span>01-28 ~ 01-30</span></dt>
//!         <dd><a href="#">동계 계절수업 기간</a></dd>
//!       </dl>
//!     </li>
//!   </ul>
//! </div>
//! ```
//!
//! Anything that doesn't fit this shape is skipped rather than reported.

use super::CalendarEvent;
use crate::{Error, Result};
use chrono::{Days, NaiveDate};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;

/// Title used when an entry has no link text.
pub const DEFAULT_TITLE: &str = "학사일정";

static MONTH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})\s*월").expect("Invalid month regex"));

// ASCII word boundaries, so `03-02개강` still yields a date.
static DATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u:\b)([0-9]{2})-([0-9]{2})(?-u:\b)").expect("Invalid date regex")
});

struct Selectors {
    root: Selector,
    month_block: Selector,
    heading: Selector,
    date_label: Selector,
    label_text: Selector,
    link: Selector,
}

impl Selectors {
    fn new() -> Result<Selectors> {
        Ok(Selectors {
            root: selector("#timeTableList.yearSchdul")?,
            month_block: selector("ul > li")?,
            heading: selector("h3")?,
            date_label: selector("dl > dt")?,
            label_text: selector("span")?,
            link: selector("a")?,
        })
    }
}

fn selector(selectors: &str) -> Result<Selector> {
    Selector::parse(selectors).map_err(|err| Error::Selector(format!("{selectors}: {err}")))
}

/// Parses the year schedule page into events for `year`.
///
/// Returns an empty list if the schedule container is missing.
pub fn parse_year_schedule(html: &str, year: i32) -> Result<Vec<CalendarEvent>> {
    let selectors = Selectors::new()?;
    let document = Html::parse_document(html);

    let Some(root) = document.select(&selectors.root).next() else {
        log::debug!("no schedule container found for {year}");
        return Ok(Vec::new());
    };

    let mut events = Vec::new();

    for block in root.select(&selectors.month_block) {
        let Some(month) = block
            .select(&selectors.heading)
            .next()
            .and_then(|heading| parse_month(&collapse_whitespace(heading.text())))
        else {
            continue;
        };

        for label in block.select(&selectors.date_label) {
            let text = collapse_whitespace(
                label
                    .select(&selectors.label_text)
                    .flat_map(|span| span.text()),
            );

            let Some((start, end)) = parse_date_range(&text, year, month) else {
                continue;
            };

            let title = next_detail(label)
                .and_then(|detail| detail.select(&selectors.link).next())
                .map(|link| collapse_whitespace(link.text()))
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| DEFAULT_TITLE.to_owned());

            events.push(CalendarEvent::school(title, start, end));
        }
    }

    log::debug!("parsed {} events for {year}", events.len());

    Ok(events)
}

/// Extracts the month number from a heading like `3월`.
fn parse_month(heading: &str) -> Option<u32> {
    let month = MONTH_REGEX.captures(heading)?[1].parse().ok()?;
    (1..=12).contains(&month).then_some(month)
}

/// Parses a date label like `01-28 ~ 01-30` into a start date and an exclusive end date.
///
/// Only the day of each `MM-DD` fragment is used; the month always comes from the enclosing
/// month block. A start day the month doesn't have skips the entry, while an end day past the
/// month's last day rolls over into the following month (`06-31` is read as `07-01`).
fn parse_date_range(label: &str, year: i32, month: u32) -> Option<(NaiveDate, Option<NaiveDate>)> {
    let mut days = DATE_REGEX
        .captures_iter(label)
        .filter_map(|caps| caps[2].parse::<u64>().ok());

    let start = NaiveDate::from_ymd_opt(year, month, u32::try_from(days.next()?).ok()?)?;

    // The day after `day` is `day` days past the first of the month.
    let end = days.next().and_then(|day| {
        NaiveDate::from_ymd_opt(year, month, 1)?.checked_add_days(Days::new(day))
    });

    Some((start, end))
}

/// Returns the `dd` element directly following a `dt`.
fn next_detail(label: ElementRef) -> Option<ElementRef> {
    label
        .next_siblings()
        .find_map(ElementRef::wrap)
        .filter(|sibling| sibling.value().name() == "dd")
}

fn collapse_whitespace<'a, I>(text: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    text.into_iter()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
