use anyhow::Context;
use chrono::{Datelike, Utc};
use chrono_tz::Asia::Seoul;
use dotenv::dotenv;

use schoolcal::schedule::fetch::HtmlFetcher;
use schoolcal::schedule::normalize::normalize_school_events;
use schoolcal::schedule::parse::parse_year_schedule;
use schoolcal::schedule::ScheduleSource;
use schoolcal::AppConfig;

/// Fetches one year of the school schedule and prints the normalized events as JSON.
///
/// Usage: `schedule-example [YEAR]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv().ok();

    let year = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid year {arg:?}"))?,
        None => Utc::now().with_timezone(&Seoul).year(),
    };

    let config = AppConfig::load()?;
    let fetcher = HtmlFetcher::new(&config.upstream)?;

    let html = fetcher.fetch_html(year).await?;
    let events = normalize_school_events(parse_year_schedule(&html, year)?, year);

    println!("{}", serde_json::to_string_pretty(&events)?);

    Ok(())
}
