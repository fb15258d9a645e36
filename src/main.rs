use actix_web::{
    error, get, guard,
    http::{
        header::{self, ContentType},
        StatusCode,
    },
    middleware::{Compress, DefaultHeaders, Logger},
    web::{self, Data},
    App, HttpResponse, HttpServer, Responder, ResponseError, Result,
};
use chrono::{Datelike, SecondsFormat, Utc};
use chrono_tz::Asia::Seoul;
use clap::Parser;
use dotenv::dotenv;
use prometheus::{Encoder, Registry, TextEncoder};
use schoolcal::schedule::SchoolCalendar;
use schoolcal::AppConfig;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration directory
    #[arg(long, value_name = "DIR", env = "CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Address on which the web server will listen, overrides the configuration
    #[arg(long, value_name = "HOST:PORT", env = "LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,
}

/// Error returned by the JSON API.
#[derive(Debug)]
struct ApiError(schoolcal::Error);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<schoolcal::Error> for ApiError {
    fn from(err: schoolcal::Error) -> Self {
        ApiError(err)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": true,
            "message": self.0.to_string(),
        }))
    }
}

/// Years that may be requested. Anything else falls back to the current year, which keeps the
/// year cache and the per-year metrics bounded.
const SUPPORTED_YEARS: RangeInclusive<i32> = 1900..=2100;

#[derive(Deserialize)]
struct SchoolEventsQuery {
    year: Option<String>,
    force: Option<String>,
}

impl SchoolEventsQuery {
    /// The requested year, falling back to the current year in Korea.
    fn year(&self) -> i32 {
        self.year
            .as_deref()
            .and_then(|year| year.trim().parse().ok())
            .filter(|year| SUPPORTED_YEARS.contains(year))
            .unwrap_or_else(|| Utc::now().with_timezone(&Seoul).year())
    }

    fn force(&self) -> bool {
        self.force.as_deref() == Some("1")
    }
}

#[get("/api/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "ok": true,
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

#[get("/api/school-events")]
async fn school_events(
    calendar: Data<SchoolCalendar>,
    query: web::Query<SchoolEventsQuery>,
) -> Result<HttpResponse, ApiError> {
    let events = calendar
        .events_for_year(query.year(), query.force())
        .await?;

    Ok(HttpResponse::Ok().json(events))
}

#[get("/metrics")]
async fn metrics(registry: Data<Registry>) -> Result<HttpResponse> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer))
}

/// CORS preflight, answered for any path.
async fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound()
        .content_type(ContentType::plaintext())
        .body("Not Found")
}

/// Permissive CORS headers added to every response.
fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET,OPTIONS"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"))
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/{tail:.*}")
            .guard(guard::Options())
            .to(preflight),
    )
    .service(health)
    .service(school_events)
    .service(metrics)
    .default_service(web::to(not_found));
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv().ok();

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)?;
    if let Some(listen_addr) = cli.listen_addr {
        config.server.listen_addr = listen_addr;
    }

    log::info!(
        "fetching school schedules from {:?} using {:?}, caching for {}s",
        config.upstream.url,
        config.upstream.method,
        config.cache.ttl_secs
    );

    let registry = Registry::new();
    let calendar = SchoolCalendar::from_config(&config)?;
    calendar.register_metrics(&registry)?;

    let calendar = Data::new(calendar);
    let registry = Data::new(registry);

    log::info!("starting HTTP server at {}", config.server.listen_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(calendar.clone())
            .app_data(registry.clone())
            .configure(routes)
            .wrap(cors_headers())
            .wrap(Compress::default())
            // Don't log things that could identify the user, e.g. omit client IP, referrer and
            // user agent.
            .wrap(Logger::new(r#""%r" %s %b %T"#))
    })
    .workers(config.server.workers)
    .bind(config.server.listen_addr)?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use async_trait::async_trait;
    use schoolcal::schedule::fetch::HtmlFetcher;
    use schoolcal::schedule::ScheduleSource;
    use schoolcal::{RequestMethod, UpstreamConfig};
    use serde_json::Value;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(6 * 60 * 60);

    struct StaticPage;

    #[async_trait]
    impl ScheduleSource for StaticPage {
        async fn fetch_html(&self, _year: i32) -> schoolcal::Result<String> {
            Ok(r#"<div id="timeTableList" class="yearSchdul"><ul>
                <li><h3>1월</h3><dl>
                  <dt><span>01-28 ~ 01-30</span></dt><dd><a>설날 연휴</a></dd>
                </dl></li>
                <li><h3>12월</h3><dl>
                  <dt><span>12-20</span></dt><dd><a>동계방학</a></dd>
                </dl></li>
              </ul></div>"#
                .into())
        }
    }

    macro_rules! app {
        ($calendar:expr) => {{
            let registry = Registry::new();
            $calendar.register_metrics(&registry).unwrap();
            test::init_service(
                App::new()
                    .app_data(Data::new($calendar.clone()))
                    .app_data(Data::new(registry))
                    .configure(routes)
                    .wrap(cors_headers()),
            )
            .await
        }};
    }

    fn allow_origin<B>(res: &actix_web::dev::ServiceResponse<B>) -> Option<&str> {
        res.headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok())
    }

    #[actix_rt::test]
    async fn health_check() {
        let calendar = SchoolCalendar::new(StaticPage, TTL).unwrap();
        let app = app!(calendar);

        let res = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request())
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(allow_origin(&res), Some("*"));

        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["ok"], true);
        assert!(body["time"].as_str().unwrap().ends_with('Z'));
    }

    #[actix_rt::test]
    async fn school_events_are_cached() {
        let calendar = SchoolCalendar::new(StaticPage, TTL).unwrap();
        let app = app!(calendar);

        let req = test::TestRequest::get()
            .uri("/api/school-events?year=2025")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(allow_origin(&res), Some("*"));

        let first: Value = test::read_body_json(res).await;
        assert_eq!(first["source"], "school");
        assert_eq!(first["year"], 2025);
        assert_eq!(
            first["events"],
            json!([
                {
                    "id": "SCHOOL-2025-01-28-설날_연휴",
                    "title": "설날 연휴",
                    "start": "2025-01-28",
                    "end": "2025-01-31",
                    "allDay": true,
                    "scope": "SCHOOL",
                },
                {
                    "id": "SCHOOL-2025-12-20-동계방학",
                    "title": "동계방학 (시작)",
                    "start": "2025-12-20",
                    "end": "2025-12-21",
                    "allDay": true,
                    "scope": "SCHOOL",
                },
            ])
        );

        let req = test::TestRequest::get()
            .uri("/api/school-events?year=2025")
            .to_request();
        let second: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(second["source"], "cache");
        assert_eq!(second["fetchedAt"], first["fetchedAt"]);
        assert_eq!(second["events"], first["events"]);

        let req = test::TestRequest::get()
            .uri("/api/school-events?year=2025&force=1")
            .to_request();
        let forced: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(forced["source"], "school");

        // Only `force=1` bypasses the cache.
        let req = test::TestRequest::get()
            .uri("/api/school-events?year=2025&force=true")
            .to_request();
        let not_forced: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(not_forced["source"], "cache");
    }

    #[actix_rt::test]
    async fn year_defaults_to_current_year() {
        let calendar = SchoolCalendar::new(StaticPage, TTL).unwrap();
        let app = app!(calendar);
        let current_year = Utc::now().with_timezone(&Seoul).year();

        for uri in [
            "/api/school-events",
            "/api/school-events?year=next",
            "/api/school-events?year=-40000",
            "/api/school-events?year=99999",
        ] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["year"], current_year, "{uri}");
        }

        // Out of range years share the current year's cache entry.
        assert_eq!(calendar.cache().len().await, 1);
    }

    #[actix_rt::test]
    async fn unconfigured_upstream() {
        let fetcher = HtmlFetcher::new(&UpstreamConfig {
            url: "https://<school-domain>/yearSchdul.do".into(),
            method: RequestMethod::Post,
            timeout_secs: 15,
            user_agent: None,
        })
        .unwrap();
        let calendar = SchoolCalendar::new(fetcher, TTL).unwrap();
        let app = app!(calendar);

        let req = test::TestRequest::get()
            .uri("/api/school-events?year=2025")
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(allow_origin(&res), Some("*"));

        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["error"], true);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("endpoint is not configured"));

        assert!(calendar.cache().is_empty().await);
    }

    #[actix_rt::test]
    async fn preflight_and_not_found() {
        let calendar = SchoolCalendar::new(StaticPage, TTL).unwrap();
        let app = app!(calendar);

        for uri in ["/api/school-events", "/anything"] {
            let req = test::TestRequest::default()
                .method(actix_web::http::Method::OPTIONS)
                .uri(uri)
                .to_request();
            let res = test::call_service(&app, req).await;

            assert_eq!(res.status(), StatusCode::NO_CONTENT, "{uri}");
            assert_eq!(allow_origin(&res), Some("*"));
            assert_eq!(
                res.headers()
                    .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                    .unwrap(),
                "GET,OPTIONS"
            );
        }

        let req = test::TestRequest::get().uri("/api/nope").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        assert_eq!(test::read_body(res).await, "Not Found");

        // Nothing was fetched along the way.
        assert!(calendar.cache().is_empty().await);
    }

    #[actix_rt::test]
    async fn metrics_endpoint() {
        let calendar = SchoolCalendar::new(StaticPage, TTL).unwrap();
        let app = app!(calendar);

        let req = test::TestRequest::get()
            .uri("/api/school-events?year=2025")
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let body = std::str::from_utf8(&body).unwrap();

        assert!(body.contains(r#"schoolcal_school_fetches_total{status="success"} 1"#));
        assert!(body.contains(r#"schoolcal_school_events{year="2025"} 2"#));
    }
}
