use super::ScheduleSource;
use crate::{Error, RequestMethod, Result, UpstreamConfig};
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::time::{Duration, Instant};
use task_local_extensions::Extensions;

/// Logs every outbound request together with its outcome and duration.
struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let method = req.method().clone();
        let url = req.url().clone();
        let started = Instant::now();

        let result = next.run(req, extensions).await;

        match &result {
            Ok(res) => log::debug!(
                "{method} {url} -> {} in {:?}",
                res.status(),
                started.elapsed()
            ),
            Err(err) => log::debug!("{method} {url} failed after {:?}: {err}", started.elapsed()),
        }

        result
    }
}

/// Fetches the yearly schedule page from the school website.
#[derive(Debug)]
pub struct HtmlFetcher {
    client: ClientWithMiddleware,
    url: String,
    method: RequestMethod,
}

impl HtmlFetcher {
    /// Creates a fetcher for the configured upstream endpoint. An unconfigured endpoint is only
    /// reported once a page is fetched.
    pub fn new(config: &UpstreamConfig) -> Result<HtmlFetcher> {
        let user_agent = match &config.user_agent {
            Some(user_agent) => user_agent.clone(),
            None => format!("schoolcal/{}", env!("CARGO_PKG_VERSION")),
        };

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&user_agent)?);

        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .default_headers(headers)
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        )
        .with(LoggingMiddleware)
        .build();

        Ok(HtmlFetcher {
            client,
            url: config.url.trim().to_owned(),
            method: config.method,
        })
    }

    fn ensure_configured(&self) -> Result<()> {
        // A URL like `https://<school-domain>/yearSchdul.do` is a template that was never filled in.
        if self.url.is_empty() || (self.url.contains('<') && self.url.contains('>')) {
            return Err(Error::UnconfiguredEndpoint(self.url.clone()));
        }

        Ok(())
    }
}

#[async_trait]
impl ScheduleSource for HtmlFetcher {
    async fn fetch_html(&self, year: i32) -> Result<String> {
        self.ensure_configured()?;

        let params = build_year_parameters(year);

        let request = match self.method {
            RequestMethod::Get => self.client.get(&self.url).query(&params),
            RequestMethod::Post => self.client.post(&self.url).form(&params),
        };

        let html = request.send().await?.error_for_status()?.text().await?;

        log::debug!("fetched {} bytes of schedule markup for {year}", html.len());

        Ok(html)
    }
}

fn build_year_parameters(year: i32) -> IndexMap<&'static str, String> {
    IndexMap::from([("year", year.to_string())])
}
