//! Client for the historical service performance API.
//!
//! A key is answered in two steps: `serviceMetrics` lists the services (by
//! RID) running the route within the window, then `serviceDetails` returns
//! each service's calling points, from which the destination arrival is
//! read.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, Request, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::client::HttpClient;
use super::{ServiceClient, ServiceError, ServiceListing};
use crate::model::{DelayRecord, FetchKey, days_tag, format_hhmm};

/// Cool-down applied when the gateway answers 403 to shed load.
const GATEWAY_COOLDOWN: Duration = Duration::from_secs(60);

/// Maximum length of a response body carried into an error message.
const BODY_PREVIEW_LEN: usize = 300;

#[derive(Debug, Serialize)]
struct MetricsRequest {
    from_loc: String,
    to_loc: String,
    from_time: String,
    to_time: String,
    from_date: String,
    to_date: String,
    days: &'static str,
}

impl MetricsRequest {
    fn for_key(key: &FetchKey) -> Self {
        let date = key.date.format("%Y-%m-%d").to_string();
        Self {
            from_loc: key.route.origin.clone(),
            to_loc: key.route.destination.clone(),
            from_time: format_hhmm(key.window.start()),
            to_time: format_hhmm(key.window.end()),
            from_date: date.clone(),
            to_date: date,
            days: days_tag(key.date),
        }
    }
}

#[derive(Debug, Serialize)]
struct DetailsRequest<'a> {
    rid: &'a str,
}

#[derive(Deserialize)]
struct MetricsResponse {
    #[serde(rename = "Services", default)]
    services: Vec<MetricsService>,
}

#[derive(Deserialize)]
struct MetricsService {
    #[serde(rename = "serviceAttributesMetrics", default)]
    attributes: Option<ServiceAttributesMetrics>,
}

#[derive(Deserialize)]
struct ServiceAttributesMetrics {
    #[serde(default)]
    rids: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct DetailsResponse {
    #[serde(rename = "serviceAttributesDetails", default)]
    attributes: Option<ServiceAttributesDetails>,
}

#[derive(Deserialize)]
struct ServiceAttributesDetails {
    #[serde(default)]
    locations: Vec<CallingPoint>,
}

#[derive(Deserialize)]
struct CallingPoint {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    crs: Option<String>,
    #[serde(default)]
    gbtt_pta: Option<String>,
    #[serde(default)]
    gbtt_ptd: Option<String>,
    #[serde(default)]
    actual_ta: Option<String>,
    #[serde(default)]
    actual_td: Option<String>,
}

impl CallingPoint {
    fn code(&self) -> Option<&str> {
        non_empty(&self.location).or_else(|| non_empty(&self.crs))
    }

    /// Scheduled and actual arrival, falling back to departure times for
    /// calling points that only record those.
    fn arrival(&self) -> Option<(&str, &str)> {
        let scheduled = non_empty(&self.gbtt_pta).or_else(|| non_empty(&self.gbtt_ptd))?;
        let actual = non_empty(&self.actual_ta).or_else(|| non_empty(&self.actual_td))?;
        Some((scheduled, actual))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// [`ServiceClient`] over HTTP. Credentials are the job of the wrapped
/// [`HttpClient`] (see [`ApiKey`](super::auth::ApiKey)).
pub struct HspClient<C> {
    http: C,
    metrics_endpoint: Url,
    details_endpoint: Url,
    user_agent: HeaderValue,
}

impl<C: HttpClient> HspClient<C> {
    pub fn new(http: C, base_url: &str, user_agent: &str) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            metrics_endpoint: endpoint(base_url, "serviceMetrics")?,
            details_endpoint: endpoint(base_url, "serviceDetails")?,
            user_agent: HeaderValue::from_str(user_agent)?,
        })
    }

    fn build_request(&self, endpoint: &Url, body: &impl Serialize) -> Result<Request, ServiceError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| ServiceError::DataIntegrity(format!("request encoding: {e}")))?;

        let mut req = Request::new(Method::POST, endpoint.clone());
        let headers = req.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, self.user_agent.clone());
        *req.body_mut() = Some(body.into());
        Ok(req)
    }

    /// Sends one POST and returns the body of a 200 response. Both endpoints
    /// classify failures the same way.
    async fn post(&self, endpoint: &Url, body: &impl Serialize) -> Result<String, ServiceError> {
        let req = self.build_request(endpoint, body)?;

        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        resp.text().await.map_err(|e| classify_transport(&e))
    }
}

#[async_trait]
impl<C: HttpClient> ServiceClient for HspClient<C> {
    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn fetch(&self, key: &FetchKey) -> Result<ServiceListing, ServiceError> {
        let body = self
            .post(&self.metrics_endpoint, &MetricsRequest::for_key(key))
            .await?;
        let listing = parse_listing(&body)?;
        debug!(
            returned = listing.returned,
            rids = listing.rids.len(),
            "Services listed"
        );
        Ok(listing)
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn details(&self, key: &FetchKey, rid: &str) -> Result<Option<DelayRecord>, ServiceError> {
        let body = self
            .post(&self.details_endpoint, &DetailsRequest { rid })
            .await?;
        parse_details(key, rid, &body)
    }
}

fn endpoint(base_url: &str, name: &str) -> anyhow::Result<Url> {
    Ok(Url::parse(&format!("{}/{name}", base_url.trim_end_matches('/')))?)
}

/// Maps a non-200 response to a [`ServiceError`].
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ServiceError {
    let message = preview(body);
    match status {
        StatusCode::UNAUTHORIZED => ServiceError::Auth,
        StatusCode::FORBIDDEN => ServiceError::RateLimited {
            retry_after: Some(retry_after.unwrap_or(GATEWAY_COOLDOWN)),
        },
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => ServiceError::Transient {
            status: Some(status.as_u16()),
            message,
        },
        s if s.is_server_error() => ServiceError::Transient {
            status: Some(s.as_u16()),
            message,
        },
        s => ServiceError::Fatal {
            status: s.as_u16(),
            message,
        },
    }
}

fn classify_transport(e: &reqwest::Error) -> ServiceError {
    if let Some(status) = e.status() {
        return classify_status(status, None, &e.to_string());
    }
    if e.is_timeout() {
        return ServiceError::Transient {
            status: Some(StatusCode::REQUEST_TIMEOUT.as_u16()),
            message: e.to_string(),
        };
    }
    // Refused and reset connections, and body read failures.
    ServiceError::Transient {
        status: None,
        message: e.to_string(),
    }
}

fn preview(body: &str) -> String {
    match body.char_indices().nth(BODY_PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Parses a `serviceMetrics` body into the RIDs it lists. Non-string RIDs
/// are skipped; a body that is not a metrics response at all is a
/// [`ServiceError::DataIntegrity`].
pub fn parse_listing(body: &str) -> Result<ServiceListing, ServiceError> {
    let response: MetricsResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::DataIntegrity(format!("{e}: {}", preview(body))))?;

    let mut listing = ServiceListing::default();
    let mut seen = std::collections::HashSet::new();
    for service in response.services {
        let Some(attributes) = service.attributes else {
            continue;
        };
        for rid in attributes.rids {
            listing.returned += 1;
            match rid.as_str() {
                Some(rid) if seen.insert(rid.to_string()) => listing.rids.push(rid.to_string()),
                Some(_) => {}
                None => warn!(rid = %rid, "Skipping non-string RID"),
            }
        }
    }
    Ok(listing)
}

/// Parses a `serviceDetails` body into the arrival at the key's destination.
/// Services that do not call there, or lack either time, yield `None`.
pub fn parse_details(
    key: &FetchKey,
    rid: &str,
    body: &str,
) -> Result<Option<DelayRecord>, ServiceError> {
    let response: DetailsResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::DataIntegrity(format!("{e}: {}", preview(body))))?;

    let destination = &key.route.destination;
    let Some(point) = response
        .attributes
        .iter()
        .flat_map(|a| a.locations.iter())
        .find(|p| p.code().is_some_and(|c| c.eq_ignore_ascii_case(destination)))
    else {
        debug!(rid, destination = %destination, "Service does not call at destination");
        return Ok(None);
    };

    let Some((scheduled, actual)) = point.arrival() else {
        debug!(rid, destination = %destination, "No recorded arrival at destination");
        return Ok(None);
    };

    match DelayRecord::from_times(&key.route, rid, key.date, scheduled, actual) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(rid, error = %e, "Dropping service with bad times");
            Ok(None)
        }
    }
}
