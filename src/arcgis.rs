use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::domain::{ArcgisDescriptor, Feature};
use crate::error::HarvestError;
use crate::fetch::{BatchFetcher, Page, PageCursor, PageError};

/// Pages through an ArcGIS feature service layer with `resultOffset` /
/// `resultRecordCount`, ordered by object id, returning GeoJSON.
#[derive(Clone)]
pub struct ArcgisFetcher {
    client: Client,
    descriptor: ArcgisDescriptor,
}

impl ArcgisFetcher {
    pub fn with_client(client: Client, descriptor: ArcgisDescriptor) -> Self {
        Self { client, descriptor }
    }

    pub fn query_url(&self) -> String {
        query_url(&self.descriptor.url)
    }
}

impl BatchFetcher for ArcgisFetcher {
    fn fetch_page(&self, cursor: PageCursor) -> Result<Page, PageError> {
        let response = self
            .client
            .get(self.query_url())
            .query(&query_params(&self.descriptor, cursor))
            .send()
            .map_err(|err| PageError::Transient(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "ArcGIS request failed".to_string());
            return Err(PageError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                snippet(&message)
            )));
        }

        let body = response
            .bytes()
            .map_err(|err| PageError::Transient(err.to_string()))?;
        parse_page(&body, cursor)
    }
}

pub fn http_client() -> Result<Client, HarvestError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("parcel-harvest/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| HarvestError::ArcgisHttp(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|err| HarvestError::ArcgisHttp(err.to_string()))
}

pub fn query_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/query") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/query")
    }
}

pub fn query_params(
    descriptor: &ArcgisDescriptor,
    cursor: PageCursor,
) -> Vec<(&'static str, String)> {
    let filter = descriptor
        .filter
        .as_deref()
        .map(str::trim)
        .filter(|filter| !filter.is_empty())
        .unwrap_or("1=1");
    vec![
        ("where", filter.to_string()),
        ("outFields", descriptor.out_fields.join(",")),
        ("returnGeometry", "true".to_string()),
        ("outSR", "4326".to_string()),
        ("orderByFields", format!("{} ASC", descriptor.order_by_field())),
        ("resultOffset", cursor.offset.to_string()),
        ("resultRecordCount", cursor.limit.to_string()),
        ("f", "geojson".to_string()),
    ]
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    features: Option<Vec<Feature>>,
    #[serde(default)]
    error: Option<ServiceError>,
    #[serde(default, rename = "exceededTransferLimit")]
    exceeded_transfer_limit: Option<bool>,
    #[serde(default)]
    properties: Option<ResponseProperties>,
}

#[derive(Debug, Deserialize)]
struct ResponseProperties {
    #[serde(default, rename = "exceededTransferLimit")]
    exceeded_transfer_limit: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// Parses a GeoJSON query response.
///
/// ArcGIS reports service errors in a 200 body; retryable codes become
/// transient failures, anything else is treated as malformed.
pub fn parse_page(body: &[u8], cursor: PageCursor) -> Result<Page, PageError> {
    let response: QueryResponse =
        serde_json::from_slice(body).map_err(|err| PageError::Malformed(err.to_string()))?;

    if let Some(error) = response.error {
        let code = error
            .code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "?".to_string());
        let message = format!(
            "service error {code}: {}",
            error.message.unwrap_or_default()
        );
        return match error.code {
            Some(code) if is_retryable_status(code) => Err(PageError::Transient(message)),
            _ => Err(PageError::Malformed(message)),
        };
    }

    let features = response
        .features
        .ok_or_else(|| PageError::Malformed("response has no features array".to_string()))?;
    let exceeded = response
        .exceeded_transfer_limit
        .or(response.properties.and_then(|props| props.exceeded_transfer_limit));
    let has_more = exceeded.unwrap_or(features.len() as u64 >= cursor.limit);
    Ok(Page::new(features, has_more))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn snippet(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
