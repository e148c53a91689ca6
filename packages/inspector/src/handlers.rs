use crate::config::{CaptureSettings, PARSER_HEADER_LIMIT};
use crate::error::{CaptureError, CaptureResult};
use crate::models::{CaptureAck, CapturedRequest, MultiMap, RequestIdGenerator};
use crate::store::RequestSink;
use actix_web::error::PayloadError;
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Placeholder stored instead of a redacted header value
pub const REDACTED: &str = "[REDACTED]";

/// State shared by every capture worker
pub struct CaptureState {
    pub sink: Arc<dyn RequestSink>,
    pub ids: Arc<RequestIdGenerator>,
    pub settings: CaptureSettings,
    redact: HashSet<String>,
}

impl CaptureState {
    pub fn new(
        sink: Arc<dyn RequestSink>,
        ids: Arc<RequestIdGenerator>,
        mut settings: CaptureSettings,
    ) -> Self {
        settings.max_headers = settings.max_headers.min(PARSER_HEADER_LIMIT);
        let redact = settings
            .redact_headers
            .iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        Self {
            sink,
            ids,
            settings,
            redact,
        }
    }
}

/// Extract real client IP address from captured headers
fn extract_ip_address(req: &HttpRequest, headers: &MultiMap) -> String {
    // Priority: X-Real-IP > X-Forwarded-For (first IP) > peer address
    let first = |name: &str| headers.get(name).and_then(|values| values.first());

    if let Some(real_ip) = first("x-real-ip") {
        return real_ip.trim().to_string();
    }

    if let Some(forwarded) = first("x-forwarded-for") {
        if let Some(first_ip) = forwarded.split(',').next() {
            return first_ip.trim().to_string();
        }
    }

    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Collect headers in arrival order, masking configured names and stopping at the cap
fn collect_headers(req: &HttpRequest, state: &CaptureState) -> (MultiMap, bool) {
    let mut headers = MultiMap::new();
    let mut kept = 0usize;

    for (name, value) in req.headers().iter() {
        if kept >= state.settings.max_headers {
            return (headers, true);
        }
        kept += 1;

        let name = name.as_str().to_ascii_lowercase();
        let value = if state.redact.contains(&name) {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        headers.entry(name).or_default().push(value);
    }

    (headers, false)
}

// handle ?a=b&a=c , ?a= and ?a
fn parse_query(query: &str) -> MultiMap {
    let mut params = MultiMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// Read the whole payload, keeping at most `limit` bytes.
///
/// The remainder is drained so the connection stays usable. Returns the
/// kept bytes and the total number of bytes received.
async fn read_capped_body<S>(payload: &mut S, limit: usize) -> CaptureResult<(Vec<u8>, usize)>
where
    S: Stream<Item = Result<Bytes, PayloadError>> + Unpin,
{
    let mut body = Vec::new();
    let mut received = 0usize;

    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| CaptureError::MalformedRequest(e.to_string()))?;
        received += chunk.len();

        let room = limit.saturating_sub(body.len());
        if room > 0 {
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    Ok((body, received))
}

fn acknowledgment() -> HttpResponse {
    HttpResponse::Ok()
        .insert_header(("Access-Control-Allow-Origin", "*"))
        .insert_header((
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, PATCH, OPTIONS",
        ))
        .insert_header(("Access-Control-Allow-Headers", "*"))
        .json(CaptureAck::CAPTURED)
}

/// Catch-all handler: every method and path ends up here
#[instrument(skip(state, req, payload), fields(method = %req.method(), path = %req.path()))]
pub async fn capture_handler(
    req: HttpRequest,
    mut payload: web::Payload,
    state: web::Data<CaptureState>,
) -> CaptureResult<HttpResponse> {
    let (body, received) = read_capped_body(&mut payload, state.settings.max_body_size)
        .await
        .inspect_err(|e| info!(error = %e, "Discarding malformed request"))?;

    let (headers, headers_truncated) = collect_headers(&req, &state);
    let user_agent = headers
        .get("user-agent")
        .and_then(|values| values.first())
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    let client_address = extract_ip_address(&req, &headers);
    let truncated = received > body.len();

    let request = CapturedRequest {
        id: state.ids.next_id(),
        timestamp: Utc::now(),
        method: req.method().as_str().to_ascii_uppercase(),
        path: req.path().to_string(),
        query_params: parse_query(req.query_string()),
        headers,
        headers_truncated,
        body,
        truncated,
        client_address,
        content_length: received,
        user_agent,
    };

    debug!(
        id = request.id,
        content_length = received,
        truncated,
        headers_truncated,
        "Captured request"
    );

    state.sink.deliver(request);

    Ok(acknowledgment())
}
