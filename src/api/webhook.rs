//! Webhook handler shared by every hook route

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
};
use serde_json::Value;
use tracing::{Level, enabled, error, info, trace, warn};

use crate::SharedState;
use crate::api::secret::verify_request;
use crate::event::{Event, URL_PARAMS_KEY};
use crate::hook::Hook;

pub const GITLAB_EVENT_HEADER: &str = "X-Gitlab-Event";
pub const GITHUB_EVENT_HEADER: &str = "X-GitHub-Event";

/// Validate the request, decode the event and hand it to the dispatcher.
///
/// Returns as soon as the dispatch is spawned; command results never reach
/// the caller.
pub async fn handle_webhook(
    state: SharedState,
    hook: Arc<Hook>,
    params: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    info!("Called {}", hook.url());

    if enabled!(Level::TRACE) {
        let pretty = serde_json::from_slice::<Value>(&body)
            .and_then(|v| serde_json::to_string_pretty(&v))
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        trace!("Hook {} received data {}", hook.url(), pretty);
    }

    if let Some(secret) = hook.secret() {
        if let Err(rejection) = verify_request(secret, &headers, &body) {
            warn!("Request with {} for hook {}", rejection, hook.url());
            return StatusCode::FORBIDDEN;
        }
    }

    let event_header = [GITLAB_EVENT_HEADER, GITHUB_EVENT_HEADER]
        .into_iter()
        .find_map(|name| headers.get(name).and_then(|v| v.to_str().ok()));

    let mut event = match Event::from_payload(&body, event_header) {
        Ok(event) => event,
        Err(e) => {
            error!("Error parsing JSON for {}: {}", hook.url(), e);
            return StatusCode::BAD_REQUEST;
        }
    };
    let params = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    event.insert(URL_PARAMS_KEY, Value::Object(params));

    state.dispatcher.spawn(hook, event);
    StatusCode::OK
}
