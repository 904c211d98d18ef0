//! HTTP boundary: one POST route per hook

pub mod allowlist;
pub mod secret;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::HeaderMap,
    middleware,
    routing::post,
};

use crate::SharedState;
use crate::hook::Hook;

pub use allowlist::AllowList;
pub use webhook::handle_webhook;

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 16384;

/// Build the router serving `hooks`. Peers are filtered only when `allow` is
/// non-empty.
pub fn router(hooks: Vec<Hook>, state: SharedState, allow: AllowList) -> Router {
    let mut router = Router::new();

    for hook in hooks {
        let hook = Arc::new(hook);
        let url = hook.url().to_string();
        router = router.route(
            &url,
            post(
                move |State(state): State<SharedState>,
                      Path(params): Path<HashMap<String, String>>,
                      headers: HeaderMap,
                      body: Bytes| {
                    let hook = Arc::clone(&hook);
                    async move { handle_webhook(state, hook, params, headers, body).await }
                },
            ),
        );
    }

    let router = router
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    if allow.is_empty() {
        router
    } else {
        router.layer(middleware::from_fn_with_state(
            Arc::new(allow),
            allowlist::admit_peer,
        ))
    }
}
