//! Provides the Axum handler for upgrading HTTP requests to hub sessions.

use crate::ws::hub::Hub;
use crate::ws::session::Session;
use crate::ws::types::UserId;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use futures_util::StreamExt;
use tracing::{error, instrument};

/// Upgrades the request and hands the socket to a new [`Session`].
///
/// Authentication happens before this is called; `user_id` is whatever the
/// identity layer resolved, or `None` for an anonymous client. Anonymous
/// sessions receive broadcasts but cannot be targeted.
///
/// ```rust,no_run
/// # use axum::{Router, routing::get, extract::{State, WebSocketUpgrade}};
/// # use storefront_realtime::prelude::*;
/// # use storefront_realtime::config::HubConfig;
/// #[tokio::main]
/// async fn main() {
///     let hub = Hub::new(HubConfig::default());
///     let app: Router = Router::new()
///         .route(
///             "/ws",
///             get(|ws: WebSocketUpgrade, State(hub): State<Hub>| async move {
///                 upgrade_handler(ws, hub, None).await
///             }),
///         )
///         .with_state(hub);
///     // ... serve the app
/// }
/// ```
#[instrument(skip_all, fields(user_id = ?user_id))]
pub async fn upgrade_handler(ws: WebSocketUpgrade, hub: Hub, user_id: Option<UserId>) -> Response {
    let max_message_size = hub.config().max_message_size;

    ws.max_message_size(max_message_size)
        .on_failed_upgrade(|e| error!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            Session::new(hub, user_id).run(sink, stream).await;
        })
}
