//! # Storefront Realtime
//!
//! Realtime notifications and concurrent stock updates for a storefront
//! backend, built on Axum and Tokio.
//!
//! ## Core Features
//!
//! - **Connection `Hub`**: One session per user, targeted delivery, broadcast to
//!   everyone, and eviction of sessions that cannot keep up.
//! - **`Session`**: Drives one WebSocket with heartbeats, write deadlines, a
//!   message size limit, and `ping`/`echo` handling.
//! - **`Publisher`**: The narrow surface order, promotion, and stock services use
//!   to push events without holding the hub.
//! - **`StockCoordinator`**: Applies a batch of stock deltas over a bounded worker
//!   pool, one locked unit of work per product.
//! - **Flexible Authentication**: `WsAuth` / `MaybeWsAuth` extractors that read a
//!   token from the `Authorization` header or the `token` query parameter.
//! - **Redis Relay (Optional)**: Fans events out across instances.
//!
//! ## Getting Started
//!
//! See [`api::router`] for the ready-made HTTP surface, or the `ws` module to
//! wire the hub into your own routes.

pub mod config;
pub mod stock;
pub mod ws;

// The HTTP surface resolves users through the auth extractors.
#[cfg(feature = "auth")]
pub mod api;

#[cfg(feature = "auth")]
pub mod auth;

#[cfg(feature = "relay")]
pub mod relay;

/// Public prelude for convenience.
///
/// `use storefront_realtime::prelude::*;`
pub mod prelude {
    pub use crate::config::{HubConfig, RealtimeConfig, StockConfig};
    pub use crate::stock::{
        BatchError, BatchReport, LowStockAlerts, MemoryStockStore, ProductStatus, StockCoordinator,
        StockError, StockLevel, StockStore,
    };
    pub use crate::ws::{
        hub::{DeliveryError, Hub},
        message::{Event, Message, Target},
        publisher::Publisher,
        session::Session,
        types::{ConnectionId, UserId},
        upgrade::upgrade_handler,
    };

    #[cfg(feature = "auth")]
    pub use crate::api::{AppState, router};

    #[cfg(feature = "auth")]
    pub use crate::auth::{MaybeWsAuth, TokenValidator, WsAuth};

    #[cfg(feature = "relay")]
    pub use crate::relay::{RedisRelay, RelayHandle};

    #[cfg(feature = "postgres")]
    pub use crate::stock::PgStockStore;
}
