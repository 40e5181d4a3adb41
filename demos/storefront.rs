use async_trait::async_trait;
use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};
use storefront_realtime::prelude::*;
use tracing::info;

// Demo tokens look like `user-<id>`. A real deployment plugs in JWT or a
// session lookup here.
struct DevTokens;

#[derive(Debug)]
struct InvalidToken(String);

impl fmt::Display for InvalidToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid token {:?}", self.0)
    }
}

impl std::error::Error for InvalidToken {}

#[async_trait]
impl TokenValidator for DevTokens {
    type User = UserId;
    type Error = InvalidToken;

    async fn validate_token(&self, token: &str) -> Result<UserId, InvalidToken> {
        token
            .strip_prefix("user-")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| InvalidToken(token.to_string()))
    }
}

const ADMIN_USER_ID: UserId = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("storefront=info".parse()?)
                .add_directive("storefront_realtime=info".parse()?),
        )
        .init();

    let config = RealtimeConfig::from_env()?;
    let hub = Hub::new(config.hub.clone());
    let publisher = Publisher::new(hub.clone());

    // With REDIS_URL set, events fan out to every instance sharing the broker.
    #[cfg(feature = "relay")]
    if let Ok(redis_url) = std::env::var("REDIS_URL") {
        let relay = RedisRelay::new(&redis_url)?;
        relay.spawn_listener(hub.clone());
        publisher.attach_relay(relay.spawn_publisher());
        info!(channel = relay.channel(), "Redis relay enabled.");
    }

    let store = Arc::new(MemoryStockStore::new());
    store.insert(1, "Espresso Machine", 12, ProductStatus::Active);
    store.insert(2, "Grinder", 4, ProductStatus::Active);
    store.insert(3, "Milk Jug", 0, ProductStatus::OutOfStock);

    let stock = StockCoordinator::new(store, &config.stock).with_alerts(LowStockAlerts {
        publisher: publisher.clone(),
        admin_user_id: ADMIN_USER_ID,
        threshold: config.stock.low_stock_threshold,
    });

    // Stands in for the order service: user 2's order moves along every 30s.
    let orders = publisher.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        for status in ["paid", "shipped", "delivered"].into_iter().cycle() {
            ticker.tick().await;
            orders.notify_order_status(2, 1001, status);
        }
    });

    let app = router(AppState {
        hub: hub.clone(),
        publisher,
        stock,
        tokens: Arc::new(DevTokens),
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("Listening on {}", addr);
    info!("Connect with: websocat 'ws://{}/ws?token=user-2'", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    hub.shutdown().await;
    Ok(())
}
