//! The narrow surface application services use to push events to clients.

#[cfg(feature = "relay")]
use crate::relay::RelayHandle;
use crate::ws::hub::{DeliveryError, Hub};
use crate::ws::message::{Event, Message, OrderStatusChanged, Promotion, StockAlert};
use crate::ws::types::UserId;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// A façade over an optional [`Hub`].
///
/// Order services, admin tooling, and stock monitors hold a `Publisher` rather
/// than the hub itself. A publisher may exist before the hub is attached or
/// after it is detached; in both cases every call reports "not delivered".
///
/// With a relay attached, messages go through the relay instead and reach
/// the local hub through this instance's relay listener. A message then
/// counts as delivered once the relay has accepted it.
#[derive(Clone, Default)]
pub struct Publisher {
    hub: Arc<RwLock<Option<Hub>>>,
    #[cfg(feature = "relay")]
    relay: Arc<RwLock<Option<RelayHandle>>>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("attached", &self.hub.read().is_some())
            .finish()
    }
}

impl Publisher {
    pub fn new(hub: Hub) -> Self {
        Self {
            hub: Arc::new(RwLock::new(Some(hub))),
            ..Self::default()
        }
    }

    /// A publisher with no hub attached yet.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Attaches a hub. Every clone of this publisher sees it.
    pub fn attach(&self, hub: Hub) {
        *self.hub.write() = Some(hub);
    }

    /// Detaches and returns the current hub, if any.
    pub fn detach(&self) -> Option<Hub> {
        self.hub.write().take()
    }

    fn hub(&self) -> Option<Hub> {
        self.hub.read().clone()
    }

    /// Routes every later message through `relay`. Every clone sees it.
    #[cfg(feature = "relay")]
    pub fn attach_relay(&self, relay: RelayHandle) {
        *self.relay.write() = Some(relay);
    }

    #[cfg(feature = "relay")]
    pub fn detach_relay(&self) -> Option<RelayHandle> {
        self.relay.write().take()
    }

    /// Gives the message back when no relay is attached or it has stopped.
    #[cfg(feature = "relay")]
    fn relay(&self, message: Message) -> Result<(), Message> {
        let Some(relay) = self.relay.read().clone() else {
            return Err(message);
        };
        relay.send(message).inspect_err(|_| {
            warn!("Relay publisher stopped; delivering locally.");
        })
    }

    /// Same as [`send_to_user`](Self::send_to_user), with the reason for a
    /// failed delivery.
    pub fn try_send_to_user(&self, user_id: UserId, message: Message) -> Result<(), DeliveryError> {
        #[cfg(feature = "relay")]
        let message = match self.relay(Message {
            user_id: Some(user_id),
            ..message
        }) {
            Ok(()) => return Ok(()),
            Err(message) => message,
        };
        let hub = self.hub().ok_or(DeliveryError::HubClosed)?;
        hub.send_to_user(user_id, message)
    }

    /// Delivers a message to one user. Returns whether it was queued.
    pub fn send_to_user(&self, user_id: UserId, message: Message) -> bool {
        let kind = message.event.kind().to_owned();
        match self.try_send_to_user(user_id, message) {
            Ok(()) => {
                debug!(user_id, kind = %kind, "Sent message to user.");
                true
            }
            Err(DeliveryError::NotConnected(_)) => {
                debug!(user_id, kind = %kind, "User not connected.");
                false
            }
            Err(e) => {
                warn!(user_id, kind = %kind, "Failed to send message to user: {}", e);
                false
            }
        }
    }

    /// Delivers a message to every connected session.
    pub fn broadcast(&self, message: Message) {
        #[cfg(feature = "relay")]
        let message = match self.relay(message) {
            Ok(()) => {
                debug!("Broadcast handed to relay.");
                return;
            }
            Err(message) => message,
        };
        let Some(hub) = self.hub() else {
            debug!("No hub attached; broadcast dropped.");
            return;
        };
        let kind = message.event.kind().to_owned();
        match hub.broadcast(message) {
            Ok(()) => debug!(kind = %kind, "Broadcast message."),
            Err(e) => warn!(kind = %kind, "Broadcast dropped: {}", e),
        }
    }

    pub fn online_user_count(&self) -> usize {
        self.hub().map_or(0, |hub| hub.online_user_count())
    }

    pub fn total_connections(&self) -> usize {
        self.hub().map_or(0, |hub| hub.total_connections())
    }

    /// Tells a user that one of their orders changed status.
    pub fn notify_order_status(&self, user_id: UserId, order_id: u64, status: &str) -> bool {
        let event = Event::Order(OrderStatusChanged {
            order_id,
            status: status.to_owned(),
            message: "Your order status has been updated".to_owned(),
        });
        self.send_to_user(user_id, Message::to_user(user_id, event))
    }

    /// Announces a promotion to everyone connected.
    pub fn broadcast_promotion(&self, title: &str, content: &str) {
        let event = Event::Promotion(Promotion {
            title: title.to_owned(),
            content: content.to_owned(),
        });
        self.broadcast(Message::new(event));
    }

    /// Warns an administrator that a product is running low.
    pub fn notify_stock_alert(
        &self,
        admin_user_id: UserId,
        product_id: u64,
        product_name: &str,
        stock: i64,
    ) -> bool {
        let event = Event::StockAlert(StockAlert {
            product_id,
            product_name: product_name.to_owned(),
            stock,
            message: "Product stock is running low, please restock".to_owned(),
        });
        self.send_to_user(admin_user_id, Message::to_user(admin_user_id, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::ws::types::{Outbound, SessionHandle};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn connected(hub: &Hub, user_id: Option<UserId>) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(8);
        hub.register(SessionHandle::new(Uuid::new_v4(), user_id, tx))
            .await;
        rx
    }

    #[test]
    fn test_detached_publisher_reports_not_delivered() {
        let publisher = Publisher::detached();
        assert!(!publisher.notify_order_status(1, 10, "paid"));
        publisher.broadcast_promotion("Sale", "Everything must go");
        assert_eq!(publisher.online_user_count(), 0);
        assert_eq!(publisher.total_connections(), 0);
        assert_eq!(
            publisher.try_send_to_user(1, Message::new(Event::System("x".into()))),
            Err(DeliveryError::HubClosed)
        );
    }

    #[tokio::test]
    async fn test_order_status_reaches_user() {
        let hub = Hub::new(HubConfig::default());
        let mut rx = connected(&hub, Some(21)).await;
        let publisher = Publisher::new(hub);

        assert!(publisher.notify_order_status(21, 1001, "shipped"));
        let message = rx.recv().await.unwrap();
        assert_eq!(message.user_id, Some(21));
        match &message.event {
            Event::Order(order) => {
                assert_eq!(order.order_id, 1001);
                assert_eq!(order.status, "shipped");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!publisher.notify_order_status(22, 1002, "shipped"));
    }

    #[tokio::test]
    async fn test_attach_is_visible_to_clones() {
        let publisher = Publisher::detached();
        let order_service = publisher.clone();

        let hub = Hub::new(HubConfig::default());
        let mut admin = connected(&hub, Some(1)).await;
        let mut shopper = connected(&hub, None).await;
        publisher.attach(hub);

        assert_eq!(order_service.online_user_count(), 1);
        assert_eq!(order_service.total_connections(), 2);
        assert!(order_service.notify_stock_alert(1, 5, "Kettle", 2));
        assert_eq!(admin.recv().await.unwrap().event.kind(), "stock_alert");

        order_service.broadcast_promotion("Sale", "20% off");
        assert_eq!(shopper.recv().await.unwrap().event.kind(), "promotion");

        assert!(publisher.detach().is_some());
        assert!(!order_service.notify_stock_alert(1, 5, "Kettle", 1));
    }

    #[cfg(feature = "relay")]
    #[tokio::test]
    async fn test_attached_relay_carries_messages() {
        let hub = Hub::new(HubConfig::default());
        let mut local = connected(&hub, Some(21)).await;
        let publisher = Publisher::new(hub.clone());
        let (relay, mut relayed) = RelayHandle::channel();
        publisher.attach_relay(relay);

        assert!(publisher.send_to_user(21, Message::new(Event::System("paid".into()))));
        let message = relayed.recv().await.unwrap();
        assert_eq!(message.user_id, Some(21));
        assert_eq!(message.event, Event::System("paid".into()));

        publisher.broadcast_promotion("Sale", "20% off");
        let message = relayed.recv().await.unwrap();
        assert_eq!(message.event.kind(), "promotion");
        assert_eq!(message.user_id, None);

        // Local delivery is left to this instance's relay listener.
        assert!(hub.flush().await);
        assert!(local.try_recv().is_err());
    }

    #[cfg(feature = "relay")]
    #[tokio::test]
    async fn test_stopped_relay_falls_back_to_local_hub() {
        let hub = Hub::new(HubConfig::default());
        let mut local = connected(&hub, Some(21)).await;
        let publisher = Publisher::new(hub);
        let (relay, relayed) = RelayHandle::channel();
        publisher.attach_relay(relay);
        drop(relayed);

        assert!(publisher.notify_order_status(21, 7, "shipped"));
        assert_eq!(local.recv().await.unwrap().event.kind(), "order");

        assert!(publisher.detach_relay().is_some());
    }
}
