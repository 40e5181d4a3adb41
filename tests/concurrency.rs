use std::collections::HashMap;
use std::sync::Arc;
use storefront_realtime::config::{HubConfig, StockConfig};
use storefront_realtime::prelude::*;
use storefront_realtime::ws::types::SessionHandle;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_on_one_product_serialize() {
    let store = Arc::new(MemoryStockStore::new());
    store.insert(7, "Kettle", 500, ProductStatus::Active);
    store.insert(8, "Mug", 500, ProductStatus::Active);
    let coordinator = StockCoordinator::new(store.clone(), &StockConfig::default());

    let mut batches = Vec::new();
    for _ in 0..100 {
        let coordinator = coordinator.clone();
        batches.push(tokio::spawn(async move {
            coordinator.apply_batch(HashMap::from([(7, -1), (8, -2)])).await
        }));
    }
    for batch in batches {
        batch.await.unwrap().unwrap();
    }

    assert_eq!(store.stock_level(7).await.unwrap().stock, 400);
    assert_eq!(store.stock_level(8).await.unwrap().stock, 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overselling_is_impossible() {
    let store = Arc::new(MemoryStockStore::new());
    store.insert(1, "Limited Edition", 10, ProductStatus::Active);
    let coordinator = StockCoordinator::new(store.clone(), &StockConfig::default());

    let mut batches = Vec::new();
    for _ in 0..25 {
        let coordinator = coordinator.clone();
        batches.push(tokio::spawn(async move {
            coordinator.apply_batch(HashMap::from([(1, -1)])).await.is_ok()
        }));
    }
    let mut sold = 0;
    for batch in batches {
        if batch.await.unwrap() {
            sold += 1;
        }
    }

    assert_eq!(sold, 10);
    let level = store.stock_level(1).await.unwrap();
    assert_eq!(level.stock, 0);
    assert_eq!(level.status, ProductStatus::OutOfStock);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_session_per_user_under_concurrent_registration() {
    let hub = Hub::new(HubConfig::default());

    let mut tasks = Vec::new();
    for i in 0..64u64 {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let (tx, rx) = mpsc::channel(4);
            hub.register(SessionHandle::new(Uuid::new_v4(), Some(i % 8), tx))
                .await;
            rx
        }));
    }
    let mut queues = Vec::new();
    for task in tasks {
        queues.push(task.await.unwrap());
    }
    assert!(hub.flush().await);

    assert_eq!(hub.online_user_count(), 8);
    assert_eq!(hub.total_connections(), 8);

    // Every replaced session saw its queue closed; exactly one per user is live.
    let open = queues.iter().filter(|rx| !rx.is_closed()).count();
    assert_eq!(open, 8);

    hub.broadcast(Message::new(Event::System("hello".into())))
        .unwrap();
    assert!(hub.flush().await);
    let mut delivered = 0;
    for rx in queues.iter_mut() {
        if rx.try_recv().is_ok() {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 8);

    hub.shutdown().await;
    assert!(queues.iter().all(|rx| rx.is_closed()));
}
