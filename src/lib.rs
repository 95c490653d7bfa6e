//! # a3s-pubsub
//!
//! In-process topic router with durable, batched subscription delivery for
//! the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-pubsub` routes messages published on hierarchical topics
//! (`market.forex.usd`) to listeners registered on exact topics, prefixes
//! (`market.*`) or suffixes (`*.usd`). Every emit reports back once all
//! matched listeners have acknowledged it.
//!
//! Durable subscriptions append matching messages to a per-subscriber log
//! that survives restarts, and deliver it to a consumer in batches with
//! at-least-once semantics and retry.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_pubsub::{Message, Router};
//! use a3s_pubsub::router::listener::from_fn;
//!
//! # async fn example() -> a3s_pubsub::Result<()> {
//! let router: Router = Router::new();
//! router.listen("market.*", from_fn(|m: &Message| println!("got {:?}", m)))?;
//!
//! let report = router.emit("market.forex", Message::from("USD/CNY 7.35")).await;
//! assert_eq!(report.delivered, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Durable subscriptions
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use a3s_pubsub::{Batch, EventError, Message, OpenOptions, PubSubConfig, Router, SubscriptionManager};
//!
//! # async fn example() -> a3s_pubsub::Result<()> {
//! let config = PubSubConfig::default();
//! let router = Arc::new(Router::from_config(&config)?);
//! let manager = SubscriptionManager::from_config(router.clone(), &config)?;
//! manager.load_subscriptions().await?;
//!
//! manager
//!     .open_subscription("market.*", "analyst", OpenOptions::default(), |batch: Batch| async move {
//!         println!("{} bytes from {}", batch.len(), batch.sub_id);
//!         Ok::<(), EventError>(())
//!     })
//!     .await?;
//!
//! // resolves once the message is durably appended
//! router.emit("market.forex", Message::from("USD/CNY 7.35")).await.into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Router**: length-fingerprinted listener index, acked fan-out
//! - **SubscriptionManager**: create / open / close / delete / load
//! - **Log** / **LogStore** traits: durable storage port (file, memory)
//! - **IndexStore** trait: persisted subscription index

pub mod backoff;
pub mod config;
pub mod delivery;
pub mod error;
pub mod log;
pub mod router;
pub mod state;
pub mod subscription;
pub mod types;

// Re-export core types
pub use backoff::BackoffPolicy;
pub use config::{DeliveryConfig, PubSubConfig, RetryConfig};
pub use delivery::{Ack, Completion, EmitReport};
pub use error::{EventError, Result};
pub use log::{FileLogStore, Log, LogStore, MemoryLogStore};
pub use router::listener::{from_fn, with_ack, Listener, ListenerId};
pub use router::Router;
pub use state::{FileIndexStore, IndexStore, MemoryIndexStore};
pub use subscription::{BatchHandler, SubscriptionManager};
pub use types::{
    Batch, CloseOptions, Encode, Json, Message, OpenOptions, SubscriptionInfo, SubscriptionStatus,
};
