//! Service discovery.
//!
//! - [`store`]: a key-value store with TTLs and gap-free prefix watches.
//! - [`Agent`]: register, unregister, heartbeat and subscribe on top of a
//!   store, served over HTTP by [`http`].
//! - [`HttpDiscovery`]: the same [`Discovery`] capability against a remote
//!   agent.
//! - [`ServiceSet`]: a live, filtered view of one service with leader
//!   election and watchers.

pub mod agent;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod service_set;
pub mod store;

pub use agent::{service_prefix, Agent, AgentConfig, SERVICES_PREFIX};
pub use client::HttpDiscovery;
pub use discovery::{Attrs, Discovery, ServiceUpdate, SubscribeEvent, Subscription};
pub use error::{DiscoveryError, StoreError};
pub use heartbeat::{register_with_heartbeat, Heartbeater};
pub use service_set::{
    Filter, Instance, LeaderWatch, ServiceEvent, ServiceSet, ServiceSetConfig, ServiceWatch,
};
pub use store::{MemoryStore, Store};
