//! RelayMQ - an MQTT 3.1.1 broker
//!
//! A single-process broker: strict wire codec, trie-based subscription
//! matching, per-client sessions with QoS 0/1/2 delivery, retained and
//! will messages, and session continuity across reconnects.

pub mod broker;
pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use hooks::{ClientInfo, CompositeHooks, DefaultHooks, Hooks, SessionTerminatedReason};
pub use persistence::{MemoryBackend, SessionBackend, SessionSnapshot};
pub use protocol::{ConnectReturnCode, Packet, QoS, SubscribeReturnCode};
