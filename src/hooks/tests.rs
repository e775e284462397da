//! Hook composition tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::*;
use crate::protocol::{ConnectReturnCode, Publish, QoS, SubscribeReturnCode};

fn client() -> ClientInfo {
    ClientInfo {
        client_id: "c1".into(),
        addr: test_addr(),
        username: None,
        clean_session: true,
        keep_alive: 60,
    }
}

fn test_addr() -> SocketAddr {
    "127.0.0.1:1883".parse().unwrap()
}

struct DenyConnect;

#[async_trait]
impl Hooks for DenyConnect {
    async fn on_connect(&self, _client: &ClientInfo) -> ConnectReturnCode {
        ConnectReturnCode::NotAuthorized
    }
}

struct CapQos1;

#[async_trait]
impl Hooks for CapQos1 {
    async fn on_subscribe(
        &self,
        _client: &ClientInfo,
        _filter: &str,
        requested: QoS,
    ) -> SubscribeReturnCode {
        SubscribeReturnCode::Granted(requested.min(QoS::AtLeastOnce))
    }
}

struct CountCloses(Arc<AtomicUsize>);

#[async_trait]
impl Hooks for CountCloses {
    async fn on_close(&self, _client: &ClientInfo, _error: Option<&str>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct PanicOnMsg;

#[async_trait]
impl Hooks for PanicOnMsg {
    async fn on_msg_arrived(&self, _client: &ClientInfo, _publish: &Publish) -> bool {
        panic!("boom");
    }
}

#[tokio::test]
async fn default_hooks_allow_everything() {
    let hooks = DefaultHooks;
    assert!(hooks.on_accept(test_addr()).await);
    assert!(hooks.on_connect(&client()).await.is_accepted());
    assert_eq!(
        hooks.on_subscribe(&client(), "a/b", QoS::ExactlyOnce).await,
        SubscribeReturnCode::Granted(QoS::ExactlyOnce)
    );
    assert!(hooks.on_msg_arrived(&client(), &Publish::default()).await);
}

#[tokio::test]
async fn composite_first_refusal_wins() {
    let hooks = CompositeHooks::new().with(DefaultHooks).with(DenyConnect);
    assert_eq!(
        hooks.on_connect(&client()).await,
        ConnectReturnCode::NotAuthorized
    );
}

#[tokio::test]
async fn composite_caps_granted_qos() {
    let hooks = CompositeHooks::new().with(CapQos1).with(DefaultHooks);
    assert_eq!(
        hooks.on_subscribe(&client(), "a/b", QoS::ExactlyOnce).await,
        SubscribeReturnCode::Granted(QoS::AtLeastOnce)
    );
    assert_eq!(
        hooks.on_subscribe(&client(), "a/b", QoS::AtMostOnce).await,
        SubscribeReturnCode::Granted(QoS::AtMostOnce)
    );
}

#[tokio::test]
async fn composite_runs_every_observer() {
    let count = Arc::new(AtomicUsize::new(0));
    let hooks = CompositeHooks::new()
        .with(CountCloses(count.clone()))
        .with(CountCloses(count.clone()));

    hooks.on_close(&client(), None).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn panicking_permission_hook_denies() {
    let hooks = PanicOnMsg;
    let allowed = contain_panic(
        "on_msg_arrived",
        false,
        hooks.on_msg_arrived(&client(), &Publish::default()),
    )
    .await;
    assert!(!allowed);
}
