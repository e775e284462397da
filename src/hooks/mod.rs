//! Broker extension points
//!
//! A flat set of optional callbacks invoked at well-defined points of a
//! connection's lifetime. Plugins implement [`Hooks`] and override the
//! methods they care about; [`CompositeHooks`] chains several plugins
//! with any-denial-denies semantics.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::error;

use crate::protocol::{ConnectReturnCode, Publish, QoS, SubscribeReturnCode};

#[cfg(test)]
mod tests;

/// The hook-visible view of a client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: Arc<str>,
    pub addr: SocketAddr,
    pub username: Option<String>,
    pub clean_session: bool,
    pub keep_alive: u16,
}

/// Why a session was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTerminatedReason {
    /// The owning connection closed and the session was clean
    Normal,
    /// Replaced by a new CONNECT with the same client id
    Takeover,
}

impl fmt::Display for SessionTerminatedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Takeover => write!(f, "takeover"),
        }
    }
}

/// Broker lifecycle hooks.
///
/// Every method has a default implementation that allows the operation
/// or does nothing, so implementors override only what they need.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// A transport connection was accepted, before any MQTT traffic.
    /// Returning false closes the socket immediately.
    async fn on_accept(&self, _addr: SocketAddr) -> bool {
        true
    }

    /// A CONNECT packet passed protocol validation. The returned code is
    /// sent in the CONNACK; anything but `Accepted` closes the
    /// connection.
    async fn on_connect(&self, _client: &ClientInfo) -> ConnectReturnCode {
        ConnectReturnCode::Accepted
    }

    /// CONNACK(Accepted) was sent.
    async fn on_connected(&self, _client: &ClientInfo) {}

    /// A fresh session was created for the client.
    async fn on_session_created(&self, _client: &ClientInfo) {}

    /// An existing session was reattached to a new connection.
    async fn on_session_resumed(&self, _client: &ClientInfo) {}

    /// A subscription request for one filter. The returned code caps the
    /// granted QoS; `Failure` denies the subscription.
    async fn on_subscribe(
        &self,
        _client: &ClientInfo,
        _filter: &str,
        requested: QoS,
    ) -> SubscribeReturnCode {
        SubscribeReturnCode::Granted(requested)
    }

    /// An inbound PUBLISH was decoded. Returning false drops the message
    /// without routing it (acknowledgements are still sent).
    async fn on_msg_arrived(&self, _client: &ClientInfo, _publish: &Publish) -> bool {
        true
    }

    /// The client's session was destroyed.
    async fn on_session_terminated(&self, _client: &ClientInfo, _reason: SessionTerminatedReason) {
    }

    /// The connection closed. `error` carries the rendered close cause
    /// for abnormal terminations.
    async fn on_close(&self, _client: &ClientInfo, _error: Option<&str>) {}

    /// Broker shutdown completed.
    async fn on_stop(&self) {}
}

/// Default hooks: allow everything, observe nothing
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn on_accept(&self, addr: SocketAddr) -> bool {
        (**self).on_accept(addr).await
    }

    async fn on_connect(&self, client: &ClientInfo) -> ConnectReturnCode {
        (**self).on_connect(client).await
    }

    async fn on_connected(&self, client: &ClientInfo) {
        (**self).on_connected(client).await;
    }

    async fn on_session_created(&self, client: &ClientInfo) {
        (**self).on_session_created(client).await;
    }

    async fn on_session_resumed(&self, client: &ClientInfo) {
        (**self).on_session_resumed(client).await;
    }

    async fn on_subscribe(
        &self,
        client: &ClientInfo,
        filter: &str,
        requested: QoS,
    ) -> SubscribeReturnCode {
        (**self).on_subscribe(client, filter, requested).await
    }

    async fn on_msg_arrived(&self, client: &ClientInfo, publish: &Publish) -> bool {
        (**self).on_msg_arrived(client, publish).await
    }

    async fn on_session_terminated(&self, client: &ClientInfo, reason: SessionTerminatedReason) {
        (**self).on_session_terminated(client, reason).await;
    }

    async fn on_close(&self, client: &ClientInfo, error: Option<&str>) {
        (**self).on_close(client, error).await;
    }

    async fn on_stop(&self) {
        (**self).on_stop().await;
    }
}

/// Chains several hook implementations.
///
/// Permission hooks deny when any member denies: the first non-accepted
/// connect code wins, subscribe grants are capped by every member (a
/// `Failure` denies outright) and message arrival is the conjunction of
/// all members. Observational hooks run in registration order.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_accept(&self, addr: SocketAddr) -> bool {
        for hooks in &self.hooks {
            if !hooks.on_accept(addr).await {
                return false;
            }
        }
        true
    }

    async fn on_connect(&self, client: &ClientInfo) -> ConnectReturnCode {
        for hooks in &self.hooks {
            let code = hooks.on_connect(client).await;
            if !code.is_accepted() {
                return code;
            }
        }
        ConnectReturnCode::Accepted
    }

    async fn on_connected(&self, client: &ClientInfo) {
        for hooks in &self.hooks {
            hooks.on_connected(client).await;
        }
    }

    async fn on_session_created(&self, client: &ClientInfo) {
        for hooks in &self.hooks {
            hooks.on_session_created(client).await;
        }
    }

    async fn on_session_resumed(&self, client: &ClientInfo) {
        for hooks in &self.hooks {
            hooks.on_session_resumed(client).await;
        }
    }

    async fn on_subscribe(
        &self,
        client: &ClientInfo,
        filter: &str,
        requested: QoS,
    ) -> SubscribeReturnCode {
        let mut granted = requested;
        for hooks in &self.hooks {
            match hooks.on_subscribe(client, filter, granted).await {
                SubscribeReturnCode::Failure => return SubscribeReturnCode::Failure,
                SubscribeReturnCode::Granted(qos) => granted = granted.min(qos),
            }
        }
        SubscribeReturnCode::Granted(granted)
    }

    async fn on_msg_arrived(&self, client: &ClientInfo, publish: &Publish) -> bool {
        for hooks in &self.hooks {
            if !hooks.on_msg_arrived(client, publish).await {
                return false;
            }
        }
        true
    }

    async fn on_session_terminated(&self, client: &ClientInfo, reason: SessionTerminatedReason) {
        for hooks in &self.hooks {
            hooks.on_session_terminated(client, reason).await;
        }
    }

    async fn on_close(&self, client: &ClientInfo, error: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_close(client, error).await;
        }
    }

    async fn on_stop(&self) {
        for hooks in &self.hooks {
            hooks.on_stop().await;
        }
    }
}

/// Run a hook future, containing panics.
///
/// A panicking permission hook acts as a denial; a panicking
/// observational hook is a no-op. Callers supply the value to use when
/// the hook panics.
pub(crate) async fn contain_panic<F, T>(name: &'static str, on_panic: T, fut: F) -> T
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => value,
        Err(_) => {
            error!("hook {} panicked", name);
            on_panic
        }
    }
}
