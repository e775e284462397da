//! SUBSCRIBE and UNSUBSCRIBE handling
//!
//! Grants are capped by the subscribe hook and the broker's maximum
//! QoS; retained matches are delivered right after the SUBACK.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::hooks::{contain_panic, ClientInfo};
use crate::protocol::{
    Packet, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::session::Session;
use crate::topic::{validate_topic_filter, Subscription};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_subscribe(
        &mut self,
        client: &ClientInfo,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        // (filter, granted) pairs that need retained delivery after SUBACK
        let mut granted_filters: Vec<(String, QoS)> = Vec::new();

        for topic in &subscribe.topics {
            if let Err(e) = validate_topic_filter(&topic.filter) {
                debug!(
                    "SUBSCRIBE from {} rejected filter {:?}: {}",
                    client.client_id, topic.filter, e
                );
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let decision = contain_panic(
                "on_subscribe",
                SubscribeReturnCode::Failure,
                self.hooks.on_subscribe(client, &topic.filter, topic.qos),
            )
            .await;

            let cap = match decision {
                SubscribeReturnCode::Failure => {
                    debug!(
                        "SUBSCRIBE from {} denied on filter {:?}",
                        client.client_id, topic.filter
                    );
                    return_codes.push(SubscribeReturnCode::Failure);
                    continue;
                }
                SubscribeReturnCode::Granted(qos) => qos,
            };

            let granted = topic.qos.min(cap).min(self.router.config.max_qos);

            let previous = self.router.subscriptions.subscribe(
                &topic.filter,
                Subscription {
                    client_id: client.client_id.clone(),
                    qos: granted,
                },
            );
            {
                let mut s = session.write();
                s.add_subscription(topic.filter.clone(), granted);
            }

            if previous.is_some() {
                debug!(
                    "SUBSCRIBE {} replaced grant on {:?} (now {:?})",
                    client.client_id, topic.filter, granted
                );
            } else {
                debug!(
                    "SUBSCRIBE {} to {:?} (QoS {:?})",
                    client.client_id, topic.filter, granted
                );
            }

            granted_filters.push((topic.filter.clone(), granted));
            return_codes.push(SubscribeReturnCode::Granted(granted));
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        for (filter, granted) in granted_filters {
            self.send_retained_matches(session, &filter, granted).await?;
        }

        Ok(())
    }

    /// Deliver retained messages matching a fresh subscription, at the
    /// minimum of the stored QoS and the granted QoS, with RETAIN=1
    async fn send_retained_matches(
        &mut self,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        granted: QoS,
    ) -> Result<(), ConnectionError> {
        for retained in self.router.retained.matches(filter) {
            let publish = Publish {
                dup: false,
                qos: retained.qos.min(granted),
                retain: true,
                topic: retained.topic.clone(),
                packet_id: None,
                payload: retained.payload.clone(),
            };
            self.emit_publish(session, publish).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client: &ClientInfo,
        session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            let removed = self
                .router
                .subscriptions
                .unsubscribe(filter, &client.client_id);
            {
                let mut s = session.write();
                s.remove_subscription(filter);
            }
            debug!(
                "UNSUBSCRIBE {} from {:?} (existed: {})",
                client.client_id, filter, removed
            );
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }
}
