//! Listener registration and supported protocols for [`Connector`].

use std::sync::Arc;

use log::{debug, info};

use super::{Connector, LOG_TARGET};
use crate::context::FlowConstruct;
use crate::endpoint::{Endpoint, WildcardMatcher};
use crate::error::{ConnectorError, ConnectorResult, LockResultExt};
use crate::receiver::MessageReceiver;

/// Lower-case `protocol` and prefix it with the connector's own protocol
/// unless it already starts with it.
pub(super) fn qualify_protocol(connector_protocol: &str, protocol: &str) -> String {
    let connector_protocol = connector_protocol.to_ascii_lowercase();
    let protocol = protocol.to_ascii_lowercase();
    if protocol.starts_with(&connector_protocol) {
        protocol
    } else {
        format!("{connector_protocol}:{protocol}")
    }
}

impl Connector {
    /// Create, initialise and register a receiver for `endpoint` on behalf
    /// of `flow`.
    ///
    /// A receiver registered on a connected (started) connector is
    /// connected (started) immediately.
    pub async fn register_listener(
        &self,
        flow: Arc<dyn FlowConstruct>,
        endpoint: Endpoint,
    ) -> ConnectorResult<Arc<MessageReceiver>> {
        if self.is_disposed() {
            return Err(ConnectorError::lifecycle(
                self.name(),
                "cannot register a listener on a disposed connector",
            ));
        }

        let _connection = self.inner.connection_lock.lock().await;

        let key = self.inner.hooks.receiver_key(flow.as_ref(), &endpoint);
        if self.inner.receivers.contains_key(&key) {
            return Err(ConnectorError::invalid_argument(format!(
                "listener already registered for '{}' on connector {}",
                key,
                self.name()
            )));
        }

        let hooks = self.inner.hooks.create_receiver(&flow, &endpoint)?;
        let receiver = MessageReceiver::new(self, key.clone(), flow, endpoint, hooks);
        receiver.initialise().await?;
        self.inner.receivers.insert(key, Arc::clone(&receiver));
        debug!(target: LOG_TARGET, "Registered receiver {}", receiver.resource_id());

        if self.is_connected() {
            receiver.connect().await?;
        }
        if self.is_started() {
            receiver.start().await?;
        }
        Ok(receiver)
    }

    /// Destroy the receiver registered for `endpoint`, if any.
    pub async fn unregister_listener(
        &self,
        flow: &Arc<dyn FlowConstruct>,
        endpoint: &Endpoint,
    ) -> ConnectorResult<()> {
        let _connection = self.inner.connection_lock.lock().await;

        let key = self.inner.hooks.receiver_key(flow.as_ref(), endpoint);
        let Some((_, receiver)) = self.inner.receivers.remove(&key) else {
            debug!(
                target: LOG_TARGET,
                "No receiver registered for '{}' on {}",
                key,
                self.name()
            );
            return Ok(());
        };

        self.destroy_receiver(&receiver).await;
        self.inner
            .hooks
            .do_unregister_listener(flow, endpoint)
            .await
            .map_err(|e| {
                ConnectorError::lifecycle_with_source(self.name(), "unregister listener failed", e)
            })?;
        info!(target: LOG_TARGET, "Unregistered receiver {}", receiver.resource_id());
        Ok(())
    }

    pub fn lookup_receiver(&self, key: &str) -> Option<Arc<MessageReceiver>> {
        self.inner
            .receivers
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the registered receivers, ordered by key.
    pub fn receivers(&self) -> Vec<Arc<MessageReceiver>> {
        let mut receivers: Vec<_> = self
            .inner
            .receivers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        receivers.sort_by(|a, b| a.key().cmp(b.key()));
        receivers
    }

    /// Receivers whose key matches a case-insensitive `*` wildcard.
    pub fn receivers_matching(&self, pattern: &str) -> ConnectorResult<Vec<Arc<MessageReceiver>>> {
        let matcher = WildcardMatcher::new(pattern)?;
        Ok(self
            .receivers()
            .into_iter()
            .filter(|receiver| matcher.matches(receiver.key()))
            .collect())
    }

    /// Accept `protocol` as a variant of this connector's protocol, e.g.
    /// `"async"` on a `memory` connector registers `"memory:async"`.
    pub fn register_supported_protocol(&self, protocol: &str) {
        let qualified = qualify_protocol(self.protocol(), protocol);
        self.protocols_mut("register_supported_protocol").insert(qualified);
    }

    /// Accept `protocol` as a meta protocol layered over this connector's
    /// protocol, registering both `"<protocol>:<connector protocol>"` and
    /// `protocol` itself.
    pub fn register_supported_meta_protocol(&self, protocol: &str) {
        let protocol = protocol.to_ascii_lowercase();
        let layered = format!("{}:{}", protocol, self.protocol().to_ascii_lowercase());
        let mut protocols = self.protocols_mut("register_supported_meta_protocol");
        protocols.insert(layered);
        protocols.insert(protocol);
    }

    pub fn unregister_supported_protocol(&self, protocol: &str) {
        let qualified = qualify_protocol(self.protocol(), protocol);
        self.protocols_mut("unregister_supported_protocol").remove(&qualified);
    }

    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.inner
            .supported_protocols
            .read()
            .recover_poison("Connector::supports_protocol()")
            .contains(&protocol.to_ascii_lowercase())
    }

    pub fn supported_protocols(&self) -> Vec<String> {
        self.inner
            .supported_protocols
            .read()
            .recover_poison("Connector::supported_protocols()")
            .iter()
            .cloned()
            .collect()
    }

    fn protocols_mut(
        &self,
        context: &str,
    ) -> std::sync::RwLockWriteGuard<'_, std::collections::BTreeSet<String>> {
        self.inner
            .supported_protocols
            .write()
            .recover_poison(&format!("Connector::{context}()"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_protocol_prefixes_foreign_protocols() {
        assert_eq!(qualify_protocol("memory", "ASYNC"), "memory:async");
        assert_eq!(qualify_protocol("memory", "memory:sync"), "memory:sync");
        assert_eq!(qualify_protocol("Memory", "memory"), "memory");
    }
}
