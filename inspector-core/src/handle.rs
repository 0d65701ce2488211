use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::InspectorError;
use crate::ironic::{ControlPlane, IronicError};
use crate::models::{Node, Options, Port, Session};
use crate::store::SessionStore;

/// One session in the store, plus lazily fetched data about its node.
///
/// Cached options, node and ports are private to this handle; call
/// `invalidate_cache` when they may have changed behind its back.
#[derive(Debug)]
pub struct SessionHandle {
    store: SessionStore,
    session: Session,
    options: Option<Options>,
    node: Option<Node>,
    ports: Option<BTreeMap<String, Port>>,
}

impl SessionHandle {
    pub(crate) fn new(store: SessionStore, session: Session) -> Self {
        Self {
            store,
            session,
            options: None,
            node: None,
            ports: None,
        }
    }

    /// Seed the node cache with a record the caller already fetched.
    pub fn with_node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.session.started_at
    }

    /// Identifies this lifetime of the session; writes through the handle are
    /// rejected once the node is re-introspected.
    pub fn generation(&self) -> i64 {
        self.session.generation
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn options(&mut self) -> Result<&Options, InspectorError> {
        let options = match self.options.take() {
            Some(options) => options,
            None => self.store.load_options(&self.session.id).await?,
        };
        Ok(&*self.options.insert(options))
    }

    pub async fn set_option(
        &mut self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), InspectorError> {
        self.store
            .set_lifetime_option(&self.session.id, self.session.generation, name, &value)
            .await?;
        if let Some(options) = self.options.as_mut() {
            options.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Finish this session lifetime. Returns `false` if it was already finished
    /// (e.g. timed out) or replaced by a newer session for the same node.
    pub async fn finish(&mut self, error: Option<&str>) -> Result<bool, InspectorError> {
        let recorded = self
            .store
            .finish_lifetime(&self.session.id, self.session.generation, error)
            .await?;

        match recorded {
            Some(finished_at) => {
                self.session.finished_at = Some(finished_at);
                self.session.error = error.map(str::to_string);
                self.options = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn add_attribute(&self, name: &str, values: &[String]) -> Result<(), InspectorError> {
        self.store
            .attach_lifetime_attribute(&self.session.id, self.session.generation, name, values)
            .await
    }

    pub async fn node(&mut self, client: &dyn ControlPlane) -> Result<&Node, IronicError> {
        let node = match self.node.take() {
            Some(node) => node,
            None => client.get_node(&self.session.id).await?,
        };
        Ok(&*self.node.insert(node))
    }

    /// Ports of the node keyed by MAC address.
    pub async fn ports(
        &mut self,
        client: &dyn ControlPlane,
    ) -> Result<&BTreeMap<String, Port>, IronicError> {
        let ports = match self.ports.take() {
            Some(ports) => ports,
            None => client
                .list_ports(&self.session.id)
                .await?
                .into_iter()
                .map(|p| (p.address.clone(), p))
                .collect(),
        };
        Ok(&*self.ports.insert(ports))
    }

    /// Create ports for MACs the node does not have yet.
    pub async fn create_ports(
        &mut self,
        macs: &[String],
        client: &dyn ControlPlane,
    ) -> Result<(), IronicError> {
        for mac in macs {
            if self.ports(client).await?.contains_key(mac) {
                tracing::warn!(mac = %mac, node = %self.session.id, "Port already exists for node, skipping");
                continue;
            }

            match client.create_port(&self.session.id, mac).await {
                Ok(port) => {
                    if let Some(ports) = self.ports.as_mut() {
                        ports.insert(mac.clone(), port);
                    }
                }
                Err(IronicError::Conflict(_)) => {
                    tracing::warn!(mac = %mac, node = %self.session.id, "Port already exists for node, skipping");
                    // no port object came back, reload on next access
                    self.ports = None;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn invalidate_cache(&mut self) {
        self.options = None;
        self.node = None;
        self.ports = None;
    }
}
