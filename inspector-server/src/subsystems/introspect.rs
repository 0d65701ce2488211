//! Introspection subsystem - starts hardware introspection for a node
//!
//! The synchronous part checks the node against the control plane and creates a
//! session. Everything after that runs in a background task:
//! - registers the node's MACs as lookup attributes and whitelists them on the firewall
//! - sets the boot device to PXE and reboots the node (unless new IPMI credentials
//!   were requested, in which case the node must be powered on manually)
//!
//! Any failure in the background task is recorded as the session's error. The task
//! never leaves a session silently stuck; a task that outlives the introspection
//! timeout is overruled by the sweep.

use anyhow::anyhow;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use inspector_core::config::IntrospectionConfig;
use inspector_core::models::{
    Attributes, BootDevice, IpmiCredentials, Node, PowerState, BMC_ADDRESS_ATTRIBUTE,
    MACS_ATTRIBUTE,
};
use inspector_core::{
    retry_on_conflict, ControlPlane, InspectorError, IronicError, RetryPolicy, SessionHandle,
    SessionStore,
};

use super::firewall::Firewall;

/// Provision states in which a node may be introspected.
pub const VALID_STATES: &[&str] = &["enroll", "manageable", "inspecting"];

/// IPMI v2.0 limit
pub const PASSWORD_MAX_LENGTH: usize = 20;

/// Session option carrying requested IPMI credentials to the processing phase.
pub const NEW_IPMI_CREDENTIALS_OPTION: &str = "new_ipmi_credentials";

const UNEXPECTED_FAILURE: &str = "Unexpected exception in background introspection thread";

#[derive(Clone)]
pub struct Introspector {
    store: SessionStore,
    client: Arc<dyn ControlPlane>,
    firewall: Arc<dyn Firewall>,
    retry: RetryPolicy,
    config: IntrospectionConfig,
}

impl Introspector {
    pub fn new(
        store: SessionStore,
        client: Arc<dyn ControlPlane>,
        firewall: Arc<dyn Firewall>,
        retry: RetryPolicy,
    ) -> Self {
        let config = store.config().clone();
        Self {
            store,
            client,
            firewall,
            retry,
            config,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Initiate introspection for node `id`.
    ///
    /// Errors before the session exists are returned directly. Once the session is
    /// created, failures are recorded in it and the returned task only resolves when
    /// the background work is done.
    pub async fn introspect(
        &self,
        id: &str,
        new_credentials: Option<IpmiCredentials>,
    ) -> Result<JoinHandle<()>, InspectorError> {
        let node = match self.client.get_node(id).await {
            Ok(node) => node,
            Err(IronicError::NotFound(_)) => {
                return Err(InspectorError::NotFound(format!("Cannot find node {}", id)));
            }
            Err(e) => return Err(InspectorError::Remote(e)),
        };

        check_provision_state(&node)?;

        let new_credentials = match new_credentials {
            Some(credentials) => Some(validate_ipmi_credentials(
                &node,
                credentials,
                self.config.enable_setting_ipmi_credentials,
            )?),
            None => {
                let validation =
                    retry_on_conflict(&self.retry, || self.client.validate(&node.uuid)).await?;
                if !validation.power.passed() {
                    return Err(InspectorError::Validation(format!(
                        "Failed validation of power interface for node {}, reason: {}",
                        node.uuid,
                        validation.power.reason.as_deref().unwrap_or("unknown")
                    )));
                }
                None
            }
        };

        let mut attributes = Attributes::new();
        if let Some(address) = get_ipmi_address(&node).await? {
            attributes.insert(BMC_ADDRESS_ATTRIBUTE.to_string(), vec![address]);
        }

        let node_id = node.uuid.clone();
        let mut handle = self.store.create(&node_id, &attributes).await?.with_node(node);

        if let Some(credentials) = new_credentials {
            let stored = match serde_json::to_value(&credentials) {
                Ok(value) => handle
                    .set_option(NEW_IPMI_CREDENTIALS_OPTION, value)
                    .await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = stored {
                tracing::error!(node = %node_id, error = %e, "Failed to store new IPMI credentials");
                handle.finish(Some(&e.to_string())).await?;
                return Err(e);
            }
        }

        Ok(self.spawn_background(handle))
    }

    /// Run the background part in its own task and record its outcome, including panics.
    fn spawn_background(&self, handle: SessionHandle) -> JoinHandle<()> {
        let id = handle.id().to_string();
        let generation = handle.generation();
        let store = self.store.clone();
        let this = self.clone();

        let work = tokio::spawn(async move { this.background_introspect(handle).await });

        tokio::spawn(async move {
            let error = match work.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    tracing::error!(node = %id, error = %e, "Introspection failed");
                    e.to_string()
                }
                Err(e) => {
                    tracing::error!(node = %id, error = %e, "{}", UNEXPECTED_FAILURE);
                    UNEXPECTED_FAILURE.to_string()
                }
            };

            if let Err(e) = store.finish_lifetime(&id, generation, Some(&error)).await {
                tracing::error!(node = %id, error = %e, "Failed to record introspection failure");
            }
        })
    }

    async fn background_introspect(&self, mut handle: SessionHandle) -> anyhow::Result<()> {
        let id = handle.id().to_string();
        let client = self.client.as_ref();

        let macs: Vec<String> = handle.ports(client).await?.keys().cloned().collect();
        if !macs.is_empty() {
            handle.add_attribute(MACS_ATTRIBUTE, &macs).await?;
            tracing::info!(node = %id, macs = ?macs, "Whitelisting MAC's for node on the firewall");
            self.firewall.update_filters().await?;
        }

        let manual_power_on = handle
            .options()
            .await?
            .get(NEW_IPMI_CREDENTIALS_OPTION)
            .is_some_and(|v| !v.is_null());

        if manual_power_on {
            tracing::info!(
                node = %id,
                timeout_secs = self.config.timeout_secs,
                "Introspection environment is ready, manual power on is required within the timeout"
            );
            return Ok(());
        }

        if let Err(e) = retry_on_conflict(&self.retry, || {
            client.set_boot_device(&id, BootDevice::Pxe, false)
        })
        .await
        {
            tracing::warn!(node = %id, error = %e, "Failed to set boot device to PXE for node");
        }

        retry_on_conflict(&self.retry, || client.set_power_state(&id, PowerState::Reboot))
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to power on node {}, check its power management configuration: {}",
                    id,
                    e
                )
            })?;

        tracing::info!(node = %id, "Introspection started successfully");
        Ok(())
    }
}

pub fn check_provision_state(node: &Node) -> Result<(), InspectorError> {
    let state = node.provision_state.as_deref().map(str::to_lowercase);
    match state.as_deref() {
        Some(s) if VALID_STATES.contains(&s) => Ok(()),
        other => Err(InspectorError::InvalidState(format!(
            "Refusing to introspect node {} with provision state \"{}\"",
            node.uuid,
            other.unwrap_or("none")
        ))),
    }
}

/// Check requested IPMI credentials, filling in the user name from the node if empty.
pub fn validate_ipmi_credentials(
    node: &Node,
    credentials: IpmiCredentials,
    setting_enabled: bool,
) -> Result<IpmiCredentials, InspectorError> {
    if !setting_enabled {
        return Err(InspectorError::Validation(
            "IPMI credentials setup is disabled in configuration".to_string(),
        ));
    }

    // otherwise Ironic is going to interfere
    if !node.maintenance {
        return Err(InspectorError::Validation(
            "Node should be in maintenance mode to set IPMI credentials on it".to_string(),
        ));
    }

    let username = if credentials.username.trim().is_empty() {
        node.driver_info_str("ipmi_username").map(str::to_string)
    } else {
        Some(credentials.username)
    };
    let username = username.ok_or_else(|| {
        InspectorError::Validation(format!(
            "Setting IPMI credentials requested for node {}, but neither new user name nor driver_info[ipmi_username] are provided",
            node.uuid
        ))
    })?;

    let password = credentials.password;
    let wrong_chars: BTreeSet<char> = password
        .chars()
        .filter(|c| !c.is_ascii_alphanumeric())
        .collect();
    if !wrong_chars.is_empty() {
        return Err(InspectorError::Validation(format!(
            "Forbidden characters encountered in new IPMI password for node {}: \"{}\"; use only letters and numbers",
            node.uuid,
            wrong_chars.into_iter().collect::<String>()
        )));
    }

    let length = password.chars().count();
    if length == 0 || length > PASSWORD_MAX_LENGTH {
        return Err(InspectorError::Validation(format!(
            "IPMI password length should be > 0 and <= {}",
            PASSWORD_MAX_LENGTH
        )));
    }

    Ok(IpmiCredentials { username, password })
}

/// The node's BMC address as an IP, resolving host names.
pub async fn get_ipmi_address(node: &Node) -> Result<Option<String>, InspectorError> {
    let address = match node.driver_info_str("ipmi_address") {
        Some(a) => a,
        None => return Ok(None),
    };

    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(Some(ip.to_string()));
    }

    let resolved = tokio::net::lookup_host((address, 0))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next());

    match resolved {
        Some(addr) => Ok(Some(addr.ip().to_string())),
        None => Err(InspectorError::Validation(format!(
            "Failed to resolve the hostname ({}) for node {}",
            address, node.uuid
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
