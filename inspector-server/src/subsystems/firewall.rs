//! DHCP firewall - only nodes under introspection may reach the PXE DHCP server
//!
//! The iptables backend keeps a dedicated chain, jumped to from INPUT for DHCP
//! traffic on the provisioning interface. Each update rebuilds the chain from the
//! set of MACs belonging to active sessions: one ACCEPT per MAC, then DROP.

use anyhow::bail;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::process::Command;
use tokio::sync::Mutex;

use inspector_core::config::FirewallConfig;
use inspector_core::SessionStore;

#[async_trait]
pub trait Firewall: Send + Sync {
    /// Prepare the firewall at service start.
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Sync the whitelist with the MACs of active sessions.
    async fn update_filters(&self) -> anyhow::Result<()>;

    /// Remove everything `init` set up.
    async fn clean_up(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Used when `manage_firewall` is off.
pub struct DisabledFirewall;

#[async_trait]
impl Firewall for DisabledFirewall {
    async fn update_filters(&self) -> anyhow::Result<()> {
        tracing::debug!("Firewall management disabled, not updating filters");
        Ok(())
    }
}

pub struct IptablesFirewall {
    store: SessionStore,
    config: FirewallConfig,
    // iptables has no transactions, updates must not interleave
    lock: Mutex<()>,
}

impl IptablesFirewall {
    pub fn new(store: SessionStore, config: FirewallConfig) -> Self {
        Self {
            store,
            config,
            lock: Mutex::new(()),
        }
    }

    fn temp_chain(&self) -> String {
        format!("{}_temp", self.config.firewall_chain)
    }

    async fn iptables(&self, args: &[String], ignore_errors: bool) -> anyhow::Result<()> {
        let output = Command::new(&self.config.iptables_binary)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if ignore_errors {
                tracing::debug!(args = ?args, stderr = %stderr.trim(), "Ignoring iptables failure");
            } else {
                bail!(
                    "{} {} failed: {}",
                    self.config.iptables_binary,
                    args.join(" "),
                    stderr.trim()
                );
            }
        }
        Ok(())
    }

    async fn remove_chain(&self, chain: &str) {
        let jump = dhcp_jump(&self.config.dnsmasq_interface, chain);
        // the chain may not exist, nothing to report
        let _ = self.iptables(&with_action("-D", &jump), true).await;
        let _ = self.iptables(&args(&["-F", chain]), true).await;
        let _ = self.iptables(&args(&["-X", chain]), true).await;
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn init(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let chain = &self.config.firewall_chain;

        self.remove_chain(chain).await;
        self.remove_chain(&self.temp_chain()).await;

        self.iptables(&args(&["-N", chain]), false).await?;
        self.iptables(&args(&["-A", chain, "-j", "DROP"]), false).await?;
        self.iptables(
            &with_action("-I", &dhcp_jump(&self.config.dnsmasq_interface, chain)),
            false,
        )
        .await?;

        tracing::info!(chain = %chain, interface = %self.config.dnsmasq_interface, "Firewall chain initialized");
        Ok(())
    }

    async fn update_filters(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let chain = &self.config.firewall_chain;
        let temp = self.temp_chain();

        let macs = self.store.active_macs().await?;

        // leftovers from an interrupted update
        self.remove_chain(&temp).await;

        self.iptables(&args(&["-N", &temp]), false).await?;
        for rule in filter_rules(&temp, &macs) {
            self.iptables(&rule, false).await?;
        }

        // swap the jump over, then replace the old chain
        self.iptables(
            &with_action("-I", &dhcp_jump(&self.config.dnsmasq_interface, &temp)),
            false,
        )
        .await?;
        self.remove_chain(chain).await;
        self.iptables(&args(&["-E", &temp, chain]), false).await?;

        tracing::debug!(count = macs.len(), "Firewall filters updated");
        Ok(())
    }

    async fn clean_up(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.remove_chain(&self.config.firewall_chain).await;
        self.remove_chain(&self.temp_chain()).await;
        Ok(())
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// INPUT rule sending DHCP requests from `interface` to `chain`, without the action flag.
fn dhcp_jump(interface: &str, chain: &str) -> Vec<String> {
    args(&[
        "INPUT", "-i", interface, "-p", "udp", "--dport", "67", "-j", chain,
    ])
}

fn with_action(action: &str, rule: &[String]) -> Vec<String> {
    std::iter::once(action.to_string())
        .chain(rule.iter().cloned())
        .collect()
}

/// Whitelist rules for `chain`: accept each MAC, drop the rest.
pub fn filter_rules(chain: &str, macs: &BTreeSet<String>) -> Vec<Vec<String>> {
    macs.iter()
        .map(|mac| {
            args(&[
                "-A", chain, "-m", "mac", "--mac-source", mac, "-j", "ACCEPT",
            ])
        })
        .chain(std::iter::once(args(&["-A", chain, "-j", "DROP"])))
        .collect()
}
