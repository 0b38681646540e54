//! The routed network driver.
//!
//! Creates a veth pair, injects a host route for the container's address
//! towards the host end, and moves the peer into the container's network
//! namespace. The container side later renames and configures the peer and
//! installs its default route. No NAT is involved; traffic is plain routing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cask_common::id::random_hex;
use cask_common::{CaskError, CaskResult, CommandRunner};

use crate::link::LinkOp;

/// A container's routed network endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    /// Host-side veth interface name.
    pub host_iface_name: String,
    /// Interface name inside the container.
    pub container_iface_name: String,
    /// MTU applied to both ends.
    pub mtu: u32,
    /// Container address in CIDR form (e.g. `10.0.0.5/24`).
    pub address_cidr: String,
    /// Optional fixed MAC address for the container end.
    pub mac_address: Option<String>,
    /// TX queue length for the veth pair.
    pub tx_queue_len: u32,
    /// Temporary peer name, assigned during creation.
    pub temp_peer_name: String,
    /// Source CIDRs allowed to reach the container; `None` disables
    /// ingress filtering entirely.
    pub ingress_allowed: Option<Vec<String>>,
}

impl NetworkEndpoint {
    /// Create an endpoint description with the common defaults.
    #[must_use]
    pub fn new(
        host_iface_name: impl Into<String>,
        container_iface_name: impl Into<String>,
        address_cidr: impl Into<String>,
    ) -> Self {
        Self {
            host_iface_name: host_iface_name.into(),
            container_iface_name: container_iface_name.into(),
            mtu: 1500,
            address_cidr: address_cidr.into(),
            mac_address: None,
            tx_queue_len: 0,
            temp_peer_name: String::new(),
            ingress_allowed: None,
        }
    }
}

/// Generate a unique temporary peer name (`veth` + 7 hex chars).
#[must_use]
pub fn temp_peer_name() -> String {
    format!("veth{}", random_hex(7))
}

/// Host- and container-side operations for routed endpoints.
pub struct RoutedDriver {
    runner: Arc<dyn CommandRunner>,
}

impl RoutedDriver {
    /// Create the driver.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Host-side creation, run before the container's init is unblocked.
    ///
    /// Creates the veth pair, configures and brings up the host end,
    /// installs the host route for the container address, and moves the
    /// temporary peer into the namespace of `container_pid`. On any failure
    /// after the pair exists, both ends are removed before returning.
    pub fn create(&self, endpoint: &mut NetworkEndpoint, container_pid: u32) -> CaskResult<()> {
        endpoint.temp_peer_name = temp_peer_name();
        tracing::debug!(
            host = %endpoint.host_iface_name,
            peer = %endpoint.temp_peer_name,
            pid = container_pid,
            "Creating routed endpoint"
        );

        LinkOp::AddVethPair {
            name: endpoint.host_iface_name.clone(),
            peer: endpoint.temp_peer_name.clone(),
            tx_queue_len: endpoint.tx_queue_len,
        }
        .execute(self.runner.as_ref())?;

        if let Err(err) = self.configure_host_side(endpoint, container_pid) {
            // The pair exists; never leave it half-configured behind.
            LinkOp::Delete {
                iface: endpoint.host_iface_name.clone(),
            }
            .execute_best_effort(self.runner.as_ref());
            LinkOp::Delete {
                iface: endpoint.temp_peer_name.clone(),
            }
            .execute_best_effort(self.runner.as_ref());
            return Err(err);
        }

        tracing::info!(
            host = %endpoint.host_iface_name,
            address = %endpoint.address_cidr,
            "Routed endpoint created"
        );
        Ok(())
    }

    fn configure_host_side(
        &self,
        endpoint: &NetworkEndpoint,
        container_pid: u32,
    ) -> CaskResult<()> {
        let runner = self.runner.as_ref();

        LinkOp::SetMtu {
            iface: endpoint.host_iface_name.clone(),
            mtu: endpoint.mtu,
        }
        .execute(runner)?;

        LinkOp::SetUp {
            iface: endpoint.host_iface_name.clone(),
        }
        .execute(runner)?;

        LinkOp::AddRoute {
            dest: endpoint.address_cidr.clone(),
            iface: endpoint.host_iface_name.clone(),
        }
        .execute(runner)?;

        LinkOp::SetNamespace {
            iface: endpoint.temp_peer_name.clone(),
            pid: container_pid,
        }
        .execute(runner)
    }

    /// Container-side initialization, run inside the network namespace.
    ///
    /// Renames the temporary peer to its configured name, applies MAC,
    /// address and MTU, brings it up and installs the default route.
    pub fn initialize(&self, endpoint: &NetworkEndpoint) -> CaskResult<()> {
        if endpoint.temp_peer_name.is_empty() {
            return Err(CaskError::Network {
                message: "veth peer is not specified".to_string(),
            });
        }
        let runner = self.runner.as_ref();
        let name = endpoint.container_iface_name.clone();

        LinkOp::SetDown {
            iface: endpoint.temp_peer_name.clone(),
        }
        .execute(runner)?;

        LinkOp::Rename {
            iface: endpoint.temp_peer_name.clone(),
            to: name.clone(),
        }
        .execute(runner)?;

        if let Some(mac) = &endpoint.mac_address {
            LinkOp::SetMac {
                iface: name.clone(),
                mac: mac.clone(),
            }
            .execute(runner)?;
        }

        LinkOp::AddAddress {
            iface: name.clone(),
            cidr: endpoint.address_cidr.clone(),
        }
        .execute(runner)?;

        LinkOp::SetMtu {
            iface: name.clone(),
            mtu: endpoint.mtu,
        }
        .execute(runner)?;

        LinkOp::SetUp {
            iface: name.clone(),
        }
        .execute(runner)?;

        LinkOp::AddDefaultRoute { iface: name }.execute(runner)
    }

    /// Tear down the host side of an endpoint.
    ///
    /// Deleting the host end removes the peer and the host route with it;
    /// a vanished interface is tolerated.
    pub fn delete(&self, endpoint: &NetworkEndpoint) {
        LinkOp::Delete {
            iface: endpoint.host_iface_name.clone(),
        }
        .execute_best_effort(self.runner.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_common::{ScriptedRunner, ToolOutput};

    fn endpoint() -> NetworkEndpoint {
        let mut endpoint = NetworkEndpoint::new("vethA", "eth0", "10.0.0.5/24");
        endpoint.mtu = 1500;
        endpoint.tx_queue_len = 1000;
        endpoint
    }

    #[test]
    fn temp_peer_name_format() {
        let name = temp_peer_name();
        assert_eq!(name.len(), 11);
        assert!(name.starts_with("veth"));
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(temp_peer_name(), temp_peer_name());
    }

    #[test]
    fn create_runs_host_side_sequence() {
        let runner = Arc::new(ScriptedRunner::new());
        let driver = RoutedDriver::new(runner.clone());
        let mut endpoint = endpoint();

        driver.create(&mut endpoint, 4242).unwrap();
        let peer = endpoint.temp_peer_name.clone();
        assert!(peer.starts_with("veth"));

        let lines = runner.command_lines();
        assert_eq!(
            lines,
            vec![
                format!("ip link add vethA txqueuelen 1000 type veth peer name {peer}"),
                "ip link set vethA mtu 1500".to_string(),
                "ip link set vethA up".to_string(),
                "ip route add 10.0.0.5/24 dev vethA".to_string(),
                format!("ip link set {peer} netns 4242"),
            ]
        );
    }

    #[test]
    fn mtu_failure_deletes_both_ends() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ToolOutput::ok("")); // veth add
        runner.push(ToolOutput::fail(2, "mtu rejected")); // set mtu

        let driver = RoutedDriver::new(runner.clone());
        let mut endpoint = endpoint();
        let err = driver.create(&mut endpoint, 4242).unwrap_err();
        assert!(err.to_string().contains("mtu rejected"));

        let peer = endpoint.temp_peer_name.clone();
        let lines = runner.command_lines();
        assert_eq!(lines[2], "ip link del vethA");
        assert_eq!(lines[3], format!("ip link del {peer}"));
    }

    #[test]
    fn veth_creation_failure_does_not_delete() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ToolOutput::fail(2, "File exists"));

        let driver = RoutedDriver::new(runner.clone());
        let mut endpoint = endpoint();
        assert!(driver.create(&mut endpoint, 4242).is_err());
        assert_eq!(runner.command_lines().len(), 1);
    }

    #[test]
    fn initialize_configures_container_side() {
        let runner = Arc::new(ScriptedRunner::new());
        let driver = RoutedDriver::new(runner.clone());

        let mut endpoint = endpoint();
        endpoint.temp_peer_name = "veth0abc123".to_string();
        endpoint.mac_address = Some("aa:bb:cc:dd:ee:ff".to_string());

        driver.initialize(&endpoint).unwrap();
        let lines = runner.command_lines();
        assert_eq!(
            lines,
            vec![
                "ip link set veth0abc123 down",
                "ip link set veth0abc123 name eth0",
                "ip link set eth0 address aa:bb:cc:dd:ee:ff",
                "ip addr add 10.0.0.5/24 dev eth0",
                "ip link set eth0 mtu 1500",
                "ip link set eth0 up",
                "ip route add default dev eth0",
            ]
        );
    }

    #[test]
    fn initialize_without_peer_fails() {
        let runner = Arc::new(ScriptedRunner::new());
        let driver = RoutedDriver::new(runner);
        let endpoint = endpoint();
        assert!(driver.initialize(&endpoint).is_err());
    }
}
