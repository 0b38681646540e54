//! Typed `ip(8)` operations.
//!
//! Each link, address and route mutation the routed driver performs is a
//! [`LinkOp`] that knows its argument vector and runs through the shared
//! [`CommandRunner`] seam.

use cask_common::{CaskError, CaskResult, CommandRunner};

/// A single `ip(8)` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    /// `ip link add <name> txqueuelen <len> type veth peer name <peer>`
    AddVethPair {
        /// Host-side interface name.
        name: String,
        /// Peer interface name.
        peer: String,
        /// TX queue length for both ends.
        tx_queue_len: u32,
    },
    /// `ip link set <iface> mtu <mtu>`
    SetMtu {
        /// Interface name.
        iface: String,
        /// MTU in bytes.
        mtu: u32,
    },
    /// `ip link set <iface> up`
    SetUp {
        /// Interface name.
        iface: String,
    },
    /// `ip link set <iface> down`
    SetDown {
        /// Interface name.
        iface: String,
    },
    /// `ip link set <iface> name <to>`
    Rename {
        /// Current interface name.
        iface: String,
        /// New interface name.
        to: String,
    },
    /// `ip link set <iface> address <mac>`
    SetMac {
        /// Interface name.
        iface: String,
        /// MAC address.
        mac: String,
    },
    /// `ip addr add <cidr> dev <iface>`
    AddAddress {
        /// Interface name.
        iface: String,
        /// Address in CIDR form.
        cidr: String,
    },
    /// `ip route add <dest> dev <iface>` — no gateway.
    AddRoute {
        /// Route destination in CIDR form.
        dest: String,
        /// Outgoing interface.
        iface: String,
    },
    /// `ip route add default dev <iface>`
    AddDefaultRoute {
        /// Outgoing interface.
        iface: String,
    },
    /// `ip link set <iface> netns <pid>`
    SetNamespace {
        /// Interface name.
        iface: String,
        /// Target network namespace, identified by process ID.
        pid: u32,
    },
    /// `ip link del <iface>`
    Delete {
        /// Interface name.
        iface: String,
    },
}

impl LinkOp {
    /// The argument vector passed to `ip`.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        fn strings(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|s| (*s).to_string()).collect()
        }

        match self {
            Self::AddVethPair {
                name,
                peer,
                tx_queue_len,
            } => strings(&[
                "link",
                "add",
                name,
                "txqueuelen",
                &tx_queue_len.to_string(),
                "type",
                "veth",
                "peer",
                "name",
                peer,
            ]),
            Self::SetMtu { iface, mtu } => {
                strings(&["link", "set", iface, "mtu", &mtu.to_string()])
            }
            Self::SetUp { iface } => strings(&["link", "set", iface, "up"]),
            Self::SetDown { iface } => strings(&["link", "set", iface, "down"]),
            Self::Rename { iface, to } => strings(&["link", "set", iface, "name", to]),
            Self::SetMac { iface, mac } => strings(&["link", "set", iface, "address", mac]),
            Self::AddAddress { iface, cidr } => strings(&["addr", "add", cidr, "dev", iface]),
            Self::AddRoute { dest, iface } => strings(&["route", "add", dest, "dev", iface]),
            Self::AddDefaultRoute { iface } => {
                strings(&["route", "add", "default", "dev", iface])
            }
            Self::SetNamespace { iface, pid } => {
                strings(&["link", "set", iface, "netns", &pid.to_string()])
            }
            Self::Delete { iface } => strings(&["link", "del", iface]),
        }
    }

    /// Run the operation, failing unless `ip` exits zero.
    pub fn execute(&self, runner: &dyn CommandRunner) -> CaskResult<()> {
        let args = self.args();
        tracing::debug!(?args, "ip");
        let out = runner.run("ip", &args, None)?;
        if !out.success() {
            return Err(CaskError::Network {
                message: format!(
                    "ip {} failed: {} (exit code {})",
                    args.join(" "),
                    out.stderr_trimmed(),
                    out.code
                ),
            });
        }
        Ok(())
    }

    /// Run the operation, logging instead of failing on a non-zero exit.
    ///
    /// Used on teardown paths where the interface may already be gone.
    pub fn execute_best_effort(&self, runner: &dyn CommandRunner) {
        match self.execute(runner) {
            Ok(()) => {}
            Err(err) => tracing::warn!(error = %err, "Ignoring failed ip command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_common::{ScriptedRunner, ToolOutput};

    #[test]
    fn veth_pair_argv() {
        let op = LinkOp::AddVethPair {
            name: "vethA".to_string(),
            peer: "veth0abc123".to_string(),
            tx_queue_len: 1000,
        };
        assert_eq!(
            op.args(),
            vec![
                "link",
                "add",
                "vethA",
                "txqueuelen",
                "1000",
                "type",
                "veth",
                "peer",
                "name",
                "veth0abc123"
            ]
        );
    }

    #[test]
    fn route_argv_has_no_gateway() {
        let op = LinkOp::AddRoute {
            dest: "10.0.0.5/24".to_string(),
            iface: "vethA".to_string(),
        };
        assert_eq!(op.args(), vec!["route", "add", "10.0.0.5/24", "dev", "vethA"]);
    }

    #[test]
    fn execute_surfaces_stderr() {
        let runner = ScriptedRunner::new();
        runner.push(ToolOutput::fail(2, "Cannot find device \"veth9\"\n"));
        let err = LinkOp::Delete {
            iface: "veth9".to_string(),
        }
        .execute(&runner)
        .unwrap_err();
        assert!(err.to_string().contains("Cannot find device"));
    }

    #[test]
    fn best_effort_swallows_failures() {
        let runner = ScriptedRunner::new();
        runner.push(ToolOutput::fail(1, "gone"));
        LinkOp::Delete {
            iface: "veth9".to_string(),
        }
        .execute_best_effort(&runner);
    }
}
