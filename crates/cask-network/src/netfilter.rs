//! Per-interface ingress filtering.
//!
//! Each routed endpoint gets its own `CONTAINER-<iface>` chain holding one
//! ACCEPT rule per allowed source CIDR and a trailing RETURN; a jump from
//! the shared `CONTAINERS` chain sends the interface's traffic through it.
//! Removal is the exact inverse of installation.

use std::sync::Arc;

use cask_common::{CaskError, CaskResult, CommandRunner};

/// Shared parent chain all per-interface jumps are inserted into.
const CONTAINERS_CHAIN: &str = "CONTAINERS";

/// Prefix of the per-interface chains.
const CONTAINER_CHAIN_PREFIX: &str = "CONTAINER-";

/// Ingress filter for one routed interface.
pub struct NetFilter {
    runner: Arc<dyn CommandRunner>,
    iface_name: String,
    /// Allowed source CIDRs; `None` means no filtering was requested.
    ingress_allowed: Option<Vec<String>>,
}

impl NetFilter {
    /// Create a filter for the given host interface.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        iface_name: impl Into<String>,
        ingress_allowed: Option<Vec<String>>,
    ) -> Self {
        Self {
            runner,
            iface_name: iface_name.into(),
            ingress_allowed,
        }
    }

    fn chain_name(&self) -> String {
        format!("{}{}", CONTAINER_CHAIN_PREFIX, self.iface_name)
    }

    /// Install the ingress chain, applied on the host after veth creation.
    pub fn apply(&self) -> CaskResult<()> {
        let Some(allowed) = &self.ingress_allowed else {
            // No holes to poke.
            tracing::info!(iface = %self.iface_name, "No network ingress filtering specified");
            return Ok(());
        };

        let chain = self.chain_name();
        tracing::debug!(iface = %self.iface_name, ?allowed, "Applying ingress filtering");

        self.iptables(&["-N", &chain])?;

        for cidr in allowed {
            self.iptables(&["-A", &chain, "-s", cidr, "-j", "ACCEPT"])?;
        }
        // Implicit deny is handled by the parent chain.
        self.iptables(&["-A", &chain, "-j", "RETURN"])?;

        self.iptables(&[
            "-I",
            CONTAINERS_CHAIN,
            "1",
            "-o",
            &self.iface_name,
            "-j",
            &chain,
        ])?;

        tracing::info!(iface = %self.iface_name, "Ingress filtering applied");
        Ok(())
    }

    /// Remove the ingress chain: delete the jump, flush, delete the chain.
    pub fn remove(&self) -> CaskResult<()> {
        if self.ingress_allowed.is_none() {
            return Ok(());
        }

        let chain = self.chain_name();
        tracing::debug!(iface = %self.iface_name, "Removing ingress filtering");

        self.iptables(&["-D", CONTAINERS_CHAIN, "-o", &self.iface_name, "-j", &chain])?;
        self.iptables(&["-F", &chain])?;
        self.iptables(&["-X", &chain])?;
        Ok(())
    }

    /// Run one iptables invocation.
    ///
    /// `--wait` takes the tool's advisory lock, serializing concurrent rule
    /// mutation across the daemon's threads.
    fn iptables(&self, args: &[&str]) -> CaskResult<()> {
        let mut full: Vec<String> = vec!["--wait".to_string()];
        full.extend(args.iter().map(|s| (*s).to_string()));

        let out = self.runner.run("iptables", &full, None)?;
        if !out.success() {
            return Err(CaskError::Network {
                message: format!(
                    "iptables {} failed: {} (exit code {})",
                    args.join(" "),
                    out.stderr_trimmed(),
                    out.code
                ),
            });
        }
        Ok(())
    }
}
