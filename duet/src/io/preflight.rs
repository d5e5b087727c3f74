//! Startup checks: agent binaries on `PATH` and provider host resolution.

use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{error, info, warn};

use crate::io::agents::AgentRegistry;

#[derive(Debug, Clone, Copy, Default)]
pub struct PreflightOptions {
    /// Treat unresolvable hosts as fatal instead of a warning.
    pub strict: bool,
}

/// Problems found by [`check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    /// `(agent, binary)` pairs whose binary was not found.
    pub missing_binaries: Vec<(String, String)>,
    /// `(agent, host)` pairs that did not resolve.
    pub unresolved_hosts: Vec<(String, String)>,
}

impl PreflightReport {
    pub fn passed(&self, options: PreflightOptions) -> bool {
        self.missing_binaries.is_empty() && (!options.strict || self.unresolved_hosts.is_empty())
    }
}

/// Check every agent in `agents`, resolving hosts with `resolve`.
pub fn check<F>(registry: &AgentRegistry, agents: &[&str], resolve: F) -> Result<PreflightReport>
where
    F: Fn(&str) -> bool,
{
    let mut report = PreflightReport::default();
    for name in agents {
        let agent = registry.require(name)?;
        let spec = agent.spec();
        if find_in_path(&spec.binary).is_none() {
            report
                .missing_binaries
                .push((spec.name.clone(), spec.binary.clone()));
        }
        for host in &spec.required_hosts {
            if !resolve(host) {
                report.unresolved_hosts.push((spec.name.clone(), host.clone()));
            }
        }
    }
    Ok(report)
}

/// Run the checks with real DNS and log the outcome.
pub fn run(registry: &AgentRegistry, agents: &[&str], options: PreflightOptions) -> Result<()> {
    info!(agents = ?agents, "preflight: checking CLI binaries and DNS resolution");
    let report = check(registry, agents, can_resolve_host)?;
    for (agent, binary) in &report.missing_binaries {
        error!(agent = %agent, binary = %binary, "missing CLI binary");
    }
    for (agent, host) in &report.unresolved_hosts {
        warn!(agent = %agent, host = %host, "DNS resolution failed");
    }
    if report.passed(options) {
        info!("preflight result: OK");
        Ok(())
    } else {
        Err(anyhow!(
            "preflight failed ({} missing binaries, {} unresolved hosts)",
            report.missing_binaries.len(),
            report.unresolved_hosts.len()
        ))
    }
}

pub fn can_resolve_host(host: &str) -> bool {
    (host, 443)
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// Locate `binary` the way a shell would; paths with a separator are used as is.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(binary);
        return path.is_file().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for segment in std::env::split_paths(&path_var) {
        let candidate = segment.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::io::config::AgentOverride;

    fn registry_with_binary(name: &str, binary: &str) -> AgentRegistry {
        let overrides = BTreeMap::from([(
            name.to_string(),
            AgentOverride {
                binary: Some(binary.to_string()),
                timeout_secs: None,
            },
        )]);
        AgentRegistry::builtin(&overrides)
    }

    #[test]
    fn finds_shell_on_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
    }

    #[test]
    fn missing_binary_fails_even_when_not_strict() {
        let registry = registry_with_binary("codex", "definitely-not-a-real-binary-xyz");
        let report = check(&registry, &["codex"], |_| true).expect("check");
        assert_eq!(
            report.missing_binaries,
            vec![(
                "codex".to_string(),
                "definitely-not-a-real-binary-xyz".to_string()
            )]
        );
        assert!(!report.passed(PreflightOptions::default()));
    }

    #[test]
    fn unresolved_hosts_only_fail_in_strict_mode() {
        let registry = registry_with_binary("claude", "sh");
        let report = check(&registry, &["claude"], |_| false).expect("check");
        assert!(report.missing_binaries.is_empty());
        assert!(!report.unresolved_hosts.is_empty());
        assert!(report.passed(PreflightOptions { strict: false }));
        assert!(!report.passed(PreflightOptions { strict: true }));
    }

    #[test]
    fn unknown_agents_are_errors() {
        let registry = AgentRegistry::builtin(&BTreeMap::new());
        assert!(check(&registry, &["llama"], |_| true).is_err());
    }
}
