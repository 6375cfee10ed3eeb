//! iptables chain management
//!
//! Maintains a dedicated chain jumped to from one or more parent chains.
//! The chain starts with a fixed block of always-accept base rules
//! (loopback, established/related, exempt ports); per-IP decisions are
//! inserted directly after that block and an optional catch-all DROP sits
//! at the tail.
//!
//! All operations shell out synchronously. Callers on the async runtime
//! should go through `spawn_blocking`.

use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::error::FirewallError;

pub const DEFAULT_CHAIN: &str = "REAUTH_FW";
pub const DEFAULT_PARENT_CHAINS: [&str; 2] = ["INPUT", "DOCKER-USER"];

/// Ports per multiport directive; iptables caps multiport at 15
const PORTS_PER_RULE: usize = 15;

/// Per-IP decision as printed by `iptables -S`
static IP_RULE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-[AI]\s+\S+\s+-s\s+([0-9./]+)\s+-j\s+(ACCEPT|DROP)").expect("static ip rule pattern")
});

/// Exempt-port accept as printed by `iptables -S`
static PORT_RULE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-A\s+\S+\s+-p\s+(tcp|udp)\s+-m\s+multiport\s+--dports\s+(\S+)\s+-j\s+ACCEPT\s*$")
        .expect("static port rule pattern")
});

const LOOPBACK_RULE: [&str; 4] = ["-i", "lo", "-j", "ACCEPT"];
const ESTABLISHED_RULE: [&str; 6] = ["-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"];

/// Executes one `iptables` invocation and returns its combined output
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<String, FirewallError>;
}

/// Runs the real binary, through `sudo` unless already root
#[derive(Debug, Clone)]
pub struct SystemRunner {
    use_sudo: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self {
            use_sudo: !running_as_root(),
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

impl CommandRunner for SystemRunner {
    fn run(&self, args: &[&str]) -> Result<String, FirewallError> {
        let cmd_str = args.join(" ");
        debug!("Running: iptables {}", cmd_str);

        let mut command = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("iptables");
            c
        } else {
            Command::new("iptables")
        };

        let output = command
            .args(args)
            .output()
            .map_err(|e| FirewallError::Spawn {
                cmd: cmd_str.clone(),
                source: e,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(FirewallError::Command {
                cmd: cmd_str,
                output: combined.trim().to_string(),
            });
        }
        Ok(combined)
    }
}

/// Exempt ports, accepted as `["80","443"]`, `[80, 443]` or `"80,443"`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortList(pub Vec<String>);

impl<'de> Deserialize<'de> for PortList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Strings(Vec<String>),
            Numbers(Vec<i64>),
            Joined(String),
        }

        let ports = match Raw::deserialize(deserializer)? {
            Raw::Strings(items) => split_trimmed(items.iter().map(String::as_str)),
            Raw::Numbers(items) => items
                .into_iter()
                .filter(|n| *n > 0)
                .map(|n| n.to_string())
                .collect(),
            Raw::Joined(joined) => split_trimmed(joined.split(',')),
        };
        Ok(PortList(ports))
    }
}

/// Parent chains, accepted as a single name or a list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParentChains(pub Vec<String>);

impl<'de> Deserialize<'de> for ParentChains {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        let parents = match Raw::deserialize(deserializer)? {
            Raw::One(name) => split_trimmed(std::iter::once(name.as_str())),
            Raw::Many(names) => split_trimmed(names.iter().map(String::as_str)),
        };
        Ok(ParentChains(parents))
    }
}

fn split_trimmed<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IpAction {
    Accept,
    Drop,
}

impl IpAction {
    fn target(self) -> &'static str {
        match self {
            IpAction::Accept => "ACCEPT",
            IpAction::Drop => "DROP",
        }
    }
}

/// One per-IP decision found in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRule {
    pub ip: String,
    pub action: IpAction,
}

#[derive(Debug, Clone)]
struct ChainState {
    chain: String,
    parents: Vec<String>,
    exempt_ports: Vec<String>,
    base_rule_count: usize,
}

/// Number of base rules for a given exempt-port count
pub fn base_rule_count(exempt_ports: usize) -> usize {
    2 + exempt_ports.div_ceil(PORTS_PER_RULE) * 2
}

/// Accept a dotted IPv4 address or an IPv4 CIDR block
pub fn validate_source(ip: &str) -> Result<(), FirewallError> {
    let invalid = || FirewallError::InvalidSource(ip.to_string());
    let (addr, prefix) = match ip.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (ip, None),
    };
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        match prefix.parse::<u8>() {
            Ok(bits) if bits <= 32 => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

pub struct FirewallManager {
    runner: Arc<dyn CommandRunner>,
    state: Mutex<ChainState>,
}

impl FirewallManager {
    pub fn new(runner: Arc<dyn CommandRunner>, chain: Option<&str>) -> Self {
        let chain = chain
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CHAIN)
            .to_string();
        Self {
            runner,
            state: Mutex::new(ChainState {
                chain,
                parents: DEFAULT_PARENT_CHAINS.iter().map(|s| s.to_string()).collect(),
                exempt_ports: Vec::new(),
                base_rule_count: base_rule_count(0),
            }),
        }
    }

    pub fn chain_name(&self) -> String {
        self.state.lock().chain.clone()
    }

    pub fn parent_chains(&self) -> Vec<String> {
        self.state.lock().parents.clone()
    }

    pub fn base_rule_count(&self) -> usize {
        self.state.lock().base_rule_count
    }

    /// Override chain, parents and exempt ports ahead of the next `init`
    pub fn configure(
        &self,
        chain: Option<String>,
        parents: Option<Vec<String>>,
        exempt_ports: Option<Vec<String>>,
    ) {
        let mut state = self.state.lock();
        if let Some(chain) = chain.filter(|c| !c.is_empty()) {
            state.chain = chain;
        }
        if let Some(parents) = parents.filter(|p| !p.is_empty()) {
            state.parents = parents;
        }
        if let Some(ports) = exempt_ports {
            state.exempt_ports = ports;
        }
    }

    /// Create and link the chain, then install or refresh the base block.
    /// Per-IP decisions already in an existing chain are kept.
    pub fn init(&self) -> Result<(), FirewallError> {
        let mut state = self.state.lock();
        let chain = state.chain.clone();

        let mut created = false;
        if self.runner.run(&["-L", &chain, "-n"]).is_err() {
            self.runner
                .run(&["-N", &chain])
                .map_err(|e| FirewallError::init("Failed to create chain", e))?;
            created = true;
        }

        for parent in &state.parents {
            if self.runner.run(&["-C", parent, "-j", &chain]).is_err() {
                self.runner
                    .run(&["-I", parent, "1", "-j", &chain])
                    .map_err(|e| FirewallError::init(format!("Failed to link chain to {}", parent), e))?;
            }
        }

        state.base_rule_count = base_rule_count(state.exempt_ports.len());

        let applied = if created {
            self.apply_base_rules(&state)
        } else {
            self.refresh_base_rules(&state)
        };
        applied.map_err(|e| FirewallError::init("Failed to apply base rules", e))?;

        info!(
            "Firewall chain {} ready (parents: {}, base rules: {})",
            chain,
            state.parents.join(","),
            state.base_rule_count
        );
        Ok(())
    }

    /// Clear the chain and reinstall the base rules
    pub fn flush(&self) -> Result<(), FirewallError> {
        let mut state = self.state.lock();
        self.runner
            .run(&["-F", &state.chain])
            .map_err(|e| FirewallError::operation("Failed to flush chain", e))?;
        self.apply_base_rules(&state)
            .map_err(|e| FirewallError::operation("Failed to reapply base rules", e))?;
        state.base_rule_count = base_rule_count(state.exempt_ports.len());
        info!("Firewall chain {} flushed", state.chain);
        Ok(())
    }

    /// Unlink from every parent and delete the chain, best-effort throughout
    pub fn destroy(&self) -> Result<(), FirewallError> {
        let state = self.state.lock();
        let chain = state.chain.as_str();
        for parent in &state.parents {
            while self.runner.run(&["-D", parent, "-j", chain]).is_ok() {}
        }
        if let Err(e) = self.runner.run(&["-F", chain]) {
            debug!("Flush during destroy failed: {}", e);
        }
        if let Err(e) = self.runner.run(&["-X", chain]) {
            debug!("Delete during destroy failed: {}", e);
        }
        info!("Firewall chain {} removed", chain);
        Ok(())
    }

    /// Append a single catch-all DROP at the tail
    pub fn block_all(&self) -> Result<(), FirewallError> {
        let state = self.state.lock();
        self.remove_catch_all(&state.chain);
        self.runner
            .run(&["-A", &state.chain, "-j", "DROP"])
            .map_err(|e| FirewallError::operation("Failed to block all", e))?;
        info!("Firewall chain {} now drops unlisted sources", state.chain);
        Ok(())
    }

    pub fn allow_all(&self) -> Result<(), FirewallError> {
        let state = self.state.lock();
        self.remove_catch_all(&state.chain);
        info!("Firewall chain {} catch-all removed", state.chain);
        Ok(())
    }

    fn remove_catch_all(&self, chain: &str) {
        while self.runner.run(&["-D", chain, "-j", "DROP"]).is_ok() {}
    }

    pub fn allow_ip(&self, ip: &str) -> Result<(), FirewallError> {
        self.set_ip(ip, IpAction::Accept)
    }

    pub fn block_ip(&self, ip: &str) -> Result<(), FirewallError> {
        self.set_ip(ip, IpAction::Drop)
    }

    /// Drop any decision for `ip`, in either direction
    pub fn remove_ip(&self, ip: &str) -> Result<(), FirewallError> {
        validate_source(ip)?;
        let state = self.state.lock();
        self.remove_ip_rules(&state.chain, ip);
        Ok(())
    }

    fn set_ip(&self, ip: &str, action: IpAction) -> Result<(), FirewallError> {
        validate_source(ip)?;
        let state = self.state.lock();
        self.remove_ip_rules(&state.chain, ip);

        let position = (state.base_rule_count + 1).to_string();
        self.runner
            .run(&["-I", &state.chain, &position, "-s", ip, "-j", action.target()])
            .map_err(|e| {
                let verb = match action {
                    IpAction::Accept => "allow",
                    IpAction::Drop => "block",
                };
                FirewallError::operation(format!("Failed to {} IP {}", verb, ip), e)
            })?;
        info!("Firewall {} {} at position {}", action.target(), ip, position);
        Ok(())
    }

    fn remove_ip_rules(&self, chain: &str, ip: &str) {
        for target in ["ACCEPT", "DROP"] {
            if self.runner.run(&["-D", chain, "-s", ip, "-j", target]).is_ok() {
                debug!("Removed {} rule for {}", target, ip);
            }
        }
    }

    /// Per-IP decisions currently in the chain
    pub fn list_rules(&self) -> Result<Vec<IpRule>, FirewallError> {
        let chain = self.state.lock().chain.clone();
        let output = self
            .runner
            .run(&["-S", &chain])
            .map_err(|e| FirewallError::Parse(Box::new(e)))?;
        Ok(self.parse_rules(&output))
    }

    fn parse_rules(&self, output: &str) -> Vec<IpRule> {
        output
            .lines()
            .filter_map(|line| IP_RULE_PATTERN.captures(line))
            .filter_map(|caps| {
                let ip = caps[1].trim_end_matches("/32").to_string();
                if ip == "0.0.0.0/0" {
                    return None;
                }
                let action = match &caps[2] {
                    "ACCEPT" => IpAction::Accept,
                    _ => IpAction::Drop,
                };
                Some(IpRule { ip, action })
            })
            .collect()
    }

    fn apply_base_rules(&self, state: &ChainState) -> Result<(), FirewallError> {
        for rule in base_rules(&state.exempt_ports) {
            let mut args = vec!["-A", state.chain.as_str()];
            args.extend(rule.iter().map(String::as_str));
            self.runner.run(&args)?;
        }
        Ok(())
    }

    /// Replace the base block of an existing chain in place
    fn refresh_base_rules(&self, state: &ChainState) -> Result<(), FirewallError> {
        let chain = state.chain.as_str();
        for fixed in [&LOOPBACK_RULE[..], &ESTABLISHED_RULE[..]] {
            let mut args = vec!["-D", chain];
            args.extend_from_slice(fixed);
            while self.runner.run(&args).is_ok() {}
        }

        let listing = self.runner.run(&["-S", chain])?;
        for caps in listing.lines().filter_map(|line| PORT_RULE_PATTERN.captures(line)) {
            self.runner.run(&[
                "-D", chain, "-p", &caps[1], "-m", "multiport", "--dports", &caps[2], "-j", "ACCEPT",
            ])?;
        }

        for (index, rule) in base_rules(&state.exempt_ports).iter().enumerate() {
            let position = (index + 1).to_string();
            let mut args = vec!["-I", chain, position.as_str()];
            args.extend(rule.iter().map(String::as_str));
            self.runner.run(&args)?;
        }
        debug!("Refreshed base rules of chain {}", chain);
        Ok(())
    }
}

/// Base block in chain order: loopback, established/related, then exempt ports
fn base_rules(exempt_ports: &[String]) -> Vec<Vec<String>> {
    fn owned(rule: &[&str]) -> Vec<String> {
        rule.iter().map(|s| s.to_string()).collect()
    }

    let mut rules = vec![owned(&LOOPBACK_RULE[..]), owned(&ESTABLISHED_RULE[..])];
    for chunk in exempt_ports.chunks(PORTS_PER_RULE) {
        let ports = chunk.join(",");
        for proto in ["tcp", "udp"] {
            rules.push(owned(&["-p", proto, "-m", "multiport", "--dports", ports.as_str(), "-j", "ACCEPT"]));
        }
    }
    rules
}
