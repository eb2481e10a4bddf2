use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IptablesError {
    #[error("Failed to launch {path}: {source}")]
    Launch {
        path: String,
        source: std::io::Error,
    },
    #[error("{path} {args:?} exited with {status}: {stderr}")]
    CommandFailed {
        path: String,
        args: Vec<String>,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Unexpected iptables listing header: {0}")]
    ListingFormat(String),
}

// Column headers of `iptables -n -L -v -x --line-numbers` output. The parser
// refuses to guess if the utility ever changes this layout.
const LISTING_HEADERS: [&str; 10] = [
    "num",
    "pkts",
    "bytes",
    "target",
    "prot",
    "opt",
    "in",
    "out",
    "source",
    "destination",
];

pub const BUILTIN_CHAINS: [&str; 4] = ["INPUT", "OUTPUT", "FORWARD", "POSTROUTING"];
pub const BUILTIN_TARGETS: [&str; 5] = ["DROP", "ACCEPT", "REJECT", "CREATE", "SNAT"];

/// The sentinel meaning "any address" in iptables listings.
pub const ANY_ADDR: &str = "0.0.0.0/0";
/// The sentinel meaning "any interface".
pub const ANY_IFACE: &str = "*";

/// Known chain and target names. Seeded with the built-ins and extended at
/// runtime by `CREATE` commands and by scanning the live table, so path
/// parsing and rule application always validate against the current set.
#[derive(Debug, Clone)]
pub struct Registry {
    chains: HashSet<String>,
    targets: HashSet<String>,
}

impl Registry {
    pub fn with_builtins() -> Registry {
        Registry {
            chains: BUILTIN_CHAINS.iter().map(|s| s.to_string()).collect(),
            targets: BUILTIN_TARGETS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_chain(&self, name: &str) -> bool {
        self.chains.contains(name)
    }

    pub fn is_target(&self, name: &str) -> bool {
        self.targets.contains(name)
    }

    /// A user chain is usable both as a chain and as a jump target.
    pub fn add_chain(&mut self, name: &str) {
        self.chains.insert(name.to_string());
        self.targets.insert(name.to_string());
    }

    pub fn rename_chain(&mut self, old: &str, new: &str) {
        self.chains.remove(old);
        self.targets.remove(old);
        self.add_chain(new);
    }

    pub fn remove_chain(&mut self, name: &str) {
        self.chains.remove(name);
        self.targets.remove(name);
    }

    pub fn chain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.chains.iter().cloned().collect();
        names.sort();
        names
    }
}

pub type SharedRegistry = Arc<Mutex<Registry>>;

/// A single rule of the filter table, in the field order of the numeric
/// listing. `num`, `pkts` and `bytes` are observational only and never
/// participate in equality or hashing.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub chain: String,
    pub num: Option<String>,
    pub pkts: Option<String>,
    pub bytes: Option<String>,
    pub target: Option<String>,
    pub prot: String,
    pub opt: String,
    pub inp: String,
    pub out: String,
    pub source: String,
    pub destination: String,
    pub extra: String,
}

impl Default for Rule {
    fn default() -> Rule {
        Rule {
            chain: String::new(),
            num: None,
            pkts: None,
            bytes: None,
            target: None,
            prot: "all".to_string(),
            opt: "--".to_string(),
            inp: ANY_IFACE.to_string(),
            out: ANY_IFACE.to_string(),
            source: ANY_ADDR.to_string(),
            destination: ANY_ADDR.to_string(),
            extra: String::new(),
        }
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Rule) -> bool {
        self.chain == other.chain
            && self.target == other.target
            && self.prot == other.prot
            && self.opt == other.opt
            && self.inp == other.inp
            && self.out == other.out
            && self.source == other.source
            && self.destination == other.destination
            && self.extra == other.extra
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chain.hash(state);
        self.target.hash(state);
        self.prot.hash(state);
        self.opt.hash(state);
        self.inp.hash(state);
        self.out.hash(state);
        self.source.hash(state);
        self.destination.hash(state);
        self.extra.hash(state);
    }
}

impl Rule {
    /// Build a rule from a whitespace-split body line of the numeric listing.
    /// The first ten columns are positional; anything beyond them is joined
    /// into `extra`. The caller has verified `columns.len() >= 10`.
    pub fn from_listing(chain: &str, columns: &[&str]) -> Rule {
        Rule {
            chain: chain.to_string(),
            num: Some(columns[0].to_string()),
            pkts: Some(columns[1].to_string()),
            bytes: Some(columns[2].to_string()),
            target: Some(columns[3].to_string()),
            prot: columns[4].to_string(),
            opt: columns[5].to_string(),
            inp: columns[6].to_string(),
            out: columns[7].to_string(),
            source: columns[8].to_string(),
            destination: columns[9].to_string(),
            extra: columns[10..].join(" "),
        }
    }

    /// Copy with the observational fields cleared, for membership tracking
    /// and for listing responses.
    pub fn without_counters(&self) -> Rule {
        Rule {
            num: None,
            pkts: None,
            bytes: None,
            ..self.clone()
        }
    }

    /// Placeholder entry representing a user chain that currently holds no
    /// rules, so created chains still show up in listings.
    fn chain_placeholder(chain: &str) -> Rule {
        Rule {
            chain: chain.to_string(),
            prot: String::new(),
            opt: String::new(),
            inp: String::new(),
            out: String::new(),
            source: String::new(),
            destination: String::new(),
            ..Rule::default()
        }
    }
}

/// Mutation verbs understood by the driver, mapping onto the utility's
/// `-I`, `-D`, `-X`, `-N` and `-E` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert,
    Delete,
    DestroyChain,
    NewChain,
    RenameChain,
}

impl Op {
    fn flag(self) -> &'static str {
        match self {
            Op::Insert => "-I",
            Op::Delete => "-D",
            Op::DestroyChain => "-X",
            Op::NewChain => "-N",
            Op::RenameChain => "-E",
        }
    }
}

/// The subset of driver operations the command worker depends on, split out
/// so worker tests can substitute a recording implementation.
#[async_trait::async_trait]
pub trait RuleBackend: Send + Sync {
    async fn load_chains(&self) -> Result<(), IptablesError>;
    async fn read_simple_rules(&self, chain: Option<&str>) -> Result<Vec<Rule>, IptablesError>;
    async fn apply(&self, op: Op, rule: &Rule) -> Result<(), IptablesError>;
}

/// The driver operations the startup port lockdown depends on, split out the
/// same way so the bootstrap sequence can be tested against a recording
/// implementation.
#[async_trait::async_trait]
pub trait BootstrapBackend: Send + Sync {
    async fn list(&self) -> Result<Vec<Rule>, IptablesError>;
    async fn exe(&self, args: &[&str]) -> Result<String, IptablesError>;
    async fn apply(&self, op: Op, rule: &Rule) -> Result<(), IptablesError>;
}

/// Driver for the system iptables utility. All executions are serialized
/// through a single lock; the live table is a process-wide resource.
#[derive(Debug)]
pub struct Iptables {
    ipt_path: String,
    registry: SharedRegistry,
    lock: tokio::sync::Mutex<()>,
    log: slog::Logger,
}

impl Iptables {
    pub fn new(ipt_path: &str, registry: SharedRegistry, log: slog::Logger) -> Iptables {
        Iptables {
            ipt_path: ipt_path.to_string(),
            registry,
            lock: tokio::sync::Mutex::new(()),
            log,
        }
    }

    fn registry_snapshot(&self) -> Registry {
        self.registry.lock().unwrap().clone()
    }

    /// Run the utility with the given arguments under the driver lock and
    /// return its stdout. A non-zero exit becomes a structured error carrying
    /// the argv, status and stderr.
    pub async fn exe(&self, args: &[&str]) -> Result<String, IptablesError> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.exe_owned(owned).await
    }

    async fn exe_owned(&self, args: Vec<String>) -> Result<String, IptablesError> {
        let _guard = self.lock.lock().await;
        slog::debug!(self.log, "exec"; "cmd" => format!("{} {}", self.ipt_path, args.join(" ")));
        let output = tokio::process::Command::new(&self.ipt_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| IptablesError::Launch {
                path: self.ipt_path.clone(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(IptablesError::CommandFailed {
                path: self.ipt_path.clone(),
                args,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Check that the utility can be launched at all.
    pub async fn verify_install(&self) -> Result<(), IptablesError> {
        self.exe(&["-h"]).await.map(|_| ())
    }

    /// Check that we have sufficient privilege to list the table.
    pub async fn verify_permission(&self) -> Result<(), IptablesError> {
        self.exe(&["-n", "-L", "OUTPUT"]).await.map(|_| ())
    }

    /// List and parse the current rules of the filter table.
    pub async fn list(&self) -> Result<Vec<Rule>, IptablesError> {
        let out = self.exe(&["-n", "-L", "-v", "-x", "--line-numbers"]).await?;
        parse_listing(&out, &self.registry_snapshot())
    }

    /// Scan the table for chain names not yet in the registry and register
    /// them, so previously created user chains survive a restart.
    pub async fn load_chains(&self) -> Result<(), IptablesError> {
        let out = self.exe(&["-L"]).await?;
        let mut registry = self.registry.lock().unwrap();
        for name in scan_chain_names(&out) {
            if !registry.is_chain(&name) {
                registry.add_chain(&name);
            }
        }
        Ok(())
    }

    /// List the subset of the table this service manages, optionally
    /// filtered to one chain, with observational fields cleared.
    pub async fn read_simple_rules(&self, chain: Option<&str>) -> Result<Vec<Rule>, IptablesError> {
        let rules = self.list().await?;
        Ok(simple_rule_subset(&rules, chain, &self.registry_snapshot()))
    }

    /// Apply a mutation for the rule. No-op when the rule carries no target.
    pub async fn apply(&self, op: Op, rule: &Rule) -> Result<(), IptablesError> {
        if rule.target.is_none() {
            return Ok(());
        }
        let mut args = vec![op.flag().to_string()];
        args.extend(rule_to_argv(rule, &self.registry_snapshot()));
        self.exe_owned(args).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl RuleBackend for Iptables {
    async fn load_chains(&self) -> Result<(), IptablesError> {
        Iptables::load_chains(self).await
    }

    async fn read_simple_rules(&self, chain: Option<&str>) -> Result<Vec<Rule>, IptablesError> {
        Iptables::read_simple_rules(self, chain).await
    }

    async fn apply(&self, op: Op, rule: &Rule) -> Result<(), IptablesError> {
        Iptables::apply(self, op, rule).await
    }
}

#[async_trait::async_trait]
impl BootstrapBackend for Iptables {
    async fn list(&self) -> Result<Vec<Rule>, IptablesError> {
        Iptables::list(self).await
    }

    async fn exe(&self, args: &[&str]) -> Result<String, IptablesError> {
        Iptables::exe(self, args).await
    }

    async fn apply(&self, op: Op, rule: &Rule) -> Result<(), IptablesError> {
        Iptables::apply(self, op, rule).await
    }
}

/// Parse the output of the numeric verbose listing. A blank line resets the
/// current chain; `Chain <name>` lines switch it when the name is known;
/// digit-led body lines become rules with the free-form tail in `extra`.
pub fn parse_listing(out: &str, registry: &Registry) -> Result<Vec<Rule>, IptablesError> {
    let mut rules = Vec::new();
    let mut chain: Option<String> = None;
    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            chain = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix("Chain ") {
            let name = rest.split_whitespace().next().unwrap_or("");
            chain = if registry.is_chain(name) {
                Some(name.to_string())
            } else {
                None
            };
            continue;
        }
        if line.contains("source") && line.contains("destination") {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns != LISTING_HEADERS {
                return Err(IptablesError::ListingFormat(line.to_string()));
            }
            continue;
        }
        if let Some(current) = &chain {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() >= 10 && columns[0].bytes().all(|b| b.is_ascii_digit()) {
                rules.push(Rule::from_listing(current, &columns));
            }
        }
    }
    Ok(rules)
}

/// Chain names appearing in a plain `-L` listing.
pub fn scan_chain_names(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.trim().strip_prefix("Chain "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(|name| name.to_string())
        .collect()
}

/// Filter a listing down to the rules this service considers its own: known
/// targets only, and for INPUT/OUTPUT the opposite endpoint and interface
/// must be the "any" sentinel. FORWARD and user-chain rules qualify
/// regardless. Empty user chains yield a placeholder entry.
pub fn simple_rule_subset(rules: &[Rule], chain: Option<&str>, registry: &Registry) -> Vec<Rule> {
    let known_target =
        |r: &Rule| r.target.as_deref().map_or(false, |t| registry.is_target(t));
    let mut out = Vec::new();

    if chain.is_none() || chain == Some("INPUT") {
        out.extend(
            rules
                .iter()
                .filter(|r| {
                    r.chain == "INPUT"
                        && known_target(r)
                        && r.destination == ANY_ADDR
                        && r.out == ANY_IFACE
                })
                .map(Rule::without_counters),
        );
    }
    if chain.is_none() || chain == Some("OUTPUT") {
        out.extend(
            rules
                .iter()
                .filter(|r| {
                    r.chain == "OUTPUT"
                        && known_target(r)
                        && r.source == ANY_ADDR
                        && r.inp == ANY_IFACE
                })
                .map(Rule::without_counters),
        );
    }
    if chain.is_none() || chain == Some("FORWARD") {
        out.extend(
            rules
                .iter()
                .filter(|r| r.chain == "FORWARD" && known_target(r))
                .map(Rule::without_counters),
        );
    }

    for name in registry.chain_names() {
        if name == "INPUT" || name == "OUTPUT" || name == "FORWARD" {
            continue;
        }
        match chain {
            Some(filter) if filter != name => continue,
            _ => {}
        }
        let chain_rules: Vec<Rule> = rules
            .iter()
            .filter(|r| r.chain == name && known_target(r))
            .map(Rule::without_counters)
            .collect();
        if chain_rules.is_empty() {
            out.push(Rule::chain_placeholder(&name));
        } else {
            out.extend(chain_rules);
        }
    }

    out
}

/// Translate a rule into utility arguments, e.g.
/// `["INPUT", "-p", "tcp", "-j", "DROP", "--sport", "5678", "-s", "1.2.3.4"]`.
/// Sentinel values for protocol, interfaces and addresses are omitted.
pub fn rule_to_argv(rule: &Rule, registry: &Registry) -> Vec<String> {
    let target = rule.target.as_deref().unwrap_or("");

    if target == "CREATE" {
        // For a rename the chain field carries `old:new`; the verb decides
        // between -N, -E and -X at the call site.
        return match rule.chain.split_once(':') {
            Some((old, new)) => vec![old.to_string(), new.to_string()],
            None => vec![rule.chain.clone()],
        };
    }

    let mut argv = vec![rule.chain.clone()];
    if rule.chain == "POSTROUTING" {
        argv.push("-t".to_string());
        argv.push("nat".to_string());
    }

    debug_assert!(registry.is_chain(&rule.chain));

    if rule.prot != "all" {
        argv.push("-p".to_string());
        argv.push(rule.prot.clone());
    }

    argv.push("-j".to_string());
    argv.push(target.to_string());

    for token in rule.extra.split_whitespace() {
        if let Some(port) = token.strip_prefix("dpt:") {
            argv.push("--dport".to_string());
            argv.push(port.to_string());
        } else if let Some(port) = token.strip_prefix("spt:") {
            argv.push("--sport".to_string());
            argv.push(port.to_string());
        } else if let Some(addr) = token.strip_prefix("to:") {
            argv.push("--to-source".to_string());
            argv.push(addr.to_string());
        }
    }

    if rule.inp != ANY_IFACE {
        argv.push("-i".to_string());
        argv.push(rule.inp.clone());
    }
    if rule.out != ANY_IFACE {
        argv.push("-o".to_string());
        argv.push(rule.out.clone());
    }
    if rule.destination != ANY_ADDR {
        argv.push("-d".to_string());
        argv.push(rule.destination.clone());
    }
    if rule.source != ANY_ADDR {
        argv.push("-s".to_string());
        argv.push(rule.source.clone());
    }

    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Chain INPUT (policy ACCEPT 0 packets, 0 bytes)
num      pkts      bytes target     prot opt in     out     source               destination
1           0        0 ACCEPT     tcp  --  *      *       127.0.0.1            0.0.0.0/0            tcp dpt:7393
2          14      840 DROP       tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:7393
3           0        0 DROP       all  --  eth+   *       2.2.2.2              0.0.0.0/0

Chain FORWARD (policy ACCEPT 0 packets, 0 bytes)
num      pkts      bytes target     prot opt in     out     source               destination

Chain OUTPUT (policy ACCEPT 0 packets, 0 bytes)
num      pkts      bytes target     prot opt in     out     source               destination
1           0        0 DROP       all  --  *      tun+    0.0.0.0/0            7.7.7.6
";

    #[test]
    fn test_parse_listing() {
        let registry = Registry::with_builtins();
        let rules = parse_listing(LISTING, &registry).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0],
            Rule {
                chain: "INPUT".to_string(),
                target: Some("ACCEPT".to_string()),
                prot: "tcp".to_string(),
                source: "127.0.0.1".to_string(),
                extra: "tcp dpt:7393".to_string(),
                ..Rule::default()
            }
        );
        assert_eq!(rules[0].num.as_deref(), Some("1"));
        assert_eq!(rules[1].pkts.as_deref(), Some("14"));
        assert_eq!(rules[1].bytes.as_deref(), Some("840"));
        assert_eq!(rules[2].inp, "eth+");
        assert_eq!(rules[2].extra, "");
        assert_eq!(rules[3].chain, "OUTPUT");
        assert_eq!(rules[3].out, "tun+");
        assert_eq!(rules[3].destination, "7.7.7.6");
    }

    #[test]
    fn test_parse_listing_rejects_changed_header() {
        let registry = Registry::with_builtins();
        let out = "Chain INPUT (policy ACCEPT)\n\
                   num pkts bytes target prot opt in out source destination flags\n";
        assert!(parse_listing(out, &registry).is_err());
    }

    #[test]
    fn test_parse_listing_skips_unknown_chains() {
        let registry = Registry::with_builtins();
        let out = "\
Chain MYSTERY (1 references)
num      pkts      bytes target     prot opt in     out     source               destination
1           0        0 DROP       all  --  *      *       1.1.1.1              0.0.0.0/0
";
        assert_eq!(parse_listing(out, &registry).unwrap().len(), 0);
    }

    #[test]
    fn test_rule_equality_ignores_counters() {
        let a = Rule {
            chain: "INPUT".to_string(),
            target: Some("DROP".to_string()),
            source: "1.2.3.4".to_string(),
            num: Some("3".to_string()),
            pkts: Some("100".to_string()),
            bytes: Some("9000".to_string()),
            ..Rule::default()
        };
        let b = Rule {
            chain: "INPUT".to_string(),
            target: Some("DROP".to_string()),
            source: "1.2.3.4".to_string(),
            ..Rule::default()
        };
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_rule_to_argv_plain_drop() {
        let registry = Registry::with_builtins();
        let rule = Rule {
            chain: "INPUT".to_string(),
            target: Some("DROP".to_string()),
            inp: "eth0".to_string(),
            source: "5.6.7.8".to_string(),
            ..Rule::default()
        };
        assert_eq!(
            rule_to_argv(&rule, &registry),
            vec!["INPUT", "-j", "DROP", "-i", "eth0", "-s", "5.6.7.8"]
        );
    }

    #[test]
    fn test_rule_to_argv_omits_sentinels() {
        let registry = Registry::with_builtins();
        let rule = Rule {
            chain: "OUTPUT".to_string(),
            target: Some("ACCEPT".to_string()),
            ..Rule::default()
        };
        let argv = rule_to_argv(&rule, &registry);
        assert_eq!(argv, vec!["OUTPUT", "-j", "ACCEPT"]);
        assert!(!argv.contains(&"-p".to_string()));
        assert!(!argv.contains(&"-i".to_string()));
        assert!(!argv.contains(&"-o".to_string()));
        assert!(!argv.contains(&"-s".to_string()));
        assert!(!argv.contains(&"-d".to_string()));
    }

    #[test]
    fn test_rule_to_argv_ports_from_extra() {
        let registry = Registry::with_builtins();
        let rule = Rule {
            chain: "INPUT".to_string(),
            target: Some("DROP".to_string()),
            prot: "tcp".to_string(),
            extra: "tcp dpt:7393 spt:34543".to_string(),
            ..Rule::default()
        };
        assert_eq!(
            rule_to_argv(&rule, &registry),
            vec![
                "INPUT", "-p", "tcp", "-j", "DROP", "--dport", "7393", "--sport", "34543"
            ]
        );
    }

    #[test]
    fn test_rule_to_argv_snat_postrouting() {
        let registry = Registry::with_builtins();
        let rule = Rule {
            chain: "POSTROUTING".to_string(),
            target: Some("SNAT".to_string()),
            extra: "to:1.2.3.4".to_string(),
            ..Rule::default()
        };
        assert_eq!(
            rule_to_argv(&rule, &registry),
            vec!["POSTROUTING", "-t", "nat", "-j", "SNAT", "--to-source", "1.2.3.4"]
        );
    }

    #[test]
    fn test_rule_to_argv_create_and_rename() {
        let registry = Registry::with_builtins();
        let create = Rule {
            chain: "BANLIST".to_string(),
            target: Some("CREATE".to_string()),
            ..Rule::default()
        };
        assert_eq!(rule_to_argv(&create, &registry), vec!["BANLIST"]);

        let rename = Rule {
            chain: "BANLIST:DENYLIST".to_string(),
            target: Some("CREATE".to_string()),
            ..Rule::default()
        };
        assert_eq!(rule_to_argv(&rename, &registry), vec!["BANLIST", "DENYLIST"]);
    }

    #[test]
    fn test_simple_rule_subset() {
        let registry = Registry::with_builtins();
        let mut rules = parse_listing(LISTING, &registry).unwrap();
        // An INPUT rule with a concrete destination was not installed through
        // this service and must not be claimed.
        rules.push(Rule {
            chain: "INPUT".to_string(),
            target: Some("ACCEPT".to_string()),
            destination: "9.9.9.9".to_string(),
            ..Rule::default()
        });
        let simple = simple_rule_subset(&rules, None, &registry);
        let input: Vec<&Rule> = simple.iter().filter(|r| r.chain == "INPUT").collect();
        assert_eq!(input.len(), 3);
        assert!(input.iter().all(|r| r.num.is_none()));
        // The OUTPUT rule keeps the any-sentinel on its source side, so it
        // qualifies even with a concrete destination.
        assert!(simple
            .iter()
            .any(|r| r.chain == "OUTPUT" && r.destination == "7.7.7.6"));
        // POSTROUTING is empty and contributes a placeholder.
        let placeholder: Vec<&Rule> = simple
            .iter()
            .filter(|r| r.chain == "POSTROUTING")
            .collect();
        assert_eq!(placeholder.len(), 1);
        assert!(placeholder[0].target.is_none());
    }

    #[test]
    fn test_simple_rule_subset_chain_filter() {
        let registry = Registry::with_builtins();
        let rules = parse_listing(LISTING, &registry).unwrap();
        let simple = simple_rule_subset(&rules, Some("INPUT"), &registry);
        assert!(simple.iter().all(|r| r.chain == "INPUT"));
        assert_eq!(simple.len(), 3);
    }

    #[test]
    fn test_scan_chain_names() {
        let out = "Chain INPUT (policy ACCEPT)\n\ntarget prot opt source destination\n\
                   Chain BANLIST (0 references)\n";
        assert_eq!(scan_chain_names(out), vec!["INPUT", "BANLIST"]);
    }
}
