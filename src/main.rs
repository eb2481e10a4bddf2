use std::sync::{Arc, Mutex};

use git_version::git_version;
use slog::Drain;
use structopt::StructOpt;

use crate::enforcer::CommandWorker;
use crate::iptables::{BootstrapBackend, Iptables, Op, Registry, SharedRegistry};

mod cmdparse;
mod enforcer;
mod expiry;
mod iptables;
mod iputil;
mod server;
mod timeutil;

const GIT_VERSION: &str = git_version!(
    args = ["--long", "--all", "--always", "--dirty=-modified"],
    fallback = "unknown"
);

#[derive(Debug, StructOpt)]
#[structopt(name = "rufw", about = "A remote-manageable iptables firewall agent.")]
struct Opt {
    /// The path of the configuration file.
    #[structopt(short = "c", long = "config", default_value = "/etc/rufw/config.yml")]
    config: std::path::PathBuf,

    /// The path of the log file.
    #[structopt(long = "logfile", default_value = "/var/log/rufw.log")]
    logfile: std::path::PathBuf,

    /// Log level of the file sink.
    #[structopt(long = "loglevel", default_value = "info")]
    loglevel: String,

    /// Verbose console output. Raises the stderr sink from errors-only to
    /// debug.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

mod config {
    use anyhow::Context;
    use std::str::FromStr;

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Version {
        pub version: Option<i16>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1 {
        pub iptables_path: Option<String>,
        pub local_server: Option<bool>,
        pub local_server_port: Option<u16>,
        pub outward_server: Option<bool>,
        pub outward_server_ip: Option<String>,
        pub outward_server_port: Option<u16>,
        pub outward_server_certfile: Option<String>,
        pub outward_server_keyfile: Option<String>,
        pub auth_username: Option<String>,
        pub auth_password: Option<String>,
        pub whitelist: Option<Vec<String>>,
        pub default_expire: Option<String>,
        pub non_restful: Option<bool>,
    }

    // An internal configuration structure used by the rest of the program
    // that can be updated without breaking compatibility with existing
    // configuration files.
    #[derive(Debug)]
    pub struct Internal {
        pub iptables_path: String,
        pub local_server: bool,
        pub local_server_port: u16,
        pub outward_server: bool,
        pub outward_server_ip: std::net::Ipv4Addr,
        pub outward_server_port: u16,
        pub outward_server_certfile: std::path::PathBuf,
        pub outward_server_keyfile: std::path::PathBuf,
        pub auth_username: String,
        pub auth_password: String,
        pub whitelist: Vec<ipnetwork::Ipv4Network>,
        pub default_expire: u64,
        pub non_restful: bool,
    }

    impl Internal {
        pub fn from_v1(parsed: V1) -> anyhow::Result<Internal> {
            let whitelist = parsed
                .whitelist
                .unwrap_or_else(|| vec!["127.0.0.1".to_string()])
                .iter()
                .map(|entry| {
                    ipnetwork::Ipv4Network::from_str(entry)
                        .with_context(|| format!("Bad whitelist entry '{}'", entry))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let default_expire = parsed.default_expire.unwrap_or_else(|| "0".to_string());
            let default_expire = crate::timeutil::parse_interval(&default_expire)
                .with_context(|| format!("Bad defaultExpire value '{}'", default_expire))?;

            let outward_server_ip = parsed
                .outward_server_ip
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let outward_server_ip = std::net::Ipv4Addr::from_str(&outward_server_ip)
                .with_context(|| format!("Bad outwardServerIp value '{}'", outward_server_ip))?;

            let internal = Internal {
                iptables_path: parsed
                    .iptables_path
                    .unwrap_or_else(|| "/sbin/iptables".to_string()),
                local_server: parsed.local_server.unwrap_or(true),
                local_server_port: parsed.local_server_port.unwrap_or(7390),
                outward_server: parsed.outward_server.unwrap_or(false),
                outward_server_ip,
                outward_server_port: parsed.outward_server_port.unwrap_or(7393),
                outward_server_certfile: parsed
                    .outward_server_certfile
                    .unwrap_or_default()
                    .into(),
                outward_server_keyfile: parsed.outward_server_keyfile.unwrap_or_default().into(),
                auth_username: parsed.auth_username.unwrap_or_default(),
                auth_password: parsed.auth_password.unwrap_or_default(),
                whitelist,
                default_expire,
                non_restful: parsed.non_restful.unwrap_or(false),
            };

            if internal.outward_server {
                if internal.auth_username.is_empty() || internal.auth_password.is_empty() {
                    anyhow::bail!(
                        "The outward server requires authUsername and authPassword to be set"
                    );
                }
                if !internal.outward_server_certfile.is_file() {
                    anyhow::bail!(
                        "Could not locate certfile {}",
                        internal.outward_server_certfile.display()
                    );
                }
                if !internal.outward_server_keyfile.is_file() {
                    anyhow::bail!(
                        "Could not locate keyfile {}",
                        internal.outward_server_keyfile.display()
                    );
                }
            }
            if !internal.local_server && !internal.outward_server {
                anyhow::bail!("Neither localServer nor outwardServer is enabled");
            }

            Ok(internal)
        }
    }
}

fn parse_level(name: &str) -> Option<slog::Level> {
    match name.to_lowercase().as_str() {
        "critical" => Some(slog::Level::Critical),
        "error" => Some(slog::Level::Error),
        "warning" => Some(slog::Level::Warning),
        "info" => Some(slog::Level::Info),
        "debug" => Some(slog::Level::Debug),
        "trace" => Some(slog::Level::Trace),
        _ => None,
    }
}

/// Root logger with two sinks: the log file at the configured level and
/// stderr for errors (or everything with `-v`). Rotation of the file is left
/// to the platform's logrotate.
fn setup_logging(opt: &Opt) -> anyhow::Result<slog::Logger> {
    let file_level = parse_level(&opt.loglevel)
        .ok_or_else(|| anyhow::anyhow!("Unknown log level '{}'", opt.loglevel))?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&opt.logfile)?;

    let file_decorator = slog_term::PlainDecorator::new(log_file);
    let file_drain = slog_term::FullFormat::new(file_decorator).build().fuse();
    let file_drain = slog::LevelFilter::new(file_drain, file_level).fuse();

    let term_decorator = slog_term::PlainDecorator::new(std::io::stderr());
    let term_drain = slog_term::CompactFormat::new(term_decorator).build().fuse();
    let term_level = if opt.verbose {
        slog::Level::Debug
    } else {
        slog::Level::Error
    };
    let term_drain = slog::LevelFilter::new(term_drain, term_level).fuse();

    let drain = slog::Duplicate::new(file_drain, term_drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Ok(slog::Logger::root(
        drain,
        slog::o!("build" => GIT_VERSION, "pkg-version" => env!("CARGO_PKG_VERSION")),
    ))
}

fn load_config(path: &std::path::Path) -> anyhow::Result<config::Internal> {
    let config_string = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let parsed_version: config::Version = serde_yaml::from_str(&config_string)
        .map_err(|e| anyhow::anyhow!("Failed to extract version from config file: {}", e))?;
    match parsed_version.version.unwrap_or(1) {
        1 => {
            let parsed: config::V1 = serde_yaml::from_str(&config_string)
                .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
            config::Internal::from_v1(parsed)
        }
        other => anyhow::bail!("Unsupported configuration version '{}' specified", other),
    }
}

/// Re-establish the lockdown of this service's own port: every whitelisted
/// address gets an ACCEPT and everything else is dropped. Inserts go to the
/// head of the chain, so the ACCEPTs are issued after the catch-all DROP and
/// end up in front of it.
async fn install_port_guards(
    ipt: &dyn BootstrapBackend,
    config: &config::Internal,
    log: &slog::Logger,
) -> Result<(), iptables::IptablesError> {
    let port = if config.outward_server {
        config.outward_server_port
    } else {
        config.local_server_port
    };
    let port = port.to_string();
    let dport_tag = format!("tcp dpt:{}", port);
    let sport_tag = format!("tcp spt:{}", port);

    slog::info!(log, "Deleting stale control-port rules"; "port" => port.clone());
    let rules = ipt.list().await?;
    for rule in rules.iter().filter(|r| {
        r.target.as_deref() == Some("DROP")
            && r.prot == "tcp"
            && ((r.chain == "INPUT" && r.extra == dport_tag)
                || (r.chain == "OUTPUT" && r.extra == sport_tag))
    }) {
        ipt.apply(Op::Delete, rule).await?;
    }

    slog::info!(log, "Dropping all traffic on the control port"; "port" => port.clone());
    ipt.exe(&["-I", "INPUT", "-p", "tcp", "--dport", port.as_str(), "-j", "DROP"])
        .await?;
    ipt.exe(&["-I", "OUTPUT", "-p", "tcp", "--sport", port.as_str(), "-j", "DROP"])
        .await?;

    slog::info!(log, "Accepting whitelisted addresses on the control port");
    for entry in &config.whitelist {
        let addr = entry.to_string();
        // delete a possibly stale ACCEPT first; absence is fine
        let _ = ipt
            .exe(&[
                "-D", "INPUT", "-p", "tcp", "--dport", port.as_str(), "-s", addr.as_str(), "-j", "ACCEPT",
            ])
            .await;
        let _ = ipt
            .exe(&[
                "-D", "OUTPUT", "-p", "tcp", "--sport", port.as_str(), "-d", addr.as_str(), "-j", "ACCEPT",
            ])
            .await;
        ipt.exe(&[
            "-I", "INPUT", "-p", "tcp", "--dport", port.as_str(), "-s", addr.as_str(), "-j", "ACCEPT",
        ])
        .await?;
        ipt.exe(&[
            "-I", "OUTPUT", "-p", "tcp", "--sport", port.as_str(), "-d", addr.as_str(), "-j", "ACCEPT",
        ])
        .await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let root_log = match setup_logging(&opt) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            std::process::exit(1);
        }
    };

    slog::info!(root_log, "Arguments {:?}", opt);

    let config = match load_config(&opt.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            slog::crit!(root_log, "{}", e);
            std::process::exit(1);
        }
    };
    slog::debug!(root_log, "Parsed config {:?}", config);

    let registry: SharedRegistry = Arc::new(Mutex::new(Registry::with_builtins()));
    let ipt = Arc::new(Iptables::new(
        &config.iptables_path,
        Arc::clone(&registry),
        root_log.new(slog::o!("subsystem" => "iptables")),
    ));

    // Most common startup problems get a direct message instead of a failing
    // worker later on.
    if let Err(e) = ipt.verify_install().await {
        slog::crit!(
            root_log,
            "Could not run {}. Check if iptables is correctly installed and the path is correct: {}",
            config.iptables_path,
            e
        );
        std::process::exit(1);
    }
    if let Err(e) = ipt.verify_permission().await {
        slog::crit!(
            root_log,
            "No sufficient permission to run {}. You must be root: {}",
            config.iptables_path,
            e
        );
        std::process::exit(1);
    }

    if let Err(e) = Iptables::load_chains(&ipt).await {
        slog::crit!(root_log, "Failed to read chains from iptables: {}", e);
        std::process::exit(1);
    }

    slog::info!(root_log, "Starting rufw server");
    slog::info!(root_log, "Whitelisted addresses that will be ignored:");
    for entry in &config.whitelist {
        slog::info!(root_log, "    {}", entry);
    }

    if let Err(e) = install_port_guards(ipt.as_ref(), &config, &root_log).await {
        slog::crit!(root_log, "Failed to install control-port rules: {}", e);
        std::process::exit(1);
    }

    let command_worker = CommandWorker::new(
        Arc::clone(&ipt) as Arc<dyn iptables::RuleBackend>,
        Arc::clone(&registry),
        config.default_expire,
        root_log.new(slog::o!("worker" => "command")),
    );

    let server_context = Arc::new(server::ServerContext {
        cmd_channel: command_worker.clone_input_channel(),
        driver: Arc::clone(&ipt),
        registry,
        config: Arc::clone(&config),
        log: root_log.new(slog::o!("subsystem" => "http")),
    });

    if config.outward_server {
        let acceptor = match server::tls_acceptor(
            &config.outward_server_certfile,
            &config.outward_server_keyfile,
        ) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                slog::crit!(root_log, "Failed to load TLS material: {}", e);
                std::process::exit(1);
            }
        };
        let addr = (config.outward_server_ip, config.outward_server_port);
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                slog::crit!(root_log, "Failed to bind {}:{}: {}", addr.0, addr.1, e);
                std::process::exit(1);
            }
        };
        let ctx = Arc::clone(&server_context);
        let log = root_log.clone();
        tokio::task::spawn(async move {
            if let Err(e) = server::run_outward(ctx, listener, acceptor).await {
                slog::error!(log, "Outward server stopped"; "error" => e.to_string());
            }
        });
    }

    if config.local_server {
        let addr = ("127.0.0.1", config.local_server_port);
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                slog::crit!(root_log, "Failed to bind {}:{}: {}", addr.0, addr.1, e);
                std::process::exit(1);
            }
        };
        let ctx = Arc::clone(&server_context);
        let log = root_log.clone();
        tokio::task::spawn(async move {
            if let Err(e) = server::run_local(ctx, listener).await {
                slog::error!(log, "Local server stopped"; "error" => e.to_string());
            }
        });
    }

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                slog::crit!(root_log, "Failed to install signal handler: {}", e);
                std::process::exit(1);
            }
        };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    slog::info!(root_log, "Caught termination signal. Exiting");
    // dropping the async drain on return flushes the log sinks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::{IptablesError, Rule};

    #[derive(Default)]
    struct RecordingBackend {
        rules: Vec<Rule>,
        calls: Mutex<Vec<Call>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Exe(Vec<String>),
        Apply(Op, Rule),
    }

    #[async_trait::async_trait]
    impl BootstrapBackend for RecordingBackend {
        async fn list(&self) -> Result<Vec<Rule>, IptablesError> {
            Ok(self.rules.clone())
        }

        async fn exe(&self, args: &[&str]) -> Result<String, IptablesError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Exe(args.iter().map(|s| s.to_string()).collect()));
            Ok(String::new())
        }

        async fn apply(&self, op: Op, rule: &Rule) -> Result<(), IptablesError> {
            self.calls.lock().unwrap().push(Call::Apply(op, rule.clone()));
            Ok(())
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_config(whitelist: &[&str]) -> config::Internal {
        config::Internal {
            iptables_path: "/sbin/iptables".to_string(),
            local_server: true,
            local_server_port: 7390,
            outward_server: false,
            outward_server_ip: std::net::Ipv4Addr::new(0, 0, 0, 0),
            outward_server_port: 7393,
            outward_server_certfile: Default::default(),
            outward_server_keyfile: Default::default(),
            auth_username: String::new(),
            auth_password: String::new(),
            whitelist: whitelist.iter().map(|s| s.parse().unwrap()).collect(),
            default_expire: 0,
            non_restful: false,
        }
    }

    fn stale_drop(chain: &str, extra: &str) -> Rule {
        Rule {
            chain: chain.to_string(),
            target: Some("DROP".to_string()),
            prot: "tcp".to_string(),
            extra: extra.to_string(),
            ..Rule::default()
        }
    }

    fn argv(args: &[&str]) -> Call {
        Call::Exe(args.iter().map(|s| s.to_string()).collect())
    }

    fn is_insert_of(call: &Call, target: &str) -> bool {
        match call {
            Call::Exe(args) => {
                args.first().map(|s| s.as_str()) == Some("-I")
                    && args.last().map(|s| s.as_str()) == Some(target)
            }
            Call::Apply(..) => false,
        }
    }

    #[tokio::test]
    async fn test_port_guards_insert_drop_before_whitelist_accepts() {
        let backend = RecordingBackend {
            rules: vec![
                stale_drop("INPUT", "tcp dpt:7390"),
                stale_drop("OUTPUT", "tcp spt:7390"),
                // unrelated rule that must be left alone
                Rule {
                    chain: "INPUT".to_string(),
                    target: Some("ACCEPT".to_string()),
                    source: "9.9.9.9".to_string(),
                    ..Rule::default()
                },
            ],
            ..Default::default()
        };
        let config = test_config(&["127.0.0.1", "10.0.0.0/8"]);
        install_port_guards(&backend, &config, &test_logger())
            .await
            .unwrap();

        let calls = backend.calls.lock().unwrap();
        // the stale per-port DROPs go first, nothing else is deleted by rule
        assert_eq!(
            calls[0],
            Call::Apply(Op::Delete, stale_drop("INPUT", "tcp dpt:7390"))
        );
        assert_eq!(
            calls[1],
            Call::Apply(Op::Delete, stale_drop("OUTPUT", "tcp spt:7390"))
        );
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, Call::Apply(..)))
                .count(),
            2
        );

        // then the catch-all DROPs
        assert_eq!(
            calls[2],
            argv(&["-I", "INPUT", "-p", "tcp", "--dport", "7390", "-j", "DROP"])
        );
        assert_eq!(
            calls[3],
            argv(&["-I", "OUTPUT", "-p", "tcp", "--sport", "7390", "-j", "DROP"])
        );

        // every whitelist ACCEPT is inserted after the DROPs, so with head
        // insertion the ACCEPTs all precede the DROP in the chain
        let last_drop = calls.iter().rposition(|c| is_insert_of(c, "DROP")).unwrap();
        let first_accept = calls.iter().position(|c| is_insert_of(c, "ACCEPT")).unwrap();
        assert!(last_drop < first_accept);
        assert_eq!(calls.iter().filter(|c| is_insert_of(c, "DROP")).count(), 2);
        assert_eq!(calls.iter().filter(|c| is_insert_of(c, "ACCEPT")).count(), 4);
        assert!(calls.contains(&argv(&[
            "-I",
            "INPUT",
            "-p",
            "tcp",
            "--dport",
            "7390",
            "-s",
            "127.0.0.1/32",
            "-j",
            "ACCEPT",
        ])));
        assert!(calls.contains(&argv(&[
            "-I",
            "OUTPUT",
            "-p",
            "tcp",
            "--sport",
            "7390",
            "-d",
            "10.0.0.0/8",
            "-j",
            "ACCEPT",
        ])));
    }

    #[tokio::test]
    async fn test_port_guards_use_outward_port_when_enabled() {
        let backend = RecordingBackend::default();
        let mut config = test_config(&[]);
        config.outward_server = true;
        install_port_guards(&backend, &config, &test_logger())
            .await
            .unwrap();

        let calls = backend.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            argv(&["-I", "INPUT", "-p", "tcp", "--dport", "7393", "-j", "DROP"])
        );
        assert_eq!(
            calls[1],
            argv(&["-I", "OUTPUT", "-p", "tcp", "--sport", "7393", "-j", "DROP"])
        );
        assert_eq!(calls.len(), 2);
    }
}
