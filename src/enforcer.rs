use std::collections::HashSet;
use std::sync::Arc;

use crate::cmdparse::Directives;
use crate::expiry::{ExpiryRequest, ExpiryWorker};
use crate::iptables::{IptablesError, Op, Rule, RuleBackend, SharedRegistry};

/// Depth of the command queue. Producers use a non-blocking send and treat a
/// full queue as an internal error.
pub const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modify {
    Insert,
    Delete,
    List,
}

#[derive(Debug)]
pub struct CommandMessage {
    pub modify: Modify,
    pub rule: Rule,
    pub directives: Directives,
}

/// Single consumer of the command queue. Deduplicates against an in-memory
/// set of rules this service installed, applies mutations through the
/// backend, and schedules timed deletions. Owning the only consumer is what
/// makes the duplicate-apply check race-free.
#[derive(Debug)]
pub struct CommandWorker {
    dispatch_channel: tokio::sync::mpsc::Sender<CommandMessage>,
}

impl CommandWorker {
    pub fn new(
        backend: Arc<dyn RuleBackend>,
        registry: SharedRegistry,
        default_expire: u64,
        log: slog::Logger,
    ) -> CommandWorker {
        let (sender, receiver) = tokio::sync::mpsc::channel(QUEUE_DEPTH);
        // The expiry worker feeds deletions back into the same queue.
        let expiry = ExpiryWorker::new(sender.clone(), log.new(slog::o!("worker" => "expiry")));
        tokio::task::spawn(async move {
            command_worker(
                receiver,
                backend,
                registry,
                expiry.clone_input_channel(),
                default_expire,
                log,
            )
            .await;
        });
        CommandWorker {
            dispatch_channel: sender,
        }
    }

    pub fn clone_input_channel(&self) -> tokio::sync::mpsc::Sender<CommandMessage> {
        self.dispatch_channel.clone()
    }
}

async fn command_worker(
    mut chan: tokio::sync::mpsc::Receiver<CommandMessage>,
    backend: Arc<dyn RuleBackend>,
    registry: SharedRegistry,
    expiry_channel: tokio::sync::mpsc::Sender<ExpiryRequest>,
    default_expire: u64,
    log: slog::Logger,
) -> () {
    // Pick up user chains created before a restart, then seed the in-memory
    // rule set from the subset of the live table this service manages.
    if let Err(e) = backend.load_chains().await {
        slog::error!(log, "Unable to refresh chain registry"; "error" => e.to_string());
    }
    let mut ruleset: HashSet<Rule> = match backend.read_simple_rules(None).await {
        Ok(rules) => rules.into_iter().filter(|r| r.target.is_some()).collect(),
        Err(e) => {
            slog::error!(log, "Unable to seed rule set from live table"; "error" => e.to_string());
            HashSet::new()
        }
    };
    slog::debug!(log, "Seeded rule set"; "rules" => ruleset.len());

    while let Some(message) = chan.recv().await {
        // A failed application must not kill the worker; the command was
        // already acknowledged to the client.
        if let Err(e) = handle_command(
            message,
            &mut ruleset,
            &backend,
            &registry,
            &expiry_channel,
            default_expire,
            &log,
        )
        .await
        {
            slog::error!(log, "Rule application failed"; "error" => e.to_string());
        }
    }
}

async fn handle_command(
    message: CommandMessage,
    ruleset: &mut HashSet<Rule>,
    backend: &Arc<dyn RuleBackend>,
    registry: &SharedRegistry,
    expiry_channel: &tokio::sync::mpsc::Sender<ExpiryRequest>,
    default_expire: u64,
    log: &slog::Logger,
) -> Result<(), IptablesError> {
    let CommandMessage {
        modify,
        rule,
        directives,
    } = message;

    let is_create = rule.target.as_deref() == Some("CREATE");
    // For chain management the duplicate check is registry membership; a
    // rename checks the name it would introduce.
    let exists = if is_create {
        let name = rule.chain.rsplit(':').next().unwrap_or(&rule.chain);
        registry.lock().unwrap().is_chain(name)
    } else {
        ruleset.contains(&rule)
    };
    slog::debug!(log, "Dequeued command"; "modify" => format!("{:?}", modify),
                 "rule" => format!("{:?}", rule), "exists" => exists);

    match modify {
        Modify::Insert => {
            if exists {
                slog::warn!(log, "Trying to insert existing rule. Command ignored.";
                            "rule" => format!("{:?}", rule));
                return Ok(());
            }
            let op = if is_create {
                if rule.chain.contains(':') {
                    Op::RenameChain
                } else {
                    Op::NewChain
                }
            } else {
                Op::Insert
            };
            backend.apply(op, &rule).await?;
            schedule_expiry(&rule, &directives, default_expire, expiry_channel, log).await;
            if is_create {
                let mut registry = registry.lock().unwrap();
                match rule.chain.split_once(':') {
                    Some((old, new)) => registry.rename_chain(old, new),
                    None => registry.add_chain(&rule.chain),
                }
            } else {
                ruleset.insert(rule);
            }
        }
        Modify::Delete => {
            if !exists {
                slog::warn!(log, "Trying to delete not existing rule. Command ignored.";
                            "rule" => format!("{:?}", rule));
                return Ok(());
            }
            let op = if is_create { Op::DestroyChain } else { Op::Delete };
            backend.apply(op, &rule).await?;
            if is_create {
                let name = rule.chain.rsplit(':').next().unwrap_or(&rule.chain);
                registry.lock().unwrap().remove_chain(name);
            } else {
                ruleset.remove(&rule);
            }
        }
        // Listings are served directly by the front-end.
        Modify::List => {}
    }
    Ok(())
}

/// Hand a freshly inserted rule to the expiry worker. An expiry of zero
/// means the rule is permanent.
async fn schedule_expiry(
    rule: &Rule,
    directives: &Directives,
    default_expire: u64,
    expiry_channel: &tokio::sync::mpsc::Sender<ExpiryRequest>,
    log: &slog::Logger,
) {
    let expire = directives.expire.unwrap_or(default_expire);
    if expire == 0 {
        return;
    }
    let request = ExpiryRequest {
        rule: rule.clone(),
        expire_secs: expire,
    };
    if let Err(e) = expiry_channel.send(request).await {
        slog::error!(log, "Failed to schedule rule expiry"; "error" => e.to_string());
    }
}
