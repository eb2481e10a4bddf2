use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::cmdparse::Directives;
use crate::iptables::Rule;

/// Polling interval of the expiry queue; this is the time resolution of the
/// `expire` directive.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug)]
pub struct ExpiryRequest {
    pub rule: Rule,
    pub expire_secs: u64,
}

// Heap entry ordered by deadline; the soonest deadline must surface first,
// so entries compare reversed for the max-heap.
#[derive(Debug)]
struct ExpiryEntry {
    deadline: tokio::time::Instant,
    expire_secs: u64,
    rule: Rule,
}

impl PartialEq for ExpiryEntry {
    fn eq(&self, other: &ExpiryEntry) -> bool {
        self.deadline == other.deadline && self.expire_secs == other.expire_secs
    }
}

impl Eq for ExpiryEntry {}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &ExpiryEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &ExpiryEntry) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.expire_secs.cmp(&self.expire_secs))
    }
}

/// Single consumer of the expiry queue. Receives scheduling requests from
/// the command worker, keeps them ordered by deadline, and re-injects a
/// delete command for every rule whose deadline has passed.
#[derive(Debug)]
pub struct ExpiryWorker {
    dispatch_channel: tokio::sync::mpsc::Sender<ExpiryRequest>,
}

impl ExpiryWorker {
    pub fn new(
        cmd_channel: tokio::sync::mpsc::Sender<crate::enforcer::CommandMessage>,
        log: slog::Logger,
    ) -> ExpiryWorker {
        let (sender, receiver) = tokio::sync::mpsc::channel(crate::enforcer::QUEUE_DEPTH);
        tokio::task::spawn(async move {
            expiry_worker(receiver, cmd_channel, log).await;
        });
        ExpiryWorker {
            dispatch_channel: sender,
        }
    }

    pub fn clone_input_channel(&self) -> tokio::sync::mpsc::Sender<ExpiryRequest> {
        self.dispatch_channel.clone()
    }
}

async fn expiry_worker(
    mut chan: tokio::sync::mpsc::Receiver<ExpiryRequest>,
    cmd_channel: tokio::sync::mpsc::Sender<crate::enforcer::CommandMessage>,
    log: slog::Logger,
) -> () {
    let mut queue: BinaryHeap<ExpiryEntry> = BinaryHeap::new();
    let mut timer = tokio::time::interval_at(
        tokio::time::Instant::now() + POLL_INTERVAL,
        POLL_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = timer.tick() => {
                let now = tokio::time::Instant::now();
                while queue.peek().map_or(false, |entry| entry.deadline <= now) {
                    let entry = queue.pop().unwrap();
                    slog::debug!(log, "Rule expired, requesting delete";
                                 "rule" => format!("{:?}", entry.rule),
                                 "expire" => entry.expire_secs);
                    let message = crate::enforcer::CommandMessage {
                        modify: crate::enforcer::Modify::Delete,
                        rule: entry.rule,
                        directives: Directives::default(),
                    };
                    if cmd_channel.send(message).await.is_err() {
                        slog::error!(log, "Command queue closed, dropping expiry");
                        return;
                    }
                }
            }
            request = chan.recv() => {
                let request = match request {
                    Some(request) => request,
                    None => break,
                };
                queue.push(ExpiryEntry {
                    deadline: tokio::time::Instant::now()
                        + std::time::Duration::from_secs(request.expire_secs),
                    expire_secs: request.expire_secs,
                    rule: request.rule,
                });
                slog::debug!(log, "Scheduled expiry"; "queued" => queue.len());
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::Modify;
    use crate::iptables::Rule;
    use std::time::Duration;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn drop_rule(source: &str) -> Rule {
        Rule {
            chain: "INPUT".to_string(),
            target: Some("DROP".to_string()),
            source: source.to_string(),
            ..Rule::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_rule_is_reissued_as_delete() {
        let (cmd_sender, mut cmd_receiver) = tokio::sync::mpsc::channel(16);
        let worker = ExpiryWorker::new(cmd_sender, test_logger());
        worker
            .clone_input_channel()
            .send(ExpiryRequest {
                rule: drop_rule("5.6.7.8"),
                expire_secs: 3,
            })
            .await
            .unwrap();

        // nothing is due before the deadline
        let early = tokio::time::timeout(Duration::from_secs(2), cmd_receiver.recv()).await;
        assert!(early.is_err());

        let message = tokio::time::timeout(Duration::from_secs(3), cmd_receiver.recv())
            .await
            .expect("expiry did not fire within poll resolution")
            .expect("worker hung up");
        assert_eq!(message.modify, Modify::Delete);
        assert_eq!(message.rule, drop_rule("5.6.7.8"));
        assert_eq!(message.directives, Directives::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_fire_in_deadline_order() {
        let (cmd_sender, mut cmd_receiver) = tokio::sync::mpsc::channel(16);
        let worker = ExpiryWorker::new(cmd_sender, test_logger());
        let input = worker.clone_input_channel();
        input
            .send(ExpiryRequest {
                rule: drop_rule("2.2.2.2"),
                expire_secs: 5,
            })
            .await
            .unwrap();
        input
            .send(ExpiryRequest {
                rule: drop_rule("1.1.1.1"),
                expire_secs: 2,
            })
            .await
            .unwrap();

        let first = cmd_receiver.recv().await.unwrap();
        assert_eq!(first.rule.source, "1.1.1.1");
        let second = cmd_receiver.recv().await.unwrap();
        assert_eq!(second.rule.source, "2.2.2.2");
    }
}
