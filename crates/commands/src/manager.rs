use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use storage::{keys, Store};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use types::{
    wire::{AckStatus, CmdAckMsg, CmdReqMsg, CmdResMsg, ResultStatus},
    Command, CommandStatus, DeviceId, Expectation,
};

use crate::error::{CommandError, CommandResult};

/// Outbound seam so the manager can be driven without a broker.
#[async_trait]
pub trait RequestPublisher: Send + Sync {
    async fn publish_request(&self, topic: &str, msg: &CmdReqMsg) -> Result<(), String>;
}

#[async_trait]
impl RequestPublisher for transport::Publisher {
    async fn publish_request(&self, topic: &str, msg: &CmdReqMsg) -> Result<(), String> {
        self.publish_json(topic, msg).await.map_err(|e| e.to_string())
    }
}

struct Waiter {
    notify: Option<oneshot::Sender<Command>>,
}

/// Issues commands, correlates acks/results by id, enforces timeouts and
/// the monotonic status machine. Correlation entries are removed only
/// after the command reaches a terminal state.
pub struct CommandManager {
    store: Store,
    publisher: Arc<dyn RequestPublisher>,
    pending: Arc<Mutex<HashMap<String, Waiter>>>,
}

impl CommandManager {
    pub fn new(store: Store, publisher: Arc<dyn RequestPublisher>) -> Self {
        Self {
            store,
            publisher,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, id: &str) -> CommandResult<Command> {
        self.store
            .get_json::<Command>(&keys::command(id))?
            .ok_or_else(|| CommandError::UnknownCommand(id.to_string()))
    }

    pub fn list(&self) -> Vec<Command> {
        self.store
            .iterate_prefix(keys::COMMAND_PREFIX)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect()
    }

    /// Create a command record without sending it (used by changesets).
    pub fn prepare(
        &self,
        device: DeviceId,
        operation: &str,
        args: Value,
        timeout_ms: u64,
        expect: Expectation,
    ) -> CommandResult<Command> {
        let command = Command::new(device, operation, args, timeout_ms, expect);
        self.store.put_json(command.storage_key(), &command)?;
        Ok(command)
    }

    /// Issue a command and wait for its terminal state as selected by
    /// `expect`.
    pub async fn send(
        &self,
        device: DeviceId,
        operation: &str,
        args: Value,
        timeout_ms: u64,
        expect: Expectation,
    ) -> CommandResult<Command> {
        let command = self.prepare(device, operation, args, timeout_ms, expect)?;
        self.dispatch(command.id.clone()).await
    }

    /// Publish a prepared command and wait for its terminal state.
    pub async fn dispatch(&self, id: String) -> CommandResult<Command> {
        let command = self.get(&id)?;
        let topic = format!(
            "rtk/v1/{}/{}/{}/cmd/req",
            command.device_id.tenant, command.device_id.site, command.device_id.mac
        );
        let req = CmdReqMsg {
            schema: format!("cmd.{}/1.0", command.operation),
            ts: types::now_ms(),
            id: command.id.clone(),
            op: command.operation.clone(),
            args: command.args.clone(),
            timeout_ms: command.timeout_ms,
            expect: command.expect,
        };

        if let Err(e) = self.publisher.publish_request(&topic, &req).await {
            let failed = self.transition(&id, CommandStatus::Failed, |c| {
                c.error = Some(format!("publish failed: {e}"));
                c.completed_at = Some(types::now_ms());
            })?;
            return Ok(failed);
        }

        let sent = self.transition(&id, CommandStatus::Sent, |c| {
            c.sent_at = Some(types::now_ms());
        })?;

        // `none` settles on publish.
        if command.expect == Expectation::None {
            return self.transition(&id, CommandStatus::Completed, |c| {
                c.completed_at = Some(types::now_ms());
            });
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id.clone(), Waiter { notify: Some(tx) });
        self.spawn_timeout(id.clone(), Duration::from_millis(command.timeout_ms));

        // The response may have raced ahead of waiter registration; if the
        // command is already terminal, settle immediately.
        if let Ok(current) = self.get(&id) {
            if current.status.is_terminal() {
                self.pending.lock().await.remove(&id);
                return Ok(current);
            }
        }

        match rx.await {
            Ok(final_command) => Ok(final_command),
            // The waiter was dropped without firing; read the record.
            Err(_) => Ok(self.get(&id).unwrap_or(sent)),
        }
    }

    fn spawn_timeout(&self, id: String, after: Duration) {
        let store = self.store.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let manager = CommandTimeoutView { store, pending };
            manager.fire(&id).await;
        });
    }

    /// Correlated ack from the device.
    pub async fn handle_ack(&self, msg: &CmdAckMsg) -> CommandResult<()> {
        let Ok(command) = self.get(&msg.id) else {
            debug!("ack for unknown command {}", msg.id);
            return Ok(());
        };
        if command.status.is_terminal() {
            return Ok(());
        }

        let expect = command.expect;
        match msg.status {
            AckStatus::Accepted => {
                if expect == Expectation::Ack {
                    let done = self.transition(&msg.id, CommandStatus::Completed, |c| {
                        c.completed_at = Some(types::now_ms());
                    })?;
                    self.settle(&msg.id, done).await;
                } else {
                    self.transition(&msg.id, CommandStatus::Accepted, |_| {})?;
                }
            }
            AckStatus::Rejected => {
                // A rejected ack terminates as `failed` carrying the
                // reject reason.
                let reason = msg.reason.clone().unwrap_or_else(|| "rejected".to_string());
                let done = self.transition(&msg.id, CommandStatus::Failed, |c| {
                    c.error = Some(reason);
                    c.completed_at = Some(types::now_ms());
                })?;
                self.settle(&msg.id, done).await;
            }
        }
        Ok(())
    }

    /// Correlated result from the device.
    pub async fn handle_result(&self, msg: &CmdResMsg) -> CommandResult<()> {
        let Ok(command) = self.get(&msg.id) else {
            debug!("result for unknown command {}", msg.id);
            return Ok(());
        };
        if command.status.is_terminal() {
            return Ok(());
        }

        let next = match msg.status {
            ResultStatus::Completed => CommandStatus::Completed,
            ResultStatus::Failed => CommandStatus::Failed,
            ResultStatus::Timeout => CommandStatus::Timeout,
        };
        let done = self.transition(&msg.id, next, |c| {
            c.result = msg.result.clone();
            c.error = msg.error.clone();
            c.completed_at = Some(types::now_ms());
        })?;
        self.settle(&msg.id, done).await;
        Ok(())
    }

    /// Cancel a non-terminal command.
    pub async fn cancel(&self, id: &str) -> CommandResult<Command> {
        let done = self.transition(id, CommandStatus::Cancelled, |c| {
            c.completed_at = Some(types::now_ms());
        })?;
        self.settle(id, done.clone()).await;
        Ok(done)
    }

    async fn settle(&self, id: &str, command: Command) {
        if let Some(mut waiter) = self.pending.lock().await.remove(id) {
            if let Some(tx) = waiter.notify.take() {
                let _ = tx.send(command);
            }
        }
    }

    /// Apply a monotonic transition. Terminal states are never rewritten.
    fn transition(
        &self,
        id: &str,
        next: CommandStatus,
        mutate: impl FnOnce(&mut Command),
    ) -> CommandResult<Command> {
        let key = keys::command(id);
        let mut command = self
            .store
            .get_json::<Command>(&key)?
            .ok_or_else(|| CommandError::UnknownCommand(id.to_string()))?;

        if command.status.is_terminal() {
            return Err(CommandError::AlreadyTerminal {
                id: id.to_string(),
                status: command.status,
            });
        }
        if !command.status.can_transition_to(next) {
            return Err(CommandError::IllegalTransition {
                id: id.to_string(),
                from: command.status,
                to: next,
            });
        }

        command.status = next;
        mutate(&mut command);
        self.store.put_json(key, &command)?;
        Ok(command)
    }
}

/// The slice of manager state a timeout timer needs.
struct CommandTimeoutView {
    store: Store,
    pending: Arc<Mutex<HashMap<String, Waiter>>>,
}

impl CommandTimeoutView {
    async fn fire(&self, id: &str) {
        let key = keys::command(id);
        let Ok(Some(mut command)) = self.store.get_json::<Command>(&key) else {
            return;
        };
        if command.status.is_terminal() {
            return;
        }
        if !command.status.can_transition_to(CommandStatus::Timeout) {
            return;
        }
        command.status = CommandStatus::Timeout;
        command.error = Some(format!("no response within {} ms", command.timeout_ms));
        command.completed_at = Some(types::now_ms());
        if let Err(e) = self.store.put_json(key, &command) {
            warn!("failed to persist timeout for {id}: {e}");
            return;
        }
        if let Some(mut waiter) = self.pending.lock().await.remove(id) {
            if let Some(tx) = waiter.notify.take() {
                let _ = tx.send(command);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records published requests; optionally auto-responds.
    pub(crate) struct FakePublisher {
        pub published: StdMutex<Vec<(String, CmdReqMsg)>>,
        pub fail: bool,
    }

    impl FakePublisher {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                published: StdMutex::new(Vec::new()),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl RequestPublisher for FakePublisher {
        async fn publish_request(&self, topic: &str, msg: &CmdReqMsg) -> Result<(), String> {
            if self.fail {
                return Err("broker unavailable".into());
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), msg.clone()));
            Ok(())
        }
    }

    fn device() -> DeviceId {
        DeviceId::new("home", "main", "r1r1r1r1r1r1")
    }

    #[tokio::test]
    async fn expect_none_completes_on_publish() {
        let manager = CommandManager::new(Store::new(), FakePublisher::new());
        let done = manager
            .send(device(), "reboot", Value::Null, 5_000, Expectation::None)
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Completed);
        assert!(done.sent_at.is_some());
    }

    #[tokio::test]
    async fn round_trip_ack_then_result() {
        let publisher = FakePublisher::new();
        let manager = Arc::new(CommandManager::new(Store::new(), publisher.clone()));

        let mgr = manager.clone();
        let send = tokio::spawn(async move {
            mgr.send(
                device(),
                "speed_test",
                serde_json::json!({}),
                5_000,
                Expectation::Result,
            )
            .await
        });

        // Wait for the request to be published, then play the device.
        let id = loop {
            if let Some((topic, req)) = publisher.published.lock().unwrap().first().cloned() {
                assert_eq!(topic, "rtk/v1/home/main/r1r1r1r1r1r1/cmd/req");
                assert_eq!(req.op, "speed_test");
                break req.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        manager
            .handle_ack(&CmdAckMsg {
                schema: "cmd.ack/1.0".into(),
                ts: types::now_ms(),
                id: id.clone(),
                status: AckStatus::Accepted,
                reason: None,
            })
            .await
            .unwrap();
        assert_eq!(manager.get(&id).unwrap().status, CommandStatus::Accepted);

        manager
            .handle_result(&CmdResMsg {
                schema: "cmd.speed_test.result/1.0".into(),
                ts: types::now_ms(),
                id: id.clone(),
                status: ResultStatus::Completed,
                result: Some(serde_json::json!({"download_mbps": 85.2, "upload_mbps": 12.4})),
                error: None,
            })
            .await
            .unwrap();

        let done = send.await.unwrap().unwrap();
        assert_eq!(done.status, CommandStatus::Completed);
        assert_eq!(done.result.unwrap()["download_mbps"], 85.2);
    }

    #[tokio::test]
    async fn expect_ack_settles_on_accept() {
        let publisher = FakePublisher::new();
        let manager = Arc::new(CommandManager::new(Store::new(), publisher.clone()));

        let mgr = manager.clone();
        let send = tokio::spawn(async move {
            mgr.send(device(), "set_channel", serde_json::json!({"channel": 6}), 5_000, Expectation::Ack)
                .await
        });
        let id = loop {
            if let Some((_, req)) = publisher.published.lock().unwrap().first().cloned() {
                break req.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        manager
            .handle_ack(&CmdAckMsg {
                schema: "cmd.ack/1.0".into(),
                ts: types::now_ms(),
                id,
                status: AckStatus::Accepted,
                reason: None,
            })
            .await
            .unwrap();

        assert_eq!(send.await.unwrap().unwrap().status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn timeout_fires_without_response() {
        let manager = CommandManager::new(Store::new(), FakePublisher::new());
        let done = manager
            .send(device(), "speed_test", Value::Null, 50, Expectation::Result)
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Timeout);
        assert!(done.error.is_some());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_state_is_never_rewritten() {
        let publisher = FakePublisher::new();
        let manager = Arc::new(CommandManager::new(Store::new(), publisher.clone()));
        let done = manager
            .send(device(), "reboot", Value::Null, 50, Expectation::Result)
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Timeout);

        // A late result must not resurrect the command.
        manager
            .handle_result(&CmdResMsg {
                schema: "cmd.reboot.result/1.0".into(),
                ts: types::now_ms(),
                id: done.id.clone(),
                status: ResultStatus::Completed,
                result: None,
                error: None,
            })
            .await
            .unwrap();
        assert_eq!(manager.get(&done.id).unwrap().status, CommandStatus::Timeout);
    }

    #[tokio::test]
    async fn rejected_ack_fails_command() {
        let publisher = FakePublisher::new();
        let manager = Arc::new(CommandManager::new(Store::new(), publisher.clone()));

        let mgr = manager.clone();
        let send = tokio::spawn(async move {
            mgr.send(device(), "configure_wifi", Value::Null, 5_000, Expectation::Result)
                .await
        });
        let id = loop {
            if let Some((_, req)) = publisher.published.lock().unwrap().first().cloned() {
                break req.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        manager
            .handle_ack(&CmdAckMsg {
                schema: "cmd.ack/1.0".into(),
                ts: types::now_ms(),
                id,
                status: AckStatus::Rejected,
                reason: Some("unsupported".into()),
            })
            .await
            .unwrap();

        let done = send.await.unwrap().unwrap();
        assert_eq!(done.status, CommandStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("unsupported"));
    }
}
