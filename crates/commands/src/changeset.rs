use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use storage::{keys, Store};
use tracing::{info, warn};
use types::{Changeset, ChangesetStatus, CommandStatus, DeviceId, Expectation, StepResult};

use crate::error::{CommandError, CommandResult};
use crate::manager::CommandManager;

/// Operations whose effect can be undone by re-issuing the operation with
/// the value captured before execution.
const REVERSIBLE_OPS: &[&str] = &["configure_wifi", "set_channel", "set_tx_power"];

/// Provides the pre-execute value for a reversible operation, typically
/// by reading the device model.
#[async_trait]
pub trait PriorValueSource: Send + Sync {
    async fn capture(&self, device: &DeviceId, operation: &str, args: &Value) -> Option<Value>;
}

/// A source that never captures anything; rollback then only covers
/// commands whose prior value was recorded elsewhere.
pub struct NoPriorValues;

#[async_trait]
impl PriorValueSource for NoPriorValues {
    async fn capture(&self, _device: &DeviceId, _operation: &str, _args: &Value) -> Option<Value> {
        None
    }
}

/// Groups commands and executes them as a unit with rollback semantics.
/// Commands are owned by the `CommandManager`; the changeset holds ids.
pub struct ChangesetManager {
    store: Store,
    commands: Arc<CommandManager>,
    priors: Arc<dyn PriorValueSource>,
}

impl ChangesetManager {
    pub fn new(
        store: Store,
        commands: Arc<CommandManager>,
        priors: Arc<dyn PriorValueSource>,
    ) -> Self {
        Self {
            store,
            commands,
            priors,
        }
    }

    pub fn create(&self, description: &str, parallel: bool) -> CommandResult<Changeset> {
        let mut changeset = Changeset::new(description);
        changeset.parallel = parallel;
        self.persist(&changeset)?;
        Ok(changeset)
    }

    pub fn get(&self, id: &str) -> CommandResult<Changeset> {
        self.store
            .get_json::<Changeset>(&keys::changeset(id))?
            .ok_or_else(|| CommandError::UnknownChangeset(id.to_string()))
    }

    pub fn list(&self) -> Vec<Changeset> {
        self.store
            .iterate_prefix(keys::CHANGESET_PREFIX)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect()
    }

    /// Add a command to a draft. The command record is created now
    /// (status `pending`) and published at execute time.
    pub fn add_command(
        &self,
        changeset_id: &str,
        device: DeviceId,
        operation: &str,
        args: Value,
        timeout_ms: u64,
        expect: Expectation,
    ) -> CommandResult<String> {
        let mut changeset = self.get(changeset_id)?;
        if changeset.status != ChangesetStatus::Draft {
            return Err(CommandError::NotExecutable(changeset_id.to_string()));
        }
        let command = self
            .commands
            .prepare(device, operation, args, timeout_ms, expect)?;
        changeset.commands.push(command.id.clone());
        self.persist(&changeset)?;
        Ok(command.id)
    }

    /// Execute a draft. Idempotent: a second call on a completed changeset
    /// is a no-op returning the recorded outcome.
    pub async fn execute(&self, id: &str) -> CommandResult<Changeset> {
        let mut changeset = self.get(id)?;
        match changeset.status {
            ChangesetStatus::Draft => {}
            ChangesetStatus::Completed => return Ok(changeset),
            _ => return Err(CommandError::NotExecutable(id.to_string())),
        }

        // Capture pre-execute values for reversible operations before any
        // command runs.
        let mut captured: HashMap<String, Value> = HashMap::new();
        for command_id in &changeset.commands {
            let command = self.commands.get(command_id)?;
            if REVERSIBLE_OPS.contains(&command.operation.as_str()) {
                if let Some(prior) = self
                    .priors
                    .capture(&command.device_id, &command.operation, &command.args)
                    .await
                {
                    captured.insert(command_id.clone(), prior);
                }
            }
        }
        self.store.put_json(prior_key(id), &captured)?;

        changeset.status = ChangesetStatus::Executing;
        changeset.executed_at = Some(types::now_ms());
        self.persist(&changeset)?;

        let results = if changeset.parallel {
            let futs = changeset
                .commands
                .iter()
                .map(|cid| self.run_step(cid.clone()));
            join_all(futs).await
        } else {
            let mut out = Vec::with_capacity(changeset.commands.len());
            for cid in &changeset.commands {
                out.push(self.run_step(cid.clone()).await);
            }
            out
        };

        let all_ok = results.iter().all(|r| r.success);
        changeset.results = results;
        changeset.status = if all_ok {
            ChangesetStatus::Completed
        } else {
            ChangesetStatus::Failed
        };
        self.persist(&changeset)?;
        info!(
            "changeset {id} finished: {} ({} steps)",
            changeset.status,
            changeset.results.len()
        );
        Ok(changeset)
    }

    async fn run_step(&self, command_id: String) -> StepResult {
        match self.commands.dispatch(command_id.clone()).await {
            Ok(command) if command.status == CommandStatus::Completed => StepResult {
                command_id,
                success: true,
                error: None,
            },
            Ok(command) => StepResult {
                command_id,
                success: false,
                error: command
                    .error
                    .or_else(|| Some(format!("terminal state {}", command.status))),
            },
            Err(e) => StepResult {
                command_id,
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Roll back an executed changeset by issuing inverse commands, in
    /// reverse order, for every step whose prior value was captured.
    pub async fn rollback(&self, id: &str) -> CommandResult<Changeset> {
        let mut changeset = self.get(id)?;
        if changeset.executed_at.is_none() {
            return Err(CommandError::RollbackWithoutExecute(id.to_string()));
        }
        if changeset.status == ChangesetStatus::RolledBack {
            return Ok(changeset);
        }

        let captured: HashMap<String, Value> = self
            .store
            .get_json(&prior_key(id))?
            .unwrap_or_default();

        for command_id in changeset.commands.iter().rev() {
            let Some(prior) = captured.get(command_id) else {
                continue;
            };
            let command = self.commands.get(command_id)?;
            let result = self
                .commands
                .send(
                    command.device_id.clone(),
                    &command.operation,
                    prior.clone(),
                    command.timeout_ms,
                    command.expect,
                )
                .await;
            if let Err(e) = result {
                warn!("rollback step for {command_id} failed: {e}");
            }
        }

        changeset.status = ChangesetStatus::RolledBack;
        changeset.rolled_back_at = Some(types::now_ms());
        self.persist(&changeset)?;
        Ok(changeset)
    }

    fn persist(&self, changeset: &Changeset) -> CommandResult<()> {
        self.store.put_json(changeset.storage_key(), changeset)?;
        Ok(())
    }
}

fn prior_key(changeset_id: &str) -> String {
    format!("changeset_prior:{changeset_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::FakePublisher;

    struct FixedPriors(Value);

    #[async_trait]
    impl PriorValueSource for FixedPriors {
        async fn capture(&self, _d: &DeviceId, _op: &str, _args: &Value) -> Option<Value> {
            Some(self.0.clone())
        }
    }

    fn device() -> DeviceId {
        DeviceId::new("home", "main", "r1r1r1r1r1r1")
    }

    fn managers() -> (Arc<FakePublisher>, Arc<CommandManager>, ChangesetManager) {
        let store = Store::new();
        let publisher = FakePublisher::new();
        let commands = Arc::new(CommandManager::new(store.clone(), publisher.clone()));
        let changesets = ChangesetManager::new(
            store,
            commands.clone(),
            Arc::new(FixedPriors(serde_json::json!({"channel": 1}))),
        );
        (publisher, commands, changesets)
    }

    #[tokio::test]
    async fn execute_runs_all_steps_and_completes() {
        let (publisher, _, changesets) = managers();
        let cs = changesets.create("channel shuffle", false).unwrap();
        for ch in [6, 11] {
            changesets
                .add_command(
                    &cs.id,
                    device(),
                    "set_channel",
                    serde_json::json!({"channel": ch}),
                    1_000,
                    Expectation::None,
                )
                .unwrap();
        }

        let done = changesets.execute(&cs.id).await.unwrap();
        assert_eq!(done.status, ChangesetStatus::Completed);
        assert_eq!(done.results.len(), 2);
        assert!(done.results.iter().all(|r| r.success));
        assert_eq!(publisher.published.lock().unwrap().len(), 2);

        // Idempotent: a second execute publishes nothing new.
        let again = changesets.execute(&cs.id).await.unwrap();
        assert_eq!(again.status, ChangesetStatus::Completed);
        assert_eq!(publisher.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rollback_requires_execution() {
        let (_, _, changesets) = managers();
        let cs = changesets.create("untouched", false).unwrap();
        assert!(matches!(
            changesets.rollback(&cs.id).await,
            Err(CommandError::RollbackWithoutExecute(_))
        ));
    }

    #[tokio::test]
    async fn rollback_reissues_prior_values() {
        let (publisher, _, changesets) = managers();
        let cs = changesets.create("wifi change", false).unwrap();
        changesets
            .add_command(
                &cs.id,
                device(),
                "set_channel",
                serde_json::json!({"channel": 11}),
                1_000,
                Expectation::None,
            )
            .unwrap();

        changesets.execute(&cs.id).await.unwrap();
        let rolled = changesets.rollback(&cs.id).await.unwrap();
        assert_eq!(rolled.status, ChangesetStatus::RolledBack);
        assert!(rolled.rolled_back_at.is_some());

        let published = publisher.published.lock().unwrap();
        let last = &published.last().unwrap().1;
        assert_eq!(last.op, "set_channel");
        assert_eq!(last.args, serde_json::json!({"channel": 1}));
    }
}
