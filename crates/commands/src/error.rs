use thiserror::Error;
use types::CommandStatus;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown changeset: {0}")]
    UnknownChangeset(String),

    #[error("command {id} is already terminal in state {status}")]
    AlreadyTerminal { id: String, status: CommandStatus },

    #[error("illegal transition {from} -> {to} for command {id}")]
    IllegalTransition {
        id: String,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("changeset {0} cannot be executed in its current state")]
    NotExecutable(String),

    #[error("changeset {0} has not been executed; nothing to roll back")]
    RollbackWithoutExecute(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;
