pub mod connection;
pub mod migrations;
pub mod pending;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use pending::PendingStateStore;
pub use repositories::{
    DialogueStateRepository, ExecutionHistoryRepository, InMemoryDialogueStateRepository,
    InMemoryExecutionHistoryRepository, RepositoryError, SqlDialogueStateRepository,
    SqlExecutionHistoryRepository,
};
