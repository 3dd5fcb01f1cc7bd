//! Persistence backends for agentgraph: a SQLite [`SqliteStore`] for
//! session documents and a [`FileArtifactStore`] for saved node outputs.

pub mod artifacts;
pub mod sqlite;

pub use artifacts::FileArtifactStore;
pub use sqlite::SqliteStore;
