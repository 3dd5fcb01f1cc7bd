use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::traits::ArtifactStore;

/// Writes saved node outputs to `{root}/{session_id}/{node}.{extension}`.
///
/// A node that runs several times overwrites its artifact, so the file
/// always holds the latest output.
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session_id: &str, node: &str, extension: &str) -> PathBuf {
        self.root
            .join(file_component(session_id))
            .join(format!("{}.{}", file_component(node), file_component(extension)))
    }
}

/// Replace anything that could escape the artifact directory.
fn file_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

impl ArtifactStore for FileArtifactStore {
    fn write(
        &self,
        session_id: &str,
        node: &str,
        extension: &str,
        content: &str,
    ) -> BoxFuture<'_, Result<String>> {
        let path = self.path_for(session_id, node, extension);
        let content = content.to_string();

        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    AgentGraphError::Artifact(format!("{}: {}", parent.display(), e))
                })?;
            }
            tokio::fs::write(&path, content.as_bytes())
                .await
                .map_err(|e| AgentGraphError::Artifact(format!("{}: {}", path.display(), e)))?;

            debug!(path = %path.display(), bytes = content.len(), "Artifact written");
            Ok(path.display().to_string())
        })
    }
}
