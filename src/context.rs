//! Deployment context handed to the coordinators by the hosting framework.

use std::fmt;

/// Identity and connection secrets of the node source being served.
///
/// The hosting framework owns these values; coordinators receive them
/// explicitly so independent pools can run side by side in one process.
#[derive(Clone, Eq, PartialEq)]
pub struct DeploymentContext {
    /// Display name of the node source (for example `Node source Name`).
    pub node_source_name: String,
    /// Credentials nodes present when they connect back to the master.
    pub administrator_credentials: String,
    /// URL of the master service nodes register with.
    pub master_url: String,
}

impl DeploymentContext {
    /// Creates a context, trimming the name and URL.
    #[must_use]
    pub fn new(
        node_source_name: impl Into<String>,
        administrator_credentials: impl Into<String>,
        master_url: impl Into<String>,
    ) -> Self {
        Self {
            node_source_name: node_source_name.into().trim().to_owned(),
            administrator_credentials: administrator_credentials.into(),
            master_url: master_url.into().trim().to_owned(),
        }
    }

    /// Returns the deployment label derived from the node source name.
    #[must_use]
    pub fn label(&self) -> String {
        deployment_label(&self.node_source_name)
    }
}

impl fmt::Debug for DeploymentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentContext")
            .field("node_source_name", &self.node_source_name)
            .field("administrator_credentials", &"<redacted>")
            .field("master_url", &self.master_url)
            .finish()
    }
}

/// Converts a node source name into the label used for cloud resources:
/// lowercase, with each run of whitespace replaced by `_`.
#[must_use]
pub fn deployment_label(node_source_name: &str) -> String {
    node_source_name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}
