//! Bootstrap command construction for node processes.
//!
//! A bootstrap command is rendered from an OS specific template. Templates
//! reference connection values through `${NAME}` placeholders; each value is
//! quoted for the shell that will run it before substitution. Rendering is
//! pure: no I/O, no clock, no randomness.

use std::borrow::Cow;

use shell_escape::unix::escape;
use thiserror::Error;

use crate::acquire::Instance;
use crate::context::DeploymentContext;
use crate::provisioner::OsFamily;

mod template;

pub use template::{TemplateError, resolve_template};

/// Placeholder replaced by the master service URL.
pub const MASTER_URL: &str = "MASTER_URL";
/// Placeholder replaced by the administrator credentials.
pub const CREDENTIALS: &str = "CREDENTIALS";
/// Placeholder replaced by the generated node name.
pub const NODE_NAME: &str = "NODE_NAME";
/// Placeholder replaced by the deployment label.
pub const NODE_SOURCE: &str = "NODE_SOURCE";
/// Placeholder replaced by the provider instance identifier.
pub const INSTANCE_ID: &str = "INSTANCE_ID";
/// Placeholder replaced by the 1-based node index on the instance.
pub const NODE_INDEX: &str = "NODE_INDEX";
/// Placeholder replaced by the URL the node bundle is downloaded from.
pub const NODE_BUNDLE_URL: &str = "NODE_BUNDLE_URL";
/// Placeholder replaced by extra JVM or process properties.
pub const ADDITIONAL_PROPERTIES: &str = "ADDITIONAL_PROPERTIES";

/// Startup script templates, one per OS family.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScriptTemplates {
    /// Template used on Linux instances.
    pub linux: String,
    /// Template used on Windows instances.
    pub windows: String,
}

impl ScriptTemplates {
    /// Creates a template pair.
    #[must_use]
    pub fn new(linux: impl Into<String>, windows: impl Into<String>) -> Self {
        Self {
            linux: linux.into(),
            windows: windows.into(),
        }
    }

    /// Returns the template for `os_family`.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::MissingTemplate`] when that template is blank.
    pub fn select(&self, os_family: OsFamily) -> Result<&str, ScriptError> {
        let template = match os_family {
            OsFamily::Linux => self.linux.as_str(),
            OsFamily::Windows => self.windows.as_str(),
        };
        if template.trim().is_empty() {
            return Err(ScriptError::MissingTemplate { os_family });
        }
        Ok(template)
    }
}

/// Deployment-wide settings shared by every bootstrap command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BootstrapSettings {
    /// Startup script templates.
    pub templates: ScriptTemplates,
    /// URL the node bundle is downloaded from.
    pub node_bundle_url: String,
    /// Extra properties passed to each node process.
    pub additional_properties: String,
}

/// Connection values substituted into the templates.
#[derive(Clone, Eq, PartialEq)]
pub struct ConnectionParams {
    /// URL of the master service.
    pub master_url: String,
    /// Credentials nodes present to the master.
    pub credentials: String,
    /// Deployment label.
    pub node_source: String,
    /// URL the node bundle is downloaded from.
    pub node_bundle_url: String,
    /// Extra properties passed to each node process.
    pub additional_properties: String,
}

impl ConnectionParams {
    /// Combines the deployment context with the bootstrap settings.
    #[must_use]
    pub fn new(context: &DeploymentContext, settings: &BootstrapSettings) -> Self {
        Self {
            master_url: context.master_url.clone(),
            credentials: context.administrator_credentials.clone(),
            node_source: context.label(),
            node_bundle_url: settings.node_bundle_url.clone(),
            additional_properties: settings.additional_properties.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("master_url", &self.master_url)
            .field("credentials", &"<redacted>")
            .field("node_source", &self.node_source)
            .field("node_bundle_url", &self.node_bundle_url)
            .field("additional_properties", &self.additional_properties)
            .finish()
    }
}

/// Command that bootstraps one node on one instance.
#[derive(Clone, Eq, PartialEq)]
pub struct BootstrapCommand {
    /// Name the node will register under.
    pub node_name: String,
    /// 1-based index of the node on its instance.
    pub node_index: u32,
    /// Rendered script.
    pub command: String,
    /// Arguments passed alongside the script.
    pub extra_args: Vec<String>,
}

impl std::fmt::Debug for BootstrapCommand {
    // The rendered command embeds credentials.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapCommand")
            .field("node_name", &self.node_name)
            .field("node_index", &self.node_index)
            .field("extra_args", &self.extra_args)
            .finish_non_exhaustive()
    }
}

/// Errors raised while building bootstrap commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptError {
    /// Raised when the template for the instance OS is blank.
    #[error("no startup script template configured for {os_family} instances")]
    MissingTemplate {
        /// OS family whose template is missing.
        os_family: OsFamily,
    },
    /// Raised when the node index is zero.
    #[error("node index must start at 1")]
    InvalidNodeIndex,
}

/// Returns the name of node `node_index` on `instance_id`.
#[must_use]
pub fn node_name(label: &str, instance_id: &str, node_index: u32) -> String {
    format!("{label}_{instance_id}_{node_index}")
}

/// Recovers the node index from a name produced by [`node_name`], if the name
/// belongs to `instance_id`.
#[must_use]
pub fn node_index_from_name(node_name: &str, instance_id: &str) -> Option<u32> {
    let (head, index) = node_name.rsplit_once('_')?;
    head.strip_suffix(instance_id)?.strip_suffix('_')?;
    index.parse::<u32>().ok().filter(|value| *value >= 1)
}

/// Builds the bootstrap command for node `node_index` on `instance`.
///
/// The template is chosen by the instance OS family and every placeholder
/// value is quoted for that family's shell. Unknown placeholders are left
/// untouched.
///
/// # Errors
///
/// Returns [`ScriptError`] when the template is missing or the index is zero.
pub fn build_command(
    instance: &Instance,
    templates: &ScriptTemplates,
    node_index: u32,
    params: &ConnectionParams,
) -> Result<BootstrapCommand, ScriptError> {
    if node_index == 0 {
        return Err(ScriptError::InvalidNodeIndex);
    }
    let template = templates.select(instance.os_family)?;
    let name = node_name(&params.node_source, &instance.id, node_index);
    let index_text = node_index.to_string();

    let values = [
        (MASTER_URL, params.master_url.as_str()),
        (CREDENTIALS, params.credentials.as_str()),
        (NODE_NAME, name.as_str()),
        (NODE_SOURCE, params.node_source.as_str()),
        (INSTANCE_ID, instance.id.as_str()),
        (NODE_INDEX, index_text.as_str()),
        (NODE_BUNDLE_URL, params.node_bundle_url.as_str()),
        (ADDITIONAL_PROPERTIES, params.additional_properties.as_str()),
    ];
    let command = render(template, instance.os_family, &values);

    Ok(BootstrapCommand {
        extra_args: vec![name.clone(), index_text.clone()],
        node_name: name,
        node_index,
        command,
    })
}

/// Substitutes `${KEY}` placeholders in a single pass so substituted values
/// are never rescanned.
fn render(template: &str, os_family: OsFamily, values: &[(&str, &str)]) -> String {
    let lookup = |key: &str| {
        values
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, value)| *value)
    };
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let (before, candidate) = rest.split_at(start);
        rendered.push_str(before);
        let placeholder = candidate
            .strip_prefix("${")
            .and_then(|tail| tail.split_once('}'));
        match placeholder.and_then(|(key, tail)| lookup(key).map(|value| (value, tail))) {
            Some((value, tail)) => {
                rendered.push_str(&quote(value, os_family));
                rest = tail;
            }
            None => {
                rendered.push_str("${");
                rest = candidate.strip_prefix("${").unwrap_or_default();
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

fn quote(value: &str, os_family: OsFamily) -> Cow<'_, str> {
    match os_family {
        OsFamily::Linux => escape(Cow::Borrowed(value)),
        OsFamily::Windows => Cow::Owned(format!("'{}'", value.replace('\'', "''"))),
    }
}

#[cfg(test)]
mod tests;
