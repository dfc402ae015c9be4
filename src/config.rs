//! Configuration loading via `ortho-config`.
//!
//! [`InfrastructureConfig`] merges defaults, `nodefleet.toml`, environment
//! variables (`NODEFLEET_*`), and CLI flags. It is validated once and turned
//! into an immutable [`AcquisitionPlan`]; nothing downstream reads raw
//! configuration.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::context::DeploymentContext;
use crate::infrastructure::AcquisitionPlan;
use crate::provisioner::{
    CloudCredentials, CloudEndpoints, InfrastructureRequest, InstanceRequest, OsFamily,
    RequestError,
};
use crate::script::{BootstrapSettings, ScriptTemplates, TemplateError, resolve_template};

/// Default properties passed to each node process.
pub const DEFAULT_ADDITIONAL_PROPERTIES: &str =
    "-Dproactive.useIPaddress=true -Dproactive.pnp.port=64738";

/// Default directory holding the persisted registry.
pub const DEFAULT_STATE_DIR: &str = "nodefleet-state";

const CONFIG_FILE: &str = "nodefleet.toml";

/// Deployment configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODEFLEET",
    discovery(
        app_name = "nodefleet",
        env_var = "NODEFLEET_CONFIG_PATH",
        config_file_name = "nodefleet.toml",
        dotfile_name = ".nodefleet.toml",
        project_file_name = "nodefleet.toml"
    )
)]
pub struct InfrastructureConfig {
    /// Application (client) identifier of the cloud service principal.
    pub client_id: String,
    /// Client secret of the service principal.
    pub secret: String,
    /// Tenant or domain the service principal belongs to.
    pub domain: String,
    /// Subscription billed for the instances.
    pub subscription_id: String,
    /// Authentication endpoint override.
    pub authentication_endpoint: Option<String>,
    /// Management endpoint override.
    pub management_endpoint: Option<String>,
    /// Resource manager endpoint override.
    pub resource_manager_endpoint: Option<String>,
    /// Graph endpoint override.
    pub graph_endpoint: Option<String>,
    /// Whether the provider drops the shared infrastructure on shutdown.
    #[ortho_config(default = false)]
    pub remove_infrastructure_on_shutdown: bool,
    /// Image booted on each instance.
    pub image: String,
    /// Operating system of the image: `linux` or `windows`.
    #[ortho_config(default = "linux".to_owned())]
    pub image_os_type: String,
    /// VM size (for example `Standard_D1_v2`).
    pub vm_size: String,
    /// Administrator account created on each instance.
    pub vm_username: String,
    /// Administrator password. A password or public key is required.
    pub vm_password: Option<String>,
    /// Administrator SSH public key. A password or public key is required.
    pub vm_public_key: Option<String>,
    /// Resource group owning the instances.
    pub resource_group: String,
    /// Region the instances are placed in.
    pub region: String,
    /// Instances created by a full acquisition.
    #[ortho_config(default = 1)]
    pub number_of_instances: u32,
    /// Nodes bootstrapped on each instance.
    #[ortho_config(default = 1)]
    pub nodes_per_instance: u32,
    /// URL nodes download their bundle from.
    pub node_bundle_url: String,
    /// Optional private network range in `a.b.c.d/n` notation.
    pub private_network_cidr: Option<String>,
    /// Whether instances receive a static public address.
    #[ortho_config(default = true)]
    pub static_public_ip: bool,
    /// Extra properties passed to each node process.
    #[ortho_config(default = DEFAULT_ADDITIONAL_PROPERTIES.to_owned())]
    pub additional_properties: String,
    /// Inline startup script for Linux instances.
    pub linux_startup_script: Option<String>,
    /// Path to the startup script for Linux instances. Supports `~/`.
    pub linux_startup_script_file: Option<String>,
    /// Inline startup script for Windows instances.
    pub windows_startup_script: Option<String>,
    /// Path to the startup script for Windows instances. Supports `~/`.
    pub windows_startup_script_file: Option<String>,
    /// Directory holding the persisted registry.
    #[ortho_config(default = DEFAULT_STATE_DIR.to_owned())]
    pub state_dir: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to {CONFIG_FILE}",
            self.env_var, self.toml_key
        )
    }
}

const REQUIRED_FIELDS: [FieldMetadata; 10] = [
    FieldMetadata::new("cloud client ID", "NODEFLEET_CLIENT_ID", "client_id"),
    FieldMetadata::new("cloud client secret", "NODEFLEET_SECRET", "secret"),
    FieldMetadata::new("cloud domain", "NODEFLEET_DOMAIN", "domain"),
    FieldMetadata::new("subscription ID", "NODEFLEET_SUBSCRIPTION_ID", "subscription_id"),
    FieldMetadata::new("VM image", "NODEFLEET_IMAGE", "image"),
    FieldMetadata::new("VM size", "NODEFLEET_VM_SIZE", "vm_size"),
    FieldMetadata::new("VM username", "NODEFLEET_VM_USERNAME", "vm_username"),
    FieldMetadata::new("resource group", "NODEFLEET_RESOURCE_GROUP", "resource_group"),
    FieldMetadata::new("region", "NODEFLEET_REGION", "region"),
    FieldMetadata::new("node bundle URL", "NODEFLEET_NODE_BUNDLE_URL", "node_bundle_url"),
];

impl InfrastructureConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("nodefleet")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn required_values(&self) -> [&str; 10] {
        [
            &self.client_id,
            &self.secret,
            &self.domain,
            &self.subscription_id,
            &self.image,
            &self.vm_size,
            &self.vm_username,
            &self.resource_group,
            &self.region,
            &self.node_bundle_url,
        ]
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in self.required_values().into_iter().zip(&REQUIRED_FIELDS) {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "missing {}: {}",
                    metadata.description,
                    metadata.hint()
                )));
            }
        }

        let has_secret = |value: Option<&str>| value.is_some_and(|v| !v.trim().is_empty());
        if !has_secret(self.vm_password.as_deref()) && !has_secret(self.vm_public_key.as_deref())
        {
            return Err(ConfigError::MissingField(String::from(
                "missing VM password or public key: set NODEFLEET_VM_PASSWORD or \
                 NODEFLEET_VM_PUBLIC_KEY, or add vm_password or vm_public_key to nodefleet.toml",
            )));
        }

        self.os_family()?;
        Self::require_positive(
            self.number_of_instances,
            &FieldMetadata::new(
                "number of instances",
                "NODEFLEET_NUMBER_OF_INSTANCES",
                "number_of_instances",
            ),
        )?;
        Self::require_positive(
            self.nodes_per_instance,
            &FieldMetadata::new(
                "nodes per instance",
                "NODEFLEET_NODES_PER_INSTANCE",
                "nodes_per_instance",
            ),
        )?;
        if self.state_dir.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: String::from("state_dir"),
                message: String::from("must not be empty"),
            });
        }
        Ok(())
    }

    fn require_positive(value: u32, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                field: metadata.toml_key.to_owned(),
                message: format!("{} must be at least 1: {}", metadata.description, metadata.hint()),
            });
        }
        Ok(())
    }

    /// Parses the configured image OS type.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything other than `linux`
    /// or `windows`.
    pub fn os_family(&self) -> Result<OsFamily, ConfigError> {
        self.image_os_type
            .parse()
            .map_err(|err: RequestError| ConfigError::InvalidValue {
                field: String::from("image_os_type"),
                message: err.to_string(),
            })
    }

    /// Resolves both startup script templates. The template for the
    /// configured OS type is required; the other may be absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Template`] when a template source is invalid
    /// and [`ConfigError::MissingField`] when the required one is absent.
    pub fn templates(&self) -> Result<ScriptTemplates, ConfigError> {
        let linux = resolve_template(
            "linux",
            self.linux_startup_script.as_deref(),
            self.linux_startup_script_file.as_deref(),
        )?;
        let windows = resolve_template(
            "windows",
            self.windows_startup_script.as_deref(),
            self.windows_startup_script_file.as_deref(),
        )?;

        let (required, metadata) = match self.os_family()? {
            OsFamily::Linux => (
                &linux,
                FieldMetadata::new(
                    "Linux startup script",
                    "NODEFLEET_LINUX_STARTUP_SCRIPT",
                    "linux_startup_script",
                ),
            ),
            OsFamily::Windows => (
                &windows,
                FieldMetadata::new(
                    "Windows startup script",
                    "NODEFLEET_WINDOWS_STARTUP_SCRIPT",
                    "windows_startup_script",
                ),
            ),
        };
        if required.is_none() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {} (or the matching _file key)",
                metadata.description,
                metadata.hint()
            )));
        }

        Ok(ScriptTemplates::new(
            linux.unwrap_or_default(),
            windows.unwrap_or_default(),
        ))
    }

    /// Builds the immutable plan for the deployment described by `context`.
    ///
    /// The deployment label derived from the node source name labels both
    /// the infrastructure and the instances.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn acquisition_plan(
        &self,
        context: &DeploymentContext,
    ) -> Result<AcquisitionPlan, ConfigError> {
        self.validate()?;
        let label = context.label();
        if label.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: String::from("node_source_name"),
                message: String::from("node source name must not be blank"),
            });
        }

        let infrastructure = InfrastructureRequest {
            label: label.clone(),
            credentials: CloudCredentials {
                client_id: self.client_id.trim().to_owned(),
                secret: self.secret.clone(),
                domain: self.domain.trim().to_owned(),
                subscription_id: self.subscription_id.trim().to_owned(),
            },
            endpoints: CloudEndpoints {
                authentication: self.authentication_endpoint.clone(),
                management: self.management_endpoint.clone(),
                resource_manager: self.resource_manager_endpoint.clone(),
                graph: self.graph_endpoint.clone(),
            },
            remove_on_shutdown: self.remove_infrastructure_on_shutdown,
        };

        let request = InstanceRequest::builder()
            .infrastructure_label(&label)
            .instance_label(&label)
            .image(&self.image)
            .os_family(self.os_family()?)
            .vm_size(&self.vm_size)
            .count(self.number_of_instances)
            .username(&self.vm_username)
            .password(self.vm_password.clone())
            .public_key(self.vm_public_key.clone())
            .resource_group(&self.resource_group)
            .region(&self.region)
            .private_network_cidr(self.private_network_cidr.clone())
            .static_public_ip(self.static_public_ip)
            .build()?;

        Ok(AcquisitionPlan {
            infrastructure,
            request,
            nodes_per_instance: self.nodes_per_instance,
            bootstrap: BootstrapSettings {
                templates: self.templates()?,
                node_bundle_url: self.node_bundle_url.trim().to_owned(),
                additional_properties: self.additional_properties.trim().to_owned(),
            },
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value for {field}: {message}")]
    InvalidValue {
        /// Offending configuration key.
        field: String,
        /// Why the value was rejected.
        message: String,
    },
    /// Surfaces startup script template errors.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Surfaces instance request validation errors.
    #[error("invalid instance request: {0}")]
    Request(#[from] RequestError),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
