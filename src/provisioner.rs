//! Provisioner abstraction for the cloud instances that host pool nodes.
//!
//! The node pool never talks to a cloud SDK directly. Everything it needs from
//! the provider goes through [`InstanceProvisioner`], and everything it needs
//! from the node process runtime goes through [`NodeRuntime`].

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating system family of the image booted on an instance.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Linux images; bootstrap scripts run under a POSIX shell.
    #[default]
    Linux,
    /// Windows images; bootstrap scripts run under PowerShell.
    Windows,
}

impl OsFamily {
    /// Returns the lowercase name used in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsFamily {
    type Err = RequestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            other => Err(RequestError::UnknownOsFamily(other.to_owned())),
        }
    }
}

/// Login credentials installed on every created instance.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct VmCredentials {
    /// Administrator account name.
    pub username: String,
    /// Optional password for the administrator account.
    pub password: Option<String>,
    /// Optional SSH public key for the administrator account.
    pub public_key: Option<String>,
}

impl fmt::Debug for VmCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Parameters for a single batch instance creation call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Label of the shared infrastructure the instances belong to.
    pub infrastructure_label: String,
    /// Label applied to the created instances.
    pub instance_label: String,
    /// Image reference to boot.
    pub image: String,
    /// Operating system family of [`Self::image`].
    pub os_family: OsFamily,
    /// VM size or SKU (for example `Standard_D1_v2`).
    pub vm_size: String,
    /// Number of instances to create.
    pub count: u32,
    /// Credentials installed on each instance.
    pub credentials: VmCredentials,
    /// Resource group that owns the instances.
    pub resource_group: String,
    /// Region the instances are placed in.
    pub region: String,
    /// Optional private network range, in `a.b.c.d/n` notation.
    pub private_network_cidr: Option<String>,
    /// Whether each instance receives a static public address.
    pub static_public_ip: bool,
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Returns a copy of this request asking for `count` instances.
    #[must_use]
    pub fn with_count(&self, count: u32) -> Self {
        Self {
            count,
            ..self.clone()
        }
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing or malformed.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), RequestError> {
        let required = [
            ("infrastructure_label", &self.infrastructure_label),
            ("instance_label", &self.instance_label),
            ("image", &self.image),
            ("vm_size", &self.vm_size),
            ("username", &self.credentials.username),
            ("resource_group", &self.resource_group),
            ("region", &self.region),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(RequestError::Validation(field.to_owned()));
            }
        }
        if self.count == 0 {
            return Err(RequestError::InvalidCount);
        }
        let has_secret = |value: &Option<String>| value.as_ref().is_some_and(|v| !v.is_empty());
        if !has_secret(&self.credentials.password) && !has_secret(&self.credentials.public_key) {
            return Err(RequestError::MissingVmSecret);
        }
        if let Some(cidr) = &self.private_network_cidr {
            validate_cidr(cidr)?;
        }
        Ok(())
    }
}

fn validate_cidr(cidr: &str) -> Result<(), RequestError> {
    let invalid = || RequestError::InvalidCidr(cidr.to_owned());
    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    address.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    let bits = prefix.parse::<u8>().map_err(|_| invalid())?;
    if bits > 32 {
        return Err(invalid());
    }
    Ok(())
}

/// Builder for [`InstanceRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    infrastructure_label: String,
    instance_label: String,
    image: String,
    os_family: OsFamily,
    vm_size: String,
    count: u32,
    username: String,
    password: Option<String>,
    public_key: Option<String>,
    resource_group: String,
    region: String,
    private_network_cidr: Option<String>,
    static_public_ip: bool,
}

impl InstanceRequestBuilder {
    /// Creates a builder asking for one instance with a static public IP.
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: 1,
            static_public_ip: true,
            ..Self::default()
        }
    }

    /// Sets the infrastructure label.
    #[must_use]
    pub fn infrastructure_label(mut self, value: impl Into<String>) -> Self {
        self.infrastructure_label = value.into();
        self
    }

    /// Sets the instance label.
    #[must_use]
    pub fn instance_label(mut self, value: impl Into<String>) -> Self {
        self.instance_label = value.into();
        self
    }

    /// Sets the image reference.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the image operating system family.
    #[must_use]
    pub const fn os_family(mut self, value: OsFamily) -> Self {
        self.os_family = value;
        self
    }

    /// Sets the VM size.
    #[must_use]
    pub fn vm_size(mut self, value: impl Into<String>) -> Self {
        self.vm_size = value.into();
        self
    }

    /// Sets the number of instances.
    #[must_use]
    pub const fn count(mut self, value: u32) -> Self {
        self.count = value;
        self
    }

    /// Sets the administrator account name.
    #[must_use]
    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.username = value.into();
        self
    }

    /// Sets the optional administrator password.
    #[must_use]
    pub fn password(mut self, value: Option<String>) -> Self {
        self.password = value;
        self
    }

    /// Sets the optional SSH public key.
    #[must_use]
    pub fn public_key(mut self, value: Option<String>) -> Self {
        self.public_key = value;
        self
    }

    /// Sets the resource group.
    #[must_use]
    pub fn resource_group(mut self, value: impl Into<String>) -> Self {
        self.resource_group = value.into();
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the optional private network range.
    #[must_use]
    pub fn private_network_cidr(mut self, value: Option<String>) -> Self {
        self.private_network_cidr = value;
        self
    }

    /// Sets whether instances receive a static public address.
    #[must_use]
    pub const fn static_public_ip(mut self, value: bool) -> Self {
        self.static_public_ip = value;
        self
    }

    /// Builds and validates the [`InstanceRequest`], trimming string inputs.
    /// Optional values that trim to nothing are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when any required field is empty or invalid.
    pub fn build(self) -> Result<InstanceRequest, RequestError> {
        let request = InstanceRequest {
            infrastructure_label: self.infrastructure_label.trim().to_owned(),
            instance_label: self.instance_label.trim().to_owned(),
            image: self.image.trim().to_owned(),
            os_family: self.os_family,
            vm_size: self.vm_size.trim().to_owned(),
            count: self.count,
            credentials: VmCredentials {
                username: self.username.trim().to_owned(),
                password: non_blank(self.password),
                public_key: non_blank(self.public_key),
            },
            resource_group: self.resource_group.trim().to_owned(),
            region: self.region.trim().to_owned(),
            private_network_cidr: non_blank(self.private_network_cidr),
            static_public_ip: self.static_public_ip,
        };
        request.validate()?;
        Ok(request)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|inner| inner.trim().to_owned())
        .filter(|inner| !inner.is_empty())
}

/// Service principal used to reach the cloud account.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct CloudCredentials {
    /// Application (client) identifier.
    pub client_id: String,
    /// Client secret.
    pub secret: String,
    /// Tenant or domain the application belongs to.
    pub domain: String,
    /// Subscription billed for the instances.
    pub subscription_id: String,
}

impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("client_id", &self.client_id)
            .field("secret", &"<redacted>")
            .field("domain", &self.domain)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

/// Optional endpoint overrides for sovereign or private clouds.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CloudEndpoints {
    /// Authentication endpoint.
    pub authentication: Option<String>,
    /// Management endpoint.
    pub management: Option<String>,
    /// Resource manager endpoint.
    pub resource_manager: Option<String>,
    /// Graph endpoint.
    pub graph: Option<String>,
}

/// Description of the shared infrastructure every instance is created in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InfrastructureRequest {
    /// Deployment label identifying the infrastructure.
    pub label: String,
    /// Cloud account credentials.
    pub credentials: CloudCredentials,
    /// Endpoint overrides.
    pub endpoints: CloudEndpoints,
    /// Whether the provider should drop the infrastructure when it shuts down.
    pub remove_on_shutdown: bool,
}

/// Errors raised while validating provisioning requests.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when zero instances are requested.
    #[error("instance count must be at least 1")]
    InvalidCount,
    /// Raised when neither a password nor a public key is provided.
    #[error("a VM password or public key is required")]
    MissingVmSecret,
    /// Raised when the private network range is not `a.b.c.d/n`.
    #[error("invalid private network CIDR: {0}")]
    InvalidCidr(String),
    /// Raised when the OS family is not `linux` or `windows`.
    #[error("unknown OS family '{0}', expected linux or windows")]
    UnknownOsFamily(String),
}

/// Future returned by provisioner and runtime operations.
pub type ProvisionerFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Cloud operations the node pool relies on.
///
/// Every call is bounded by the implementation; the coordinators impose no
/// timeouts of their own and never retry.
pub trait InstanceProvisioner: Send + Sync {
    /// Provider specific error type returned by the provisioner.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resolves once the provisioning service accepts requests.
    fn wait_until_ready(&self) -> ProvisionerFuture<'_, (), Self::Error>;

    /// Creates the shared infrastructure or reuses an existing one, returning
    /// its label. Repeated calls with the same request return the same label.
    fn ensure_infrastructure<'a>(
        &'a self,
        request: &'a InfrastructureRequest,
    ) -> ProvisionerFuture<'a, String, Self::Error>;

    /// Creates `request.count` instances and returns the identifiers that
    /// were actually created, which may be fewer than requested.
    fn create_instances<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProvisionerFuture<'a, BTreeSet<String>, Self::Error>;

    /// Runs `command` on the instance.
    fn execute_script<'a>(
        &'a self,
        instance_id: &'a str,
        command: &'a str,
        extra_args: &'a [String],
    ) -> ProvisionerFuture<'a, (), Self::Error>;

    /// Terminates the instance and releases its provider resources.
    fn terminate_instance<'a>(
        &'a self,
        label: &'a str,
        instance_id: &'a str,
    ) -> ProvisionerFuture<'a, (), Self::Error>;
}

/// Access to the processes running registered nodes.
pub trait NodeRuntime: Send + Sync {
    /// Runtime specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stops the node process. Callers treat failures as advisory because the
    /// node may already be gone.
    fn kill_node<'a>(&'a self, node_name: &'a str) -> ProvisionerFuture<'a, (), Self::Error>;
}
