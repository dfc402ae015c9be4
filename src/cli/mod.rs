//! Command-line interface definitions for the `nodefleet` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `nodefleet` binary.
#[derive(Debug, Parser)]
#[command(
    name = "nodefleet",
    about = "Inspect and exercise a node pool backed by cloud instances",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Validate configuration and print the acquisition plan.
    #[command(name = "check", about = "Validate configuration and print the acquisition plan")]
    Check(CheckCommand),
    /// Print the persisted instance to node mapping.
    #[command(name = "registry", about = "Print the persisted instance to node mapping")]
    Registry(RegistryCommand),
    /// Render the bootstrap command for one node.
    #[command(name = "render", about = "Render the bootstrap command for one node")]
    Render(RenderCommand),
}

/// Arguments for the `nodefleet check` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CheckCommand {
    /// Node source name the deployment label is derived from.
    #[arg(long, value_name = "NAME")]
    pub(crate) node_source: String,
}

/// Arguments for the `nodefleet registry` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RegistryCommand {
    /// Directory holding the persisted registry.
    #[arg(
        long,
        value_name = "DIR",
        env = "NODEFLEET_STATE_DIR",
        default_value = "nodefleet-state"
    )]
    pub(crate) state_dir: String,
}

/// Arguments for the `nodefleet render` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RenderCommand {
    /// Startup script template to render.
    #[arg(long, value_name = "PATH")]
    pub(crate) template_file: String,
    /// Operating system of the target instance (`linux` or `windows`).
    #[arg(long, value_name = "OS", default_value = "linux")]
    pub(crate) os: String,
    /// Provider identifier of the target instance.
    #[arg(long, value_name = "ID")]
    pub(crate) instance_id: String,
    /// 1-based index of the node on the instance.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub(crate) node_index: u32,
    /// Node source name the deployment label is derived from.
    #[arg(long, value_name = "NAME")]
    pub(crate) node_source: String,
    /// URL of the master service nodes connect to.
    #[arg(long, value_name = "URL")]
    pub(crate) master_url: String,
    /// Credentials nodes present to the master.
    #[arg(long, value_name = "CREDENTIALS", env = "NODEFLEET_CREDENTIALS", hide_env_values = true)]
    pub(crate) credentials: String,
    /// URL nodes download their bundle from.
    #[arg(long, value_name = "URL", default_value = "")]
    pub(crate) node_bundle_url: String,
    /// Extra properties passed to the node process.
    #[arg(long, value_name = "PROPERTIES")]
    pub(crate) additional_properties: Option<String>,
}
