//! Binary entry point for the nodefleet CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use nodefleet::config::DEFAULT_ADDITIONAL_PROPERTIES;
use nodefleet::script::resolve_template;
use nodefleet::{
    BootstrapSettings, ConfigError, ConnectionParams, DeploymentContext, DirectoryStore,
    InfrastructureConfig, Instance, NodeInstanceRegistry, OsFamily, RegistryError, RequestError,
    ScriptError, ScriptTemplates, StoreError, TemplateError, build_command,
};

mod cli;

use cli::{CheckCommand, Cli, RegistryCommand, RenderCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("state directory error: {0}")]
    Store(#[from] StoreError),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("script error: {0}")]
    Script(#[from] ScriptError),
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] RequestError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli) {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Check(command) => check(&command, io::stdout()),
        Cli::Registry(command) => show_registry(&command, io::stdout()),
        Cli::Render(command) => render(&command, io::stdout()),
    }
}

fn check(args: &CheckCommand, mut out: impl Write) -> Result<(), CliError> {
    let config = InfrastructureConfig::load_without_cli_args()?;
    let context = DeploymentContext::new(&args.node_source, "", "");
    let plan = config.acquisition_plan(&context)?;

    writeln!(out, "label: {}", plan.infrastructure.label)?;
    writeln!(out, "image: {} ({})", plan.request.image, plan.request.os_family)?;
    writeln!(out, "vm size: {}", plan.request.vm_size)?;
    writeln!(out, "region: {}", plan.request.region)?;
    writeln!(out, "instances: {}", plan.request.count)?;
    writeln!(out, "nodes per instance: {}", plan.nodes_per_instance)?;
    writeln!(out, "state dir: {}", config.state_dir)?;
    Ok(())
}

fn show_registry(args: &RegistryCommand, mut out: impl Write) -> Result<(), CliError> {
    let store = DirectoryStore::open(args.state_dir.as_str())?;
    let registry = NodeInstanceRegistry::open(store)?;
    let rendered = serde_json::to_string_pretty(&registry.snapshot())?;
    writeln!(out, "{rendered}")?;
    Ok(())
}

fn render(args: &RenderCommand, mut out: impl Write) -> Result<(), CliError> {
    let os_family: OsFamily = args.os.parse()?;
    let template =
        resolve_template(&args.os, None, Some(args.template_file.as_str()))?.unwrap_or_default();
    let templates = match os_family {
        OsFamily::Linux => ScriptTemplates::new(template, ""),
        OsFamily::Windows => ScriptTemplates::new("", template),
    };
    let settings = BootstrapSettings {
        templates,
        node_bundle_url: args.node_bundle_url.clone(),
        additional_properties: args
            .additional_properties
            .clone()
            .unwrap_or_else(|| DEFAULT_ADDITIONAL_PROPERTIES.to_owned()),
    };
    let context = DeploymentContext::new(&args.node_source, &args.credentials, &args.master_url);
    let params = ConnectionParams::new(&context, &settings);
    let instance = Instance::new(&args.instance_id, context.label(), os_family);

    let command = build_command(&instance, &settings.templates, args.node_index, &params)?;
    writeln!(out, "{}", command.command)?;
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
