//! Binary entry point for the `volume-provider` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use volume_provider::{
    CreateVolumeRequest, CredentialSet, EngineConfig, JsonFileStore, Labels, LifecycleError,
    LifecycleOrchestrator, MountOptions, ProviderKind, ProviderRegistry, RestoreRequest,
    SnapshotId, SnapshotTagger, TakeSnapshotRequest, VolumeId, model::gb_to_kb,
};

mod cli;

use cli::{AccessCommand, Cli, CreateCommand, ScriptArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid label '{0}': expected KEY=VALUE")]
    Label(String),
    #[error("{}: {}", .0.kind().as_str(), .0)]
    Lifecycle(#[from] LifecycleError),
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

enum Output {
    Json(serde_json::Value),
    Text(String),
    Nothing,
}

impl Output {
    fn json(value: &impl Serialize) -> Result<Self, CliError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }
}

type Engine = LifecycleOrchestrator<JsonFileStore>;

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(output) => {
            write_output(io::stdout(), &output);
            0
        }
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

fn build_engine() -> Result<(Engine, EngineConfig), CliError> {
    let config = EngineConfig::load_without_cli_args().map_err(LifecycleError::from)?;
    config.validate().map_err(LifecycleError::from)?;
    let credentials = CredentialSet::load(&Utf8PathBuf::from(config.credentials_path.trim()))?;
    let store = JsonFileStore::new(config.store_path.trim());
    let registry = ProviderRegistry::with_builtin(Arc::new(credentials), config.clone());
    let engine = LifecycleOrchestrator::new(store, registry)
        .with_snapshot_tagger(SnapshotTagger::from_config(&config));
    Ok((engine, config))
}

async fn run(cli: Cli) -> Result<Output, CliError> {
    let (engine, config) = build_engine()?;
    dispatch(&engine, &config, cli).await
}

async fn dispatch(engine: &Engine, config: &EngineConfig, cli: Cli) -> Result<Output, CliError> {
    match cli {
        Cli::Create(command) => {
            let request = create_request(command)?;
            Output::json(&engine.create_volume(&request).await?)
        }
        Cli::Delete(arg) => {
            engine.delete_volume(&VolumeId::from(arg.volume)).await?;
            Ok(Output::Nothing)
        }
        Cli::Resize(command) => Output::json(
            &engine
                .resize(&VolumeId::from(command.volume), gb_to_kb(command.size_gb))
                .await?,
        ),
        Cli::Snapshot(command) => {
            let request = TakeSnapshotRequest {
                team: command.team,
                engine: command.engine,
                db_name: command.db_name,
                persist: command.persist,
            };
            Output::json(
                &engine
                    .take_snapshot(&VolumeId::from(command.volume), &request)
                    .await?,
            )
        }
        Cli::RemoveSnapshot(command) => {
            engine
                .remove_snapshot(&SnapshotId::from(command.snapshot), command.force)
                .await?;
            Ok(Output::Nothing)
        }
        Cli::Restore(command) => {
            let request = RestoreRequest {
                zone: command.zone,
                vm_name: command.vm_name,
                owner_address: command.owner,
            };
            Output::json(
                &engine
                    .restore_snapshot(&SnapshotId::from(command.snapshot), &request)
                    .await?,
            )
        }
        Cli::Move(command) => Output::json(
            &engine
                .move_volume(&VolumeId::from(command.volume), &command.zone)
                .await?,
        ),
        Cli::Attach(command) => Output::json(
            &engine
                .attach_volume(&VolumeId::from(command.volume), &command.host)
                .await?,
        ),
        Cli::Detach(arg) => Output::json(&engine.detach_volume(&VolumeId::from(arg.volume)).await?),
        Cli::Mount(command) => {
            let options = mount_options(config, &command.script);
            let script = engine
                .mount_script(&VolumeId::from(command.volume), &command.host, &options)
                .await?;
            Ok(Output::Text(script))
        }
        Cli::Umount(command) => {
            let options = mount_options(config, &command.script);
            let script = engine.umount_script(&VolumeId::from(command.volume), &options)?;
            Ok(Output::Text(script))
        }
        Cli::Access(AccessCommand::Add(args)) => Output::json(
            &engine
                .add_access(&VolumeId::from(args.volume), &args.address)
                .await?,
        ),
        Cli::Access(AccessCommand::Remove(args)) => Output::json(
            &engine
                .remove_access(&VolumeId::from(args.volume), &args.address)
                .await?,
        ),
        Cli::Show(arg) => Output::json(&engine.get_volume(&VolumeId::from(arg.volume))?),
        Cli::Snapshots(arg) => Output::json(&engine.list_snapshots(&VolumeId::from(arg.volume))?),
    }
}

fn create_request(command: CreateCommand) -> Result<CreateVolumeRequest, CliError> {
    let provider: ProviderKind = command.provider.parse()?;
    let mut request = CreateVolumeRequest::new(
        provider,
        command.environment,
        command.group,
        gb_to_kb(command.size_gb),
    )
    .labels(parse_labels(&command.labels)?);
    if let Some(owner) = command.owner {
        request = request.owner_address(owner);
    }
    if let Some(snapshot) = command.snapshot {
        request = request.from_snapshot(SnapshotId::from(snapshot));
    }
    if let Some(zone) = command.zone {
        request = request.zone(zone);
    }
    if let Some(host) = command.vm_name {
        request = request.vm_name(host);
    }
    if let Some(offering) = command.offering {
        request = request.disk_offering_type(offering);
    }
    Ok(request)
}

fn parse_labels(raw: &[String]) -> Result<Labels, CliError> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| CliError::Label(pair.clone()))
        })
        .collect()
}

fn mount_options(config: &EngineConfig, args: &ScriptArgs) -> MountOptions {
    let mut options = MountOptions::from_config(config).with_fstab(!args.no_fstab);
    if let Some(directory) = &args.data_directory {
        options = options.data_directory(directory.as_str());
    }
    options
}

fn write_output(mut target: impl Write, output: &Output) {
    match output {
        Output::Json(value) => {
            writeln!(target, "{value:#}").ok();
        }
        Output::Text(script) => {
            write!(target, "{script}").ok();
        }
        Output::Nothing => {}
    }
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
