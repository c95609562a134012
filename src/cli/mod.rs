//! Command-line interface definitions for the `volume-provider` binary.
//!
//! The parser structures live here so both the binary and the build script
//! can use them; the build script renders the manual page from them.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `volume-provider` binary.
#[derive(Debug, Parser)]
#[command(
    name = "volume-provider",
    about = "Provision and manage database volumes across storage backends",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision a new volume.
    #[command(name = "create")]
    Create(CreateCommand),
    /// Release a volume and remove its record.
    #[command(name = "delete")]
    Delete(VolumeArg),
    /// Grow a volume.
    #[command(name = "resize")]
    Resize(ResizeCommand),
    /// Take a snapshot of a volume.
    #[command(name = "snapshot")]
    Snapshot(SnapshotCommand),
    /// Remove a snapshot.
    #[command(name = "remove-snapshot")]
    RemoveSnapshot(RemoveSnapshotCommand),
    /// Restore a snapshot into a new volume.
    #[command(name = "restore")]
    Restore(RestoreCommand),
    /// Move a volume to another zone.
    #[command(name = "move")]
    Move(MoveCommand),
    /// Attach a volume to a host.
    #[command(name = "attach")]
    Attach(HostCommand),
    /// Detach a volume from its host.
    #[command(name = "detach")]
    Detach(VolumeArg),
    /// Attach a volume and print the script that mounts it on the host.
    #[command(name = "mount")]
    Mount(MountCommand),
    /// Print the script that unmounts a volume on its host.
    #[command(name = "umount")]
    Umount(UmountCommand),
    /// Grant or revoke client access.
    #[command(name = "access", subcommand)]
    Access(AccessCommand),
    /// Print a volume record.
    #[command(name = "show")]
    Show(VolumeArg),
    /// List the snapshots of a volume.
    #[command(name = "snapshots")]
    Snapshots(VolumeArg),
}

/// A volume identifier.
#[derive(Debug, Args)]
pub(crate) struct VolumeArg {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
}

/// Arguments for `volume-provider create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Backend family: block, gce, faas or k8s.
    #[arg(long, value_name = "PROVIDER")]
    pub(crate) provider: String,
    /// Environment whose credential is used.
    #[arg(long = "env", value_name = "ENV")]
    pub(crate) environment: String,
    /// Sibling group the volume belongs to.
    #[arg(long, value_name = "GROUP")]
    pub(crate) group: String,
    /// Size in gigabytes. May be omitted when restoring from a snapshot.
    #[arg(long, value_name = "GB", default_value_t = 0)]
    pub(crate) size_gb: u64,
    /// Client address granted access once the volume exists.
    #[arg(long, value_name = "ADDRESS")]
    pub(crate) owner: Option<String>,
    /// Snapshot record to seed the volume from.
    #[arg(long, value_name = "SNAPSHOT_ID")]
    pub(crate) snapshot: Option<String>,
    /// Placement zone.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Host to attach the volume to after creation.
    #[arg(long = "vm", value_name = "HOST")]
    pub(crate) vm_name: Option<String>,
    /// Backend performance class.
    #[arg(long, value_name = "TYPE")]
    pub(crate) offering: Option<String>,
    /// Label mirrored to the backend, as KEY=VALUE. Repeatable.
    #[arg(long = "label", value_name = "KEY=VALUE")]
    pub(crate) labels: Vec<String>,
}

/// Arguments for `volume-provider resize`.
#[derive(Debug, Args)]
pub(crate) struct ResizeCommand {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
    /// New size in gigabytes; must exceed the current size.
    #[arg(long, value_name = "GB")]
    pub(crate) size_gb: u64,
}

/// Arguments for `volume-provider snapshot`.
#[derive(Debug, Args)]
pub(crate) struct SnapshotCommand {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
    /// Owning team label.
    #[arg(long, value_name = "TEAM")]
    pub(crate) team: Option<String>,
    /// Database engine label.
    #[arg(long, value_name = "ENGINE")]
    pub(crate) engine: Option<String>,
    /// Database name label.
    #[arg(long, value_name = "NAME")]
    pub(crate) db_name: Option<String>,
    /// Keep the snapshot past normal rotation.
    #[arg(long)]
    pub(crate) persist: bool,
}

/// Arguments for `volume-provider remove-snapshot`.
#[derive(Debug, Args)]
pub(crate) struct RemoveSnapshotCommand {
    /// Snapshot record identifier.
    #[arg(value_name = "SNAPSHOT_ID")]
    pub(crate) snapshot: String,
    /// Remove the record even when the backend refuses.
    #[arg(long)]
    pub(crate) force: bool,
}

/// Arguments for `volume-provider restore`.
#[derive(Debug, Args)]
pub(crate) struct RestoreCommand {
    /// Snapshot record identifier.
    #[arg(value_name = "SNAPSHOT_ID")]
    pub(crate) snapshot: String,
    /// Zone for the new volume; defaults to the source zone.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Host to attach the new volume to.
    #[arg(long = "vm", value_name = "HOST")]
    pub(crate) vm_name: Option<String>,
    /// Client address granted access to the new volume.
    #[arg(long, value_name = "ADDRESS")]
    pub(crate) owner: Option<String>,
}

/// Arguments for `volume-provider move`.
#[derive(Debug, Args)]
pub(crate) struct MoveCommand {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
    /// Target zone.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: String,
}

/// Arguments for `volume-provider attach`.
#[derive(Debug, Args)]
pub(crate) struct HostCommand {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
    /// Host name.
    #[arg(long, value_name = "HOST")]
    pub(crate) host: String,
}

/// Script rendering switches shared by `mount` and `umount`.
#[derive(Debug, Args)]
pub(crate) struct ScriptArgs {
    /// Mount point on the host; defaults to the configured data directory.
    #[arg(long, value_name = "PATH")]
    pub(crate) data_directory: Option<String>,
    /// Leave /etc/fstab untouched.
    #[arg(long)]
    pub(crate) no_fstab: bool,
}

/// Arguments for `volume-provider mount`.
#[derive(Debug, Args)]
pub(crate) struct MountCommand {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
    /// Host the volume is mounted on.
    #[arg(long, value_name = "HOST")]
    pub(crate) host: String,
    #[command(flatten)]
    pub(crate) script: ScriptArgs,
}

/// Arguments for `volume-provider umount`.
#[derive(Debug, Args)]
pub(crate) struct UmountCommand {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
    #[command(flatten)]
    pub(crate) script: ScriptArgs,
}

/// `volume-provider access` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum AccessCommand {
    /// Grant a client address access.
    #[command(name = "add")]
    Add(AccessArgs),
    /// Revoke a client address.
    #[command(name = "remove")]
    Remove(AccessArgs),
}

/// Arguments for the `access` subcommands.
#[derive(Debug, Args)]
pub(crate) struct AccessArgs {
    /// Volume record identifier.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume: String,
    /// Client address.
    #[arg(value_name = "ADDRESS")]
    pub(crate) address: String,
}
