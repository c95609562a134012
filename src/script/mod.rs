//! Host-side mount and unmount scripts.
//!
//! Scripts are rendered as POSIX `sh` text for an external executor; nothing
//! here runs them. Every step that can fail calls `die`, which echoes the
//! cause to stderr and exits non-zero. Values are quoted with
//! `shell-escape` before they are embedded.

use std::borrow::Cow;
use std::fmt::Write as _;

use shell_escape::unix::escape;

use crate::config::EngineConfig;
use crate::error::LifecycleError;

/// Default fstab location.
pub const DEFAULT_FSTAB: &str = "/etc/fstab";

/// What a host mounts for a given volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MountTarget {
    /// Block device (or a stable symlink to one) exposed by the backend.
    BlockDevice {
        /// Device path, for example `/dev/disk/by-id/google-db-data1`.
        device: String,
    },
    /// Network share mounted over NFS.
    NetworkShare {
        /// Export source, `host:/path`.
        source: String,
        /// NFS mount options.
        options: String,
    },
}

/// Caller choices for rendering a mount or unmount script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountOptions {
    /// Mount point on the host.
    pub data_directory: String,
    /// Whether to maintain an fstab entry for the mount point.
    pub with_fstab: bool,
    /// fstab file to rewrite.
    pub fstab_path: String,
    /// Filesystem created on blank block devices.
    pub filesystem: String,
    /// Seconds to wait for a block device to appear.
    pub device_wait_seconds: u32,
}

impl MountOptions {
    /// Options derived from engine configuration, with fstab maintenance on.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            data_directory: config.data_directory.trim().to_owned(),
            with_fstab: true,
            fstab_path: DEFAULT_FSTAB.to_owned(),
            filesystem: config.filesystem.trim().to_owned(),
            device_wait_seconds: config.device_wait_seconds,
        }
    }

    /// Overrides the mount point.
    #[must_use]
    pub fn data_directory(mut self, value: impl Into<String>) -> Self {
        self.data_directory = value.into().trim().to_owned();
        self
    }

    /// Enables or disables fstab maintenance.
    #[must_use]
    pub const fn with_fstab(mut self, enabled: bool) -> Self {
        self.with_fstab = enabled;
        self
    }

    /// Overrides the fstab location.
    #[must_use]
    pub fn fstab_path(mut self, value: impl Into<String>) -> Self {
        self.fstab_path = value.into().trim().to_owned();
        self
    }

    fn validate(&self) -> Result<(), LifecycleError> {
        if !self.data_directory.starts_with('/') || self.data_directory.len() < 2 {
            return Err(LifecycleError::Validation(format!(
                "data directory must be an absolute path below /, got '{}'",
                self.data_directory
            )));
        }
        if self.with_fstab && self.fstab_path.is_empty() {
            return Err(LifecycleError::Validation(String::from(
                "fstab path must not be empty",
            )));
        }
        if self.filesystem.is_empty()
            || !self
                .filesystem
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric())
        {
            return Err(LifecycleError::Validation(format!(
                "unsupported filesystem '{}'",
                self.filesystem
            )));
        }
        Ok(())
    }
}

fn quote(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

fn preamble(script: &mut String) {
    script.push_str("#!/bin/sh\nset -u\n");
    script.push_str("die() {\n    echo \"volume-provider: $*\" >&2\n    exit 1\n}\n");
}

/// Escapes an fstab field the way `getmntent` reads it back: space, tab,
/// newline and backslash become octal escapes.
fn fstab_field(value: &str) -> String {
    let mut field = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ' ' => field.push_str("\\040"),
            '\t' => field.push_str("\\011"),
            '\n' => field.push_str("\\012"),
            '\\' => field.push_str("\\134"),
            other => field.push(other),
        }
    }
    field
}

fn fstab_block(script: &mut String, fstab: &str, mount_point: &str, entry: Option<&str>) {
    writeln!(script, "FSTAB={}", quote(fstab)).ok();
    writeln!(
        script,
        "FSTAB_MOUNT_POINT={}",
        quote(&fstab_field(mount_point))
    )
    .ok();
    script.push_str("export FSTAB_MOUNT_POINT\n");
    script.push_str("fstab_tmp=\"$(mktemp)\" || die \"cannot create a temporary file\"\n");
    script.push_str("trap 'rm -f \"$fstab_tmp\"' EXIT\n");
    script.push_str("if [ -f \"$FSTAB\" ]; then\n");
    script.push_str(
        "    awk '$2 != ENVIRON[\"FSTAB_MOUNT_POINT\"]' \"$FSTAB\" > \"$fstab_tmp\" || die \"cannot read $FSTAB\"\n",
    );
    script.push_str("fi\n");
    if let Some(line) = entry {
        writeln!(script, "FSTAB_ENTRY={}", quote(line)).ok();
        script.push_str(
            "printf '%s\\n' \"$FSTAB_ENTRY\" >> \"$fstab_tmp\" || die \"cannot stage $FSTAB\"\n",
        );
    }
    script.push_str("cat \"$fstab_tmp\" > \"$FSTAB\" || die \"cannot update $FSTAB\"\n");
    script.push_str("rm -f \"$fstab_tmp\"\n");
}

/// Renders the script that formats (when blank) and mounts `target`.
///
/// # Errors
///
/// Returns [`LifecycleError::Validation`] when the options or target are
/// unusable.
pub fn render_mount(target: &MountTarget, options: &MountOptions) -> Result<String, LifecycleError> {
    options.validate()?;
    let mut script = String::new();
    preamble(&mut script);
    writeln!(script, "MOUNT_POINT={}", quote(&options.data_directory))
        .ok();

    let (fstab_entry, mount_command) = match target {
        MountTarget::BlockDevice { device } => {
            if device.trim().is_empty() {
                return Err(LifecycleError::Validation(String::from(
                    "volume has no device path yet",
                )));
            }
            render_device_preparation(&mut script, device, options);
            (
                format!(
                    "{} {} {} defaults,nofail 0 2",
                    fstab_field(device),
                    fstab_field(&options.data_directory),
                    options.filesystem
                ),
                format!(
                    "mount -t {} \"$DEVICE\" \"$MOUNT_POINT\" || die \"mount of $DEVICE on $MOUNT_POINT failed\"",
                    options.filesystem
                ),
            )
        }
        MountTarget::NetworkShare {
            source,
            options: nfs_options,
        } => {
            if source.trim().is_empty() {
                return Err(LifecycleError::Validation(String::from(
                    "export has no mount source yet",
                )));
            }
            writeln!(script, "SOURCE={}", quote(source)).ok();
            writeln!(script, "NFS_OPTIONS={}", quote(nfs_options)).ok();
            (
                format!(
                    "{} {} nfs {} 0 0",
                    fstab_field(source),
                    fstab_field(&options.data_directory),
                    fstab_field(nfs_options)
                ),
                String::from(
                    "mount -t nfs -o \"$NFS_OPTIONS\" \"$SOURCE\" \"$MOUNT_POINT\" || die \"mount of $SOURCE on $MOUNT_POINT failed\"",
                ),
            )
        }
    };

    script.push_str("mkdir -p \"$MOUNT_POINT\" || die \"cannot create $MOUNT_POINT\"\n");
    if options.with_fstab {
        fstab_block(
            &mut script,
            &options.fstab_path,
            &options.data_directory,
            Some(&fstab_entry),
        );
    }
    script.push_str("if ! mountpoint -q \"$MOUNT_POINT\"; then\n");
    writeln!(script, "    {mount_command}").ok();
    script.push_str("fi\n");
    Ok(script)
}

fn render_device_preparation(script: &mut String, device: &str, options: &MountOptions) {
    let wait = options.device_wait_seconds;
    writeln!(script, "DEVICE={}", quote(device)).ok();
    script.push_str("waited=0\n");
    script.push_str("while [ ! -e \"$DEVICE\" ]; do\n");
    writeln!(script, "    if [ \"$waited\" -ge {wait} ]; then")
        .ok();
    writeln!(
        script,
        "        die \"device $DEVICE did not appear within {wait}s\""
    )
    .ok();
    script.push_str("    fi\n    sleep 1\n    waited=$((waited + 1))\ndone\n");
    script.push_str("if [ -z \"$(blkid -o value -s TYPE \"$DEVICE\" 2>/dev/null)\" ]; then\n");
    writeln!(
        script,
        "    mkfs -t {fs} \"$DEVICE\" || die \"mkfs.{fs} failed on $DEVICE\"",
        fs = options.filesystem
    )
    .ok();
    script.push_str("fi\n");
}

/// Renders the script that unmounts the data directory and drops its fstab
/// entry. Backend detach is a separate step.
///
/// # Errors
///
/// Returns [`LifecycleError::Validation`] when the options are unusable.
pub fn render_unmount(options: &MountOptions) -> Result<String, LifecycleError> {
    options.validate()?;
    let mut script = String::new();
    preamble(&mut script);
    writeln!(script, "MOUNT_POINT={}", quote(&options.data_directory))
        .ok();
    script.push_str("if mountpoint -q \"$MOUNT_POINT\"; then\n");
    script.push_str("    umount \"$MOUNT_POINT\" || die \"umount of $MOUNT_POINT failed\"\n");
    script.push_str("fi\n");
    if options.with_fstab {
        fstab_block(
            &mut script,
            &options.fstab_path,
            &options.data_directory,
            None,
        );
    }
    Ok(script)
}
