//! First-boot seed assembly (NoCloud datasource).
//!
//! A seed is a tiny read-only ISO the hypervisor attaches as a virtual
//! CD-ROM.  The guest's first-boot agent recognises it by the `CIDATA`
//! volume label and applies the two files inside: `meta-data` (instance
//! identity) and `user-data` (a `#cloud-config` document injecting the
//! ephemeral SSH key and writing the readiness sentinel to the serial
//! console).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CarapaceError;
use crate::iso9660::{self, IsoFile};

/// Default guest hostname, matching the offline image build.
pub const DEFAULT_HOSTNAME: &str = "carapaceos";

/// Token the guest writes to its first serial device once first-boot
/// commands run.  The runner's serial log can be grepped for it as a
/// secondary readiness signal.
pub const READY_SENTINEL: &str = "CARAPACEOS_READY";

/// Inputs for [`build_seed`].
pub struct SeedOptions<'a> {
    /// OpenSSH-format public key authorised for the guest login user.
    pub authorized_key: &'a str,
    /// Where the ISO is written.
    pub output_path: &'a Path,
    /// Guest hostname; defaults to [`DEFAULT_HOSTNAME`].
    pub hostname: Option<&'a str>,
    /// Instance identifier; defaults to a timestamp-derived unique value.
    /// The first-boot agent re-runs whenever this changes, which is every
    /// boot for an ephemeral VM.
    pub instance_id: Option<&'a str>,
    /// Extra shell commands appended to the first-boot command list, run
    /// after the sentinel write.
    pub extra_runcmd: &'a [String],
}

impl<'a> SeedOptions<'a> {
    pub fn new(authorized_key: &'a str, output_path: &'a Path) -> Self {
        Self {
            authorized_key,
            output_path,
            hostname: None,
            instance_id: None,
            extra_runcmd: &[],
        }
    }
}

/// Assemble and write the seed ISO.
pub async fn build_seed(opts: SeedOptions<'_>) -> Result<PathBuf, CarapaceError> {
    let key = opts.authorized_key.trim();
    if key.is_empty() {
        return Err(CarapaceError::Validation {
            message: "authorized public key must not be empty".into(),
        });
    }

    if let Some(parent) = opts.output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CarapaceError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let hostname = opts.hostname.unwrap_or(DEFAULT_HOSTNAME);
    let instance_id = match opts.instance_id {
        Some(id) => id.to_string(),
        None => default_instance_id(),
    };

    let meta_data = format!("instance-id: {instance_id}\nlocal-hostname: {hostname}\n");
    let user_data = build_user_data(key, opts.extra_runcmd);

    let iso = iso9660::build_iso(
        "CIDATA",
        &[
            IsoFile {
                name: "meta-data",
                data: meta_data.as_bytes(),
            },
            IsoFile {
                name: "user-data",
                data: user_data.as_bytes(),
            },
        ],
    );

    tokio::fs::write(opts.output_path, &iso)
        .await
        .map_err(|e| {
            CarapaceError::io(format!("writing seed ISO to {}", opts.output_path.display()), e)
        })?;

    tracing::debug!(path = %opts.output_path.display(), %instance_id, "built seed ISO");
    Ok(opts.output_path.to_path_buf())
}

/// Compose the `#cloud-config` document.
///
/// The first runcmd entry writes the readiness sentinel to the guest's
/// first serial device; extra commands follow in caller order, each
/// single-quoted so shell metacharacters survive the YAML round-trip.
fn build_user_data(authorized_key: &str, extra_runcmd: &[String]) -> String {
    let mut doc = String::from("#cloud-config\n");
    doc.push_str("ssh_authorized_keys:\n");
    doc.push_str(&format!("  - {authorized_key}\n"));
    doc.push_str("ssh_pwauth: false\n");
    doc.push_str("runcmd:\n");
    doc.push_str(&format!("  - echo {READY_SENTINEL} > /dev/ttyS0\n"));
    for cmd in extra_runcmd {
        doc.push_str(&format!("  - {}\n", yaml_squote(cmd)));
    }
    doc
}

/// Single-quote a YAML scalar; embedded single quotes are doubled.
fn yaml_squote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Timestamp-derived instance id; distinct across calls in different
/// milliseconds, which is all an ephemeral per-boot identity needs.
fn default_instance_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("carapace-{millis}")
}
