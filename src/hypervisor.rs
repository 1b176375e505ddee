//! Hypervisor selection and command-line assembly.
//!
//! The hypervisor is an external machine emulator invoked as a child
//! process; the runner never parses its output and learns about guest
//! readiness only through the TCP + shell probes.  This module picks the
//! right binary for the host CPU, decides whether hardware acceleration
//! is available, and lays out the argument vector.

use std::path::Path;

use crate::error::CarapaceError;

/// Everything the hypervisor needs to know about one boot.
pub struct LaunchSpec<'a> {
    /// Copy-on-write overlay attached as the primary virtio disk.
    pub overlay: &'a Path,
    /// Seed ISO attached as a virtual optical device.
    pub seed: &'a Path,
    /// Guest RAM in MiB.
    pub memory_mb: u32,
    /// Loopback port forwarded to guest port 22.
    pub ssh_port: u16,
    /// File receiving the guest serial console.
    pub serial_log: &'a Path,
}

/// Resolved hypervisor invocation: binary plus full argument vector.
pub struct Invocation {
    pub binary: String,
    pub args: Vec<String>,
}

/// Resolve the hypervisor invocation for this host.
///
/// Selection order: `HYPERVISOR_BINARY` wins outright; otherwise the
/// binary follows the host architecture (`ARCH_OVERRIDE` substitutes the
/// detected one, at the cost of pure emulation for foreign guests).
pub fn invocation(spec: &LaunchSpec<'_>) -> Result<Invocation, CarapaceError> {
    let arch = match std::env::var("ARCH_OVERRIDE") {
        Ok(a) if !a.is_empty() => a,
        _ => std::env::consts::ARCH.to_string(),
    };
    let binary = match std::env::var("HYPERVISOR_BINARY") {
        Ok(b) if !b.is_empty() => b,
        _ => binary_for_arch(&arch)?.to_string(),
    };
    let accel = accel_enabled();
    Ok(Invocation {
        binary,
        args: build_args(&arch, accel, spec),
    })
}

/// Whether hardware acceleration will be used: on by default, force-off
/// via `ENABLE_ACCEL=0`, and silently unavailable when the kernel
/// virtualisation device cannot be opened (pure emulation boots the same
/// image, roughly 4x slower).
pub fn accel_enabled() -> bool {
    let requested = match std::env::var("ENABLE_ACCEL") {
        Ok(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"),
        Err(_) => true,
    };
    requested && kvm_available()
}

fn kvm_available() -> bool {
    std::fs::File::open("/dev/kvm").is_ok()
}

fn binary_for_arch(arch: &str) -> Result<&'static str, CarapaceError> {
    match arch {
        "x86_64" => Ok("qemu-system-x86_64"),
        "aarch64" => Ok("qemu-system-aarch64"),
        other => Err(CarapaceError::Validation {
            message: format!("unsupported host architecture '{other}' (set HYPERVISOR_BINARY)"),
        }),
    }
}

/// Assemble the full argument vector.  Pure so tests can pin the exact
/// shape without touching the environment.
fn build_args(arch: &str, accel: bool, spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(24);

    match arch {
        "aarch64" => {
            args.push("-machine".into());
            args.push("virt".into());
            args.push("-cpu".into());
            args.push(if accel { "host".into() } else { "cortex-a72".into() });
        }
        _ => {
            args.push("-machine".into());
            args.push("q35".into());
            args.push("-cpu".into());
            args.push(if accel { "host".into() } else { "max".into() });
        }
    }
    if accel {
        args.push("-enable-kvm".into());
    }

    args.push("-m".into());
    args.push(spec.memory_mb.to_string());

    args.push("-drive".into());
    args.push(format!(
        "file={},if=virtio,format=qcow2",
        spec.overlay.display()
    ));
    args.push("-drive".into());
    args.push(format!("file={},media=cdrom,format=raw", spec.seed.display()));

    args.push("-display".into());
    args.push("none".into());
    args.push("-serial".into());
    args.push(format!("file:{}", spec.serial_log.display()));

    args.push("-netdev".into());
    args.push(format!(
        "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22",
        spec.ssh_port
    ));
    args.push("-device".into());
    args.push("virtio-net-pci,netdev=net0".into());

    args
}
