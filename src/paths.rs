use std::path::{Path, PathBuf};

/// Per-runner work directory: `<tmp>/carapace-<id>/`.
///
/// Everything a boot creates lives here and is removed on shutdown; the
/// shared base image is elsewhere and never written.
pub fn work_dir(runner_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("carapace-{runner_id}"))
}

/// Copy-on-write overlay disk for one boot.
pub fn overlay_path(work_dir: &Path) -> PathBuf {
    work_dir.join("overlay.qcow2")
}

/// Ephemeral private key (mode 0600).
pub fn key_path(work_dir: &Path) -> PathBuf {
    work_dir.join("id_private")
}

/// Matching OpenSSH public key.
pub fn pub_key_path(work_dir: &Path) -> PathBuf {
    work_dir.join("id_private.pub")
}

/// First-boot seed ISO.
pub fn seed_path(work_dir: &Path) -> PathBuf {
    work_dir.join("seed.iso")
}

/// Guest serial console log, written by the hypervisor.
pub fn serial_log_path(work_dir: &Path) -> PathBuf {
    work_dir.join("boot.log")
}

/// Where the serial log is preserved after the work directory is deleted,
/// for post-mortem inspection.
pub fn postmortem_log_path(runner_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("carapace-serial-{runner_id}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_dir_is_under_temp_and_unique_per_id() {
        let a = work_dir("aaaa");
        let b = work_dir("bbbb");
        assert_ne!(a, b);
        assert!(a.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn artifact_paths_live_in_work_dir() {
        let work = work_dir("test");
        for p in [
            overlay_path(&work),
            key_path(&work),
            pub_key_path(&work),
            seed_path(&work),
            serial_log_path(&work),
        ] {
            assert!(p.starts_with(&work));
        }
    }
}
