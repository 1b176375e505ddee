//! Minimal QCOW2 overlay generator.
//!
//! # Background
//!
//! QCOW2 (QEMU Copy-On-Write version 2) is the native disk format for
//! QEMU/KVM.  An overlay image references a read-only *backing file* in its
//! header; reads fall through to the backing file until the guest writes a
//! cluster, at which point the cluster is allocated in the overlay.  A
//! fresh overlay is ~1 MiB on disk regardless of the virtual disk size.
//!
//! # Why we need this
//!
//! Every VM boot gets a throwaway overlay backed by the shared base image.
//! The base is never written; discarding the overlay discards everything
//! the guest did.  Generating the overlay directly keeps the runner free
//! of a `qemu-img` dependency (the same approach as the ISO generator).
//!
//! # Scope
//!
//! Overlay images only — QCOW2 v2, 64 KB clusters, no encryption, no
//! compression, no snapshots.
//!
//! # Format overview
//!
//! A fresh overlay needs only metadata — no data clusters are allocated
//! until the guest writes:
//!
//! ```text
//! ┌───────────┬──────────────────────────────────────────────────┐
//! │  Cluster  │ Contents                                         │
//! ├───────────┼──────────────────────────────────────────────────┤
//! │     0     │ Header (72 bytes) + backing file path + padding  │
//! │     1     │ L1 table (all zeros — no data allocated)         │
//! │     2     │ Refcount table (one entry → cluster 3)           │
//! │     3     │ Refcount block (marks clusters 0–3 as used)      │
//! └───────────┴──────────────────────────────────────────────────┘
//! ```
//!
//! # References
//!
//! - QEMU QCOW2 spec: <https://github.com/qemu/qemu/blob/master/docs/interop/qcow2.txt>

use std::io::Read;
use std::path::Path;

use crate::error::CarapaceError;

/// Cluster size: 64 KB (2^16 bytes), the `qemu-img` default.
const CLUSTER_BITS: u32 = 16;
const CLUSTER_SIZE: usize = 1 << CLUSTER_BITS;

/// QCOW2 magic number: the ASCII bytes `QFI` followed by `0xFB`.
const QCOW2_MAGIC: u32 = 0x514649FB;

/// Version 2 is the most widely compatible and sufficient for overlays.
const QCOW2_VERSION: u32 = 2;

/// Create a QCOW2 overlay at `overlay_path` backed by `base_image`.
///
/// The base must be an existing QCOW2 image; its virtual size is read from
/// the header and copied into the overlay.  The backing path is stored in
/// absolute canonical form so the overlay works from any directory.
pub fn create_overlay(base_image: &Path, overlay_path: &Path) -> Result<(), CarapaceError> {
    if let Some(parent) = overlay_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CarapaceError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let canonical = std::fs::canonicalize(base_image).map_err(|e| {
        CarapaceError::io(format!("resolving base image path {}", base_image.display()), e)
    })?;

    // The backing file's virtual size lives at header bytes 24..32.
    let mut header = [0u8; 32];
    let mut f = std::fs::File::open(&canonical)
        .map_err(|e| CarapaceError::io(format!("opening base image {}", canonical.display()), e))?;
    f.read_exact(&mut header).map_err(|e| {
        CarapaceError::io(format!("reading base image header {}", canonical.display()), e)
    })?;
    let magic = u32::from_be_bytes(header[0..4].try_into().expect("slice is 4 bytes"));
    if magic != QCOW2_MAGIC {
        return Err(CarapaceError::Validation {
            message: format!("{} is not a qcow2 image", canonical.display()),
        });
    }
    let virtual_size = u64::from_be_bytes(header[24..32].try_into().expect("slice is 8 bytes"));

    let image = build_overlay(virtual_size, &canonical.to_string_lossy());

    std::fs::write(overlay_path, &image).map_err(|e| {
        CarapaceError::io(format!("writing overlay {}", overlay_path.display()), e)
    })?;

    tracing::debug!(
        overlay = %overlay_path.display(),
        backing = %canonical.display(),
        "created qcow2 overlay"
    );
    Ok(())
}

/// Build a complete overlay image as a byte vector.
///
/// The 72-byte v2 header (all fields big-endian):
///
///   Offset  Size  Field
///   ──────  ────  ─────
///     0       4   Magic number (0x514649FB)
///     4       4   Version (2)
///     8       8   Backing file offset (72 = right after the header)
///    16       4   Backing file name length
///    20       4   Cluster bits (16 → 64 KB clusters)
///    24       8   Virtual size in bytes
///    32       4   Encryption method (0 = none)
///    36       4   L1 table entry count
///    40       8   L1 table offset (cluster 1)
///    48       8   Refcount table offset (cluster 2)
///    56       4   Refcount table clusters (1)
///    60      12   Snapshot count + offset (0)
fn build_overlay(virtual_size: u64, backing_path: &str) -> Vec<u8> {
    let mut image = vec![0u8; CLUSTER_SIZE * 4];
    let backing_bytes = backing_path.as_bytes();

    write_be32(&mut image, 0, QCOW2_MAGIC);
    write_be32(&mut image, 4, QCOW2_VERSION);
    write_be64(&mut image, 8, 72); // backing file offset
    write_be32(&mut image, 16, backing_bytes.len() as u32);
    write_be32(&mut image, 20, CLUSTER_BITS);
    write_be64(&mut image, 24, virtual_size);
    write_be32(&mut image, 36, l1_table_entries(virtual_size));
    write_be64(&mut image, 40, CLUSTER_SIZE as u64); // L1 table at cluster 1
    write_be64(&mut image, 48, (CLUSTER_SIZE * 2) as u64); // refcount table at cluster 2
    write_be32(&mut image, 56, 1);

    // Backing file path sits right after the header, still within cluster 0.
    image[72..72 + backing_bytes.len()].copy_from_slice(backing_bytes);

    // Cluster 1 is the L1 table: all zeros means no data allocated yet.

    // Cluster 2: refcount table with one entry pointing at the refcount
    // block in cluster 3.
    write_be64(&mut image, CLUSTER_SIZE * 2, (CLUSTER_SIZE * 3) as u64);

    // Cluster 3: refcount block — 16-bit counts marking clusters 0–3 used.
    for i in 0..4 {
        write_be16(&mut image, CLUSTER_SIZE * 3 + i * 2, 1);
    }

    image
}

/// L1 entries needed for a given virtual size.  One L1 entry covers an L2
/// table's worth of data: (64 KB / 8) entries × 64 KB clusters = 512 MB.
fn l1_table_entries(virtual_size: u64) -> u32 {
    let bytes_per_l1 = (CLUSTER_SIZE as u64 / 8) * CLUSTER_SIZE as u64;
    virtual_size.div_ceil(bytes_per_l1) as u32
}

// QCOW2 uses big-endian for all multi-byte fields, regardless of the host.

fn write_be16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_be_bytes());
}

fn write_be32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

fn write_be64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}
