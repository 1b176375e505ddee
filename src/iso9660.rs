//! Minimal ISO 9660 image generator for NoCloud seed disks.
//!
//! # Background
//!
//! ISO 9660 is the 1988 CD-ROM filesystem standard.  Every multi-byte
//! integer is recorded twice — once little-endian, once big-endian — so
//! that readers on either architecture can consume images without
//! byte-swapping, and all allocation happens in 2048-byte sectors.
//!
//! # Why we need this
//!
//! The guest's first-boot agent looks for a small ISO with volume label
//! `CIDATA` carrying `meta-data` and `user-data`.  The files sit flat in
//! the root directory with plain upper-case identifiers, which the Linux
//! iso9660 driver maps back to their lower-case names, so no Rock Ridge
//! extensions are required.  Generating the image in-process keeps seed
//! assembly free of external tooling.
//!
//! # Scope
//!
//! Flat images only: files in the root directory, no subdirectories, no
//! extensions, no boot records.  This is not a general-purpose ISO
//! authoring library — it does exactly what seed images need.
//!
//! # References
//!
//! - ECMA-119 (ISO 9660): <https://ecma-international.org/publications-and-standards/standards/ecma-119/>

/// Each sector (logical block) in an ISO 9660 image is 2048 bytes.  This is
/// the native CD-ROM sector size and is hardcoded in the standard.
pub const SECTOR_SIZE: usize = 2048;

/// A file to include in the image's root directory.
pub struct IsoFile<'a> {
    /// The filename as the guest sees it (e.g. `"meta-data"`).  Stored as
    /// the upper-cased `NAME.;1` identifier.
    pub name: &'a str,
    /// The file contents (arbitrary bytes).
    pub data: &'a [u8],
}

/// Build a flat ISO 9660 image.
///
/// Returns the complete image as a byte vector, ready to be written to disk.
/// `volume_id` must be ASCII, max 32 chars (e.g. `"CIDATA"`).
///
/// # Panics
///
/// Panics if `volume_id` is not ASCII or exceeds 32 characters.
pub fn build_iso(volume_id: &str, files: &[IsoFile<'_>]) -> Vec<u8> {
    assert!(
        volume_id.len() <= 32 && volume_id.is_ascii(),
        "volume_id must be ASCII, max 32 chars"
    );

    // ┌──────────┬────────────────────────────────────────────────────┐
    // │ Sectors  │ Contents                                           │
    // ├──────────┼────────────────────────────────────────────────────┤
    // │  0 – 15  │ System Area (all zeros, reserved for boot loaders) │
    // │    16    │ Primary Volume Descriptor (PVD)                    │
    // │    17    │ Volume Descriptor Set Terminator                   │
    // │    18    │ Path Table (L-type, little-endian)                 │
    // │    19    │ Path Table (M-type, big-endian)                    │
    // │    20    │ Root Directory (., .., and file entries)           │
    // │  21+     │ File data (each file starts on a sector boundary)  │
    // └──────────┴────────────────────────────────────────────────────┘

    let root_dir_sector = 20u32;
    let first_file_sector = 21usize;

    // Pre-calculate where each file's data will land; every file starts on
    // a fresh sector boundary.
    let mut file_layout: Vec<(usize, usize)> = Vec::with_capacity(files.len());
    let mut next_sector = first_file_sector;
    for f in files {
        file_layout.push((next_sector, f.data.len()));
        next_sector += sectors_for(f.data.len());
    }
    let total_sectors = next_sector;

    let mut iso = vec![0u8; total_sectors * SECTOR_SIZE];

    write_pvd(&mut iso, volume_id, total_sectors as u32, root_dir_sector);
    write_terminator(&mut iso);
    write_path_table(&mut iso, 18, root_dir_sector, Endian::Little);
    write_path_table(&mut iso, 19, root_dir_sector, Endian::Big);
    write_root_directory(&mut iso, root_dir_sector, files, &file_layout);

    for (i, f) in files.iter().enumerate() {
        let offset = file_layout[i].0 * SECTOR_SIZE;
        iso[offset..offset + f.data.len()].copy_from_slice(f.data);
    }

    iso
}

/// Write the Primary Volume Descriptor at sector 16.
///
/// Key fields and their byte offsets within the sector:
///
/// | Offset | Size | Field                                           |
/// |--------|------|-------------------------------------------------|
/// |   0    |   1  | Type (1 = PVD)                                  |
/// |   1    |   5  | Standard Identifier (`"CD001"`)                 |
/// |   6    |   1  | Version (1)                                     |
/// |   8    |  32  | System Identifier (space-padded)                |
/// |  40    |  32  | Volume Identifier (space-padded) — the "label"  |
/// |  80    |   8  | Volume Space Size (both-endian) — total sectors |
/// | 120    |   4  | Volume Set Size (both-endian)                   |
/// | 124    |   4  | Volume Sequence Number (both-endian)            |
/// | 128    |   4  | Logical Block Size (both-endian) — always 2048  |
/// | 132    |   8  | Path Table Size (both-endian)                   |
/// | 140    |   4  | L Path Table Location (LE u32)                  |
/// | 148    |   4  | M Path Table Location (BE u32)                  |
/// | 156    |  34  | Root Directory Record (inline)                  |
/// | 190    | 624  | Identifier strings (space-padded)               |
/// | 881    |   1  | File Structure Version (1)                      |
fn write_pvd(iso: &mut [u8], volume_id: &str, total_sectors: u32, root_dir_sector: u32) {
    let pvd = &mut iso[16 * SECTOR_SIZE..17 * SECTOR_SIZE];
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;

    // System and volume identifiers are space-padded fixed fields.
    pvd[8..40].fill(b' ');
    pvd[40..72].fill(b' ');
    let vid = volume_id.as_bytes();
    pvd[40..40 + vid.len()].copy_from_slice(vid);

    put_u32_both(&mut pvd[80..88], total_sectors);
    put_u16_both(&mut pvd[120..124], 1);
    put_u16_both(&mut pvd[124..128], 1);
    put_u16_both(&mut pvd[128..132], SECTOR_SIZE as u16);
    put_u32_both(&mut pvd[132..140], 10); // path table = one 10-byte root entry
    pvd[140..144].copy_from_slice(&18u32.to_le_bytes());
    pvd[148..152].copy_from_slice(&19u32.to_be_bytes());

    // The root directory record is embedded directly in the PVD at byte 156.
    // Its identifier is a single 0x00 byte (meaning "self").
    let root = dir_record(root_dir_sector, SECTOR_SIZE as u32, b"\x00", true);
    pvd[156..156 + root.len()].copy_from_slice(&root);

    // Remaining identifier fields (publisher, preparer, etc.) — space-padded.
    pvd[190..814].fill(b' ');
    pvd[881] = 1;
}

/// Write the Volume Descriptor Set Terminator at sector 17.
///
/// Readers scan descriptors from sector 16 until they find type 255.  We
/// only emit the PVD, so the terminator goes directly after it.
fn write_terminator(iso: &mut [u8]) {
    let term = &mut iso[17 * SECTOR_SIZE..18 * SECTOR_SIZE];
    term[0] = 255;
    term[1..6].copy_from_slice(b"CD001");
    term[6] = 1;
}

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

/// Write a path table at the given sector.
///
/// The standard requires two copies of the directory index — L-type
/// (little-endian) and M-type (big-endian).  With only the root directory,
/// each table is a single 10-byte entry:
///
/// | Offset | Size | Field                                      |
/// |--------|------|--------------------------------------------|
/// |   0    |   1  | Directory Identifier Length (1 for root)   |
/// |   1    |   1  | Extended Attribute Record Length (0)       |
/// |   2    |   4  | Extent Location (sector of the directory)  |
/// |   6    |   2  | Parent Directory Number (1 = self for root)|
/// |   8    |   1  | Directory Identifier (`0x00` for root)     |
/// |   9    |   1  | Padding (to even length)                   |
fn write_path_table(iso: &mut [u8], sector: usize, root_extent: u32, endian: Endian) {
    let buf = &mut iso[sector * SECTOR_SIZE..];
    buf[0] = 1;
    buf[1] = 0;
    match endian {
        Endian::Little => {
            buf[2..6].copy_from_slice(&root_extent.to_le_bytes());
            buf[6..8].copy_from_slice(&1u16.to_le_bytes());
        }
        Endian::Big => {
            buf[2..6].copy_from_slice(&root_extent.to_be_bytes());
            buf[6..8].copy_from_slice(&1u16.to_be_bytes());
        }
    }
    buf[8] = 0x00;
    buf[9] = 0x00;
}

/// Write the root directory extent: `.`, `..`, then one record per file.
fn write_root_directory(
    iso: &mut [u8],
    root_sector: u32,
    files: &[IsoFile<'_>],
    file_layout: &[(usize, usize)],
) {
    let mut pos = root_sector as usize * SECTOR_SIZE;
    let root_size = SECTOR_SIZE as u32;

    // "." and ".." — for the root directory, parent is itself.
    for ident in [&b"\x00"[..], &b"\x01"[..]] {
        let rec = dir_record(root_sector, root_size, ident, true);
        iso[pos..pos + rec.len()].copy_from_slice(&rec);
        pos += rec.len();
    }

    for (i, f) in files.iter().enumerate() {
        let (sector, size) = file_layout[i];
        let ident = to_identifier(f.name);
        let rec = dir_record(sector as u32, size as u32, ident.as_bytes(), false);
        iso[pos..pos + rec.len()].copy_from_slice(&rec);
        pos += rec.len();
    }
}

/// Build a directory record as a byte vector.
///
/// Each record describes one file or directory:
///
/// | Offset    | Size | Field                                               |
/// |-----------|------|-----------------------------------------------------|
/// |  0        |   1  | Record Length (total bytes, including this field)   |
/// |  1        |   1  | Extended Attribute Record Length (0)                |
/// |  2        |   8  | Extent Location (both-endian u32) — starting sector |
/// | 10        |   8  | Data Length (both-endian u32) — size in bytes       |
/// | 18        |   7  | Recording Date/Time                                 |
/// | 25        |   1  | File Flags (bit 1 = directory)                      |
/// | 26        |   2  | File Unit Size / Interleave Gap (0)                 |
/// | 28        |   4  | Volume Sequence Number (both-endian u16)            |
/// | 32        |   1  | File Identifier Length                              |
/// | 33        |   N  | File Identifier                                     |
/// | 33+N      |  pad | Padding byte when N is even (record length is even) |
fn dir_record(extent: u32, size: u32, identifier: &[u8], is_dir: bool) -> Vec<u8> {
    let ident_len = identifier.len();
    let padding = if ident_len.is_multiple_of(2) { 1 } else { 0 };
    let record_len = 33 + ident_len + padding;
    let mut buf = vec![0u8; record_len];
    buf[0] = record_len as u8;
    put_u32_both(&mut buf[2..10], extent);
    put_u32_both(&mut buf[10..18], size);
    buf[25] = if is_dir { 0x02 } else { 0x00 };
    put_u16_both(&mut buf[28..32], 1);
    buf[32] = ident_len as u8;
    buf[33..33 + ident_len].copy_from_slice(identifier);
    buf
}

/// Convert a filename to its root-directory identifier.
///
/// Seed filenames are short and dot-free, so the identifier is simply the
/// upper-cased name followed by the conventional `.;1` suffix (empty
/// extension, version 1):
///
///   "meta-data" → "META-DATA.;1"
///   "user-data" → "USER-DATA.;1"
///
/// The guest kernel lower-cases the identifier and strips the version
/// suffix, yielding the original name.
fn to_identifier(name: &str) -> String {
    format!("{}.;1", name.to_ascii_uppercase())
}

/// How many sectors are needed to hold `bytes` of data.
/// Empty files still occupy one sector.
fn sectors_for(bytes: usize) -> usize {
    if bytes == 0 {
        1
    } else {
        bytes.div_ceil(SECTOR_SIZE)
    }
}

/// Write a u32 in both-endian format: 4 bytes LE followed by 4 bytes BE.
fn put_u32_both(buf: &mut [u8], val: u32) {
    buf[0..4].copy_from_slice(&val.to_le_bytes());
    buf[4..8].copy_from_slice(&val.to_be_bytes());
}

/// Write a u16 in both-endian format: 2 bytes LE followed by 2 bytes BE.
fn put_u16_both(buf: &mut [u8], val: u16) {
    buf[0..2].copy_from_slice(&val.to_le_bytes());
    buf[2..4].copy_from_slice(&val.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_iso() -> Vec<u8> {
        build_iso(
            "CIDATA",
            &[
                IsoFile {
                    name: "meta-data",
                    data: b"instance-id: test\n",
                },
                IsoFile {
                    name: "user-data",
                    data: b"#cloud-config\n",
                },
            ],
        )
    }

    #[test]
    fn iso_has_cd001_magic() {
        let iso = sample_iso();
        assert_eq!(&iso[16 * SECTOR_SIZE + 1..16 * SECTOR_SIZE + 6], b"CD001");
    }

    #[test]
    fn iso_system_area_is_zeroed() {
        let iso = sample_iso();
        assert!(iso[..16 * SECTOR_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn iso_volume_id_is_space_padded() {
        let iso = sample_iso();
        let field = &iso[16 * SECTOR_SIZE + 40..16 * SECTOR_SIZE + 72];
        assert_eq!(&field[..6], b"CIDATA");
        assert!(field[6..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn iso_has_terminator_at_sector_17() {
        let iso = sample_iso();
        assert_eq!(iso[17 * SECTOR_SIZE], 255);
        assert_eq!(&iso[17 * SECTOR_SIZE + 1..17 * SECTOR_SIZE + 6], b"CD001");
    }

    #[test]
    fn iso_size_is_sector_aligned() {
        let iso = sample_iso();
        assert_eq!(iso.len() % SECTOR_SIZE, 0);
    }

    #[test]
    fn iso_path_tables_point_to_root() {
        let iso = sample_iso();
        let l = &iso[18 * SECTOR_SIZE..];
        assert_eq!(u32::from_le_bytes([l[2], l[3], l[4], l[5]]), 20);
        let m = &iso[19 * SECTOR_SIZE..];
        assert_eq!(u32::from_be_bytes([m[2], m[3], m[4], m[5]]), 20);
    }

    #[test]
    fn iso_root_directory_has_dot_entries() {
        let iso = sample_iso();
        let root = 20 * SECTOR_SIZE;
        assert_eq!(iso[root + 32], 1); // identifier length
        assert_eq!(iso[root + 33], 0x00); // "." = 0x00
        assert_eq!(iso[root + 25] & 0x02, 0x02); // directory flag
    }

    #[test]
    fn iso_contains_file_identifiers() {
        let iso = sample_iso();
        let has = |needle: &[u8]| iso.windows(needle.len()).any(|w| w == needle);
        assert!(has(b"META-DATA.;1"), "missing meta-data identifier");
        assert!(has(b"USER-DATA.;1"), "missing user-data identifier");
    }

    #[test]
    fn iso_file_data_starts_at_sector_21() {
        let iso = sample_iso();
        let start = 21 * SECTOR_SIZE;
        assert_eq!(&iso[start..start + 18], b"instance-id: test\n");
        // second file on the next sector boundary
        let second = 22 * SECTOR_SIZE;
        assert_eq!(&iso[second..second + 14], b"#cloud-config\n");
    }

    #[test]
    fn iso_directory_record_sizes_are_both_endian() {
        let iso = sample_iso();
        // The meta-data record's data-length field must agree in both orders.
        let root = &iso[20 * SECTOR_SIZE..21 * SECTOR_SIZE];
        let mut pos = 0;
        let mut found = false;
        while root[pos] != 0 {
            let len = root[pos] as usize;
            let ident_len = root[pos + 32] as usize;
            let ident = &root[pos + 33..pos + 33 + ident_len];
            if ident == b"META-DATA.;1" {
                let le = u32::from_le_bytes(root[pos + 10..pos + 14].try_into().unwrap());
                let be = u32::from_be_bytes(root[pos + 14..pos + 18].try_into().unwrap());
                assert_eq!(le, 18);
                assert_eq!(le, be);
                found = true;
            }
            pos += len;
        }
        assert!(found, "meta-data record not present in root directory");
    }

    #[test]
    fn identifier_mangling() {
        assert_eq!(to_identifier("meta-data"), "META-DATA.;1");
        assert_eq!(to_identifier("user-data"), "USER-DATA.;1");
    }

    #[test]
    fn iso_empty_file_occupies_one_sector() {
        let iso = build_iso(
            "TEST",
            &[IsoFile {
                name: "empty",
                data: b"",
            }],
        );
        assert_eq!(iso.len(), 22 * SECTOR_SIZE);
    }

    #[test]
    fn iso_large_file_spans_sectors() {
        let big = vec![0xA5u8; 5000]; // > 2 sectors
        let iso = build_iso(
            "TEST",
            &[
                IsoFile {
                    name: "big",
                    data: &big,
                },
                IsoFile {
                    name: "tiny",
                    data: b"x",
                },
            ],
        );
        // system(16) + pvd + terminator + 2 path tables + rootdir + big(3) + tiny(1)
        assert_eq!(iso.len(), (16 + 1 + 1 + 2 + 1 + 3 + 1) * SECTOR_SIZE);
        let file_start = 21 * SECTOR_SIZE;
        assert_eq!(&iso[file_start..file_start + 5000], big.as_slice());
        // tiny lands after big's three sectors
        assert_eq!(iso[24 * SECTOR_SIZE], b'x');
    }
}
