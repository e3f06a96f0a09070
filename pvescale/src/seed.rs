//! Cloud-init seed generation.
//!
//! A seed is the pair of NoCloud files (`meta-data`, `user-data`) that make
//! a freshly imported cloud image boot as a uniquely named k3s agent and
//! join the cluster with the provider's node labels. The pair is a pure
//! function of `(group, vmid, hostname, cluster config)`; building it twice
//! yields byte-identical output, so re-running the create pipeline can
//! safely overwrite an existing `seed-<vmid>.iso`.

use crate::config::ClusterConfig;
use crate::kube::{GROUP_LABEL, VMID_LABEL};

/// The two NoCloud seed files for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SeedFiles {
    /// `meta-data` content.
    pub meta_data: Vec<u8>,
    /// `user-data` content (`#cloud-config`).
    pub user_data: Vec<u8>,
}

/// Deterministic ISO volume name for a vmid.
pub fn iso_volume(vmid: u32) -> String {
    format!("seed-{vmid}.iso")
}

/// Builds the seed file pair for one VM.
pub fn build(group_id: &str, vmid: u32, hostname: &str, cluster: &ClusterConfig) -> SeedFiles {
    let meta_data = format!(
        "instance-id: pvescale-{group_id}-{vmid}\nlocal-hostname: {hostname}\n"
    )
    .into_bytes();

    let user_data = format!(
        "#cloud-config\n\
         hostname: {hostname}\n\
         ssh_authorized_keys:\n\
         \x20 - {ssh_key}\n\
         runcmd:\n\
         \x20 - curl -sfL https://get.k3s.io | \
         INSTALL_K3S_VERSION='{version}' K3S_URL='{server}' K3S_TOKEN='{token}' \
         sh -s - agent --node-label '{group_label}={group_id}' --node-label '{vmid_label}={vmid}'\n",
        ssh_key = cluster.ssh_public_key,
        version = cluster.k3s_version,
        server = cluster.server_url,
        token = cluster.token,
        group_label = GROUP_LABEL,
        vmid_label = VMID_LABEL,
    )
    .into_bytes();

    SeedFiles {
        meta_data,
        user_data,
    }
}

/// Packs a seed into an ISO9660 image with the `CIDATA` volume label
/// cloud-init's NoCloud datasource looks for.
pub fn build_iso(seed: &SeedFiles) -> Vec<u8> {
    iso9660::build(
        "CIDATA",
        &[
            ("META-DATA;1", &seed.meta_data),
            ("USER-DATA;1", &seed.user_data),
        ],
    )
}

// ---------------------------------------------------------------------------
// Minimal ISO9660 image generator (pure Rust, no external dependencies)
// ---------------------------------------------------------------------------

// All values in this module are known-small constants; truncation is impossible.
#[allow(clippy::cast_possible_truncation)]
mod iso9660 {
    //! Generates a minimal single-directory ISO9660 image.
    //!
    //! Layout (2048-byte sectors):
    //!
    //! | Sector | Contents                          |
    //! |--------|-----------------------------------|
    //! | 0–15   | System area (zeros)               |
    //! | 16     | Primary volume descriptor         |
    //! | 17     | Volume descriptor set terminator  |
    //! | 18     | Type-L path table                 |
    //! | 19     | Type-M path table                 |
    //! | 20     | Root directory                    |
    //! | 21+    | File extents, one per file        |
    //!
    //! All timestamps are the "unspecified" encoding, so output depends only
    //! on the volume label and file contents.

    /// Sector size mandated by the format.
    const SECTOR: usize = 2048;
    /// Standard identifier present in every volume descriptor.
    const STANDARD_ID: &[u8; 5] = b"CD001";
    /// First data sector: system area + PVD + terminator + two path tables
    /// + root directory.
    const FIRST_FILE_SECTOR: u32 = 21;
    /// Sector of the root directory extent.
    const ROOT_DIR_SECTOR: u32 = 20;

    /// Builds an image holding `files` in the root directory.
    ///
    /// File identifiers are recorded verbatim. `-` is outside the strict
    /// d-character set, but the Linux iso9660 driver preserves it and maps
    /// `NAME;1` to lowercase `name`, which is exactly what cloud-init
    /// requires for `meta-data`/`user-data`.
    pub fn build(volume_id: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let file_sectors: Vec<u32> = files
            .iter()
            .map(|(_, data)| (data.len().div_ceil(SECTOR)).max(1) as u32)
            .collect();
        let total_sectors = FIRST_FILE_SECTOR + file_sectors.iter().sum::<u32>();

        let mut buf = vec![0u8; total_sectors as usize * SECTOR];

        // -- Root directory sector --
        let root = root_directory(files, &file_sectors);
        let root_start = ROOT_DIR_SECTOR as usize * SECTOR;
        buf[root_start..root_start + root.len()].copy_from_slice(&root);

        // -- File extents --
        let mut lba = FIRST_FILE_SECTOR;
        for ((_, data), sectors) in files.iter().zip(&file_sectors) {
            let start = lba as usize * SECTOR;
            buf[start..start + data.len()].copy_from_slice(data);
            lba += sectors;
        }

        // -- Path tables (single entry: the root) --
        let mut l_table = Vec::with_capacity(10);
        l_table.extend_from_slice(&[1, 0]); // identifier length, ext attr
        l_table.extend_from_slice(&ROOT_DIR_SECTOR.to_le_bytes());
        l_table.extend_from_slice(&1u16.to_le_bytes()); // parent dir number
        l_table.extend_from_slice(&[0, 0]); // identifier 0x00 + pad
        let mut m_table = Vec::with_capacity(10);
        m_table.extend_from_slice(&[1, 0]);
        m_table.extend_from_slice(&ROOT_DIR_SECTOR.to_be_bytes());
        m_table.extend_from_slice(&1u16.to_be_bytes());
        m_table.extend_from_slice(&[0, 0]);
        let l_start = 18 * SECTOR;
        buf[l_start..l_start + l_table.len()].copy_from_slice(&l_table);
        let m_start = 19 * SECTOR;
        buf[m_start..m_start + m_table.len()].copy_from_slice(&m_table);

        // -- Primary volume descriptor (sector 16) --
        let pvd = &mut buf[16 * SECTOR..17 * SECTOR];
        pvd[0] = 1; // type: primary
        pvd[1..6].copy_from_slice(STANDARD_ID);
        pvd[6] = 1; // version
        fill_spaces(&mut pvd[8..40]); // system identifier
        fill_spaces(&mut pvd[40..72]); // volume identifier
        let vol = volume_id.as_bytes();
        pvd[40..40 + vol.len().min(32)].copy_from_slice(&vol[..vol.len().min(32)]);
        write_both_u32(pvd, 80, total_sectors); // volume space size
        write_both_u16(pvd, 120, 1); // volume set size
        write_both_u16(pvd, 124, 1); // volume sequence number
        write_both_u16(pvd, 128, SECTOR as u16); // logical block size
        write_both_u32(pvd, 132, l_table.len() as u32); // path table size
        pvd[140..144].copy_from_slice(&18u32.to_le_bytes()); // L path table
        pvd[148..152].copy_from_slice(&19u32.to_be_bytes()); // M path table
        let root_record = dir_record(&[0x00], ROOT_DIR_SECTOR, SECTOR as u32, true);
        pvd[156..156 + root_record.len()].copy_from_slice(&root_record);
        fill_spaces(&mut pvd[190..318]); // volume set identifier
        fill_spaces(&mut pvd[318..446]); // publisher
        fill_spaces(&mut pvd[446..574]); // data preparer
        fill_spaces(&mut pvd[574..702]); // application
        fill_spaces(&mut pvd[702..739]); // copyright file
        fill_spaces(&mut pvd[739..776]); // abstract file
        fill_spaces(&mut pvd[776..813]); // bibliographic file
        for off in [813, 830, 847, 864] {
            // "Unspecified" long date: sixteen '0' digits + zero offset.
            pvd[off..off + 16].fill(b'0');
            pvd[off + 16] = 0;
        }
        pvd[881] = 1; // file structure version

        // -- Set terminator (sector 17) --
        let term = &mut buf[17 * SECTOR..18 * SECTOR];
        term[0] = 255;
        term[1..6].copy_from_slice(STANDARD_ID);
        term[6] = 1;

        buf
    }

    /// Assembles the root directory extent: `.`, `..`, then one record per
    /// file in the order given.
    fn root_directory(files: &[(&str, &[u8])], file_sectors: &[u32]) -> Vec<u8> {
        let mut dir = Vec::with_capacity(SECTOR);
        dir.extend_from_slice(&dir_record(&[0x00], ROOT_DIR_SECTOR, SECTOR as u32, true));
        dir.extend_from_slice(&dir_record(&[0x01], ROOT_DIR_SECTOR, SECTOR as u32, true));
        let mut lba = FIRST_FILE_SECTOR;
        for ((name, data), sectors) in files.iter().zip(file_sectors) {
            dir.extend_from_slice(&dir_record(name.as_bytes(), lba, data.len() as u32, false));
            lba += sectors;
        }
        dir
    }

    /// Encodes a single directory record.
    fn dir_record(identifier: &[u8], extent: u32, data_len: u32, is_dir: bool) -> Vec<u8> {
        let name_len = identifier.len();
        let mut len = 33 + name_len;
        if len % 2 == 1 {
            len += 1; // records are padded to even length
        }
        let mut rec = vec![0u8; len];
        rec[0] = len as u8;
        write_both_u32(&mut rec, 2, extent);
        write_both_u32(&mut rec, 10, data_len);
        // Recording date (7 bytes at 18) left zeroed for determinism.
        rec[25] = if is_dir { 0x02 } else { 0x00 };
        write_both_u16(&mut rec, 28, 1); // volume sequence number
        rec[32] = name_len as u8;
        rec[33..33 + name_len].copy_from_slice(identifier);
        rec
    }

    /// Writes a both-endian (LE then BE) `u16`.
    fn write_both_u16(buf: &mut [u8], offset: usize, val: u16) {
        buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
        buf[offset + 2..offset + 4].copy_from_slice(&val.to_be_bytes());
    }

    /// Writes a both-endian (LE then BE) `u32`.
    fn write_both_u32(buf: &mut [u8], offset: usize, val: u32) {
        buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
        buf[offset + 4..offset + 8].copy_from_slice(&val.to_be_bytes());
    }

    /// Fills a field with the `0x20` padding the format requires.
    fn fill_spaces(buf: &mut [u8]) {
        buf.fill(b' ');
    }
}
