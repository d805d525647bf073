use std::io::{Read, Seek, SeekFrom};

use crate::error::FilesystemError;

/// FAT variant, decided by cluster count (and BPB shape for FAT32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn name(&self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }
}

/// Volume geometry derived from the BIOS Parameter Block.
///
/// All `*_offset` methods return absolute byte offsets within the underlying
/// device, already shifted by the partition offset.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Bytes per sector (typically 512).
    pub bytes_per_sector: u64,
    /// Sectors per cluster.
    pub sectors_per_cluster: u64,
    /// Number of reserved sectors before the first FAT.
    pub reserved_sectors: u64,
    /// Number of FATs (typically 2).
    pub num_fats: u8,
    /// Sectors per FAT.
    pub sectors_per_fat: u64,
    /// Root directory entry count (FAT12/16 only; 0 for FAT32).
    pub root_entry_count: u16,
    /// Root cluster (FAT32 only).
    pub root_cluster: u32,
    /// Total sectors on the volume.
    pub total_sectors: u64,
    /// Total data clusters.
    pub total_clusters: u64,
    /// BPB media byte (0xF8 for hard disks).
    pub media_byte: u8,
    /// FAT type.
    pub fat_type: FatType,
    /// Byte offset of the partition within the device.
    pub partition_offset: u64,
}

impl Geometry {
    /// Absolute byte offset for a given sector number.
    pub fn sector_offset(&self, sector: u64) -> u64 {
        self.partition_offset + sector * self.bytes_per_sector
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Sectors occupied by the fixed root directory (FAT12/16; 0 for FAT32).
    pub fn root_dir_sectors(&self) -> u64 {
        ((self.root_entry_count as u64 * 32) + (self.bytes_per_sector - 1)) / self.bytes_per_sector
    }

    /// Absolute offset of the first FAT copy.
    pub fn fat_offset(&self) -> u64 {
        self.sector_offset(self.reserved_sectors)
    }

    /// Size of one FAT copy in bytes.
    pub fn fat_size_bytes(&self) -> u64 {
        self.sectors_per_fat * self.bytes_per_sector
    }

    /// Absolute offset of the fixed root directory region (FAT12/16).
    pub fn root_region_offset(&self) -> u64 {
        self.sector_offset(self.reserved_sectors + self.num_fats as u64 * self.sectors_per_fat)
    }

    /// Length of the fixed root directory region in bytes (0 for FAT32).
    pub fn root_region_len(&self) -> u64 {
        self.root_entry_count as u64 * 32
    }

    /// First sector of the data region.
    pub fn data_start_sector(&self) -> u64 {
        self.reserved_sectors + (self.num_fats as u64 * self.sectors_per_fat)
            + self.root_dir_sectors()
    }

    /// Absolute byte offset for the start of a cluster's data.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        let first_sector =
            self.data_start_sector() + (cluster as u64 - 2) * self.sectors_per_cluster;
        self.sector_offset(first_sector)
    }

    /// Highest valid cluster number (clusters are numbered from 2).
    pub fn max_cluster(&self) -> u32 {
        self.total_clusters as u32 + 1
    }

    pub fn total_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector
    }
}

/// Parse the boot sector at `partition_offset` into a [`Geometry`] and the
/// BPB volume label (if any).
pub fn parse<S: Read + Seek>(
    device: &mut S,
    partition_offset: u64,
) -> Result<(Geometry, Option<String>), FilesystemError> {
    device.seek(SeekFrom::Start(partition_offset))?;

    let mut bpb = [0u8; 512];
    device
        .read_exact(&mut bpb)
        .map_err(|e| FilesystemError::Corrupt(format!("cannot read boot sector: {e}")))?;

    // Validate jump instruction (EB xx 90 or E9 xx xx)
    if bpb[0] != 0xEB && bpb[0] != 0xE9 {
        return Err(FilesystemError::Corrupt(
            "invalid FAT boot sector: bad jump instruction".into(),
        ));
    }

    let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as u64;
    if bytes_per_sector == 0 || bytes_per_sector > 4096 {
        return Err(FilesystemError::Corrupt(format!(
            "invalid bytes per sector: {bytes_per_sector}"
        )));
    }

    let sectors_per_cluster = bpb[13] as u64;
    if sectors_per_cluster == 0 {
        return Err(FilesystemError::Corrupt(
            "invalid sectors per cluster: 0".into(),
        ));
    }

    let reserved_sectors = u16::from_le_bytes([bpb[14], bpb[15]]) as u64;
    let num_fats = bpb[16];
    if num_fats == 0 {
        return Err(FilesystemError::Corrupt("invalid FAT count: 0".into()));
    }
    let root_entry_count = u16::from_le_bytes([bpb[17], bpb[18]]);

    let total_sectors_16 = u16::from_le_bytes([bpb[19], bpb[20]]) as u64;
    let total_sectors_32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]) as u64;
    let total_sectors = if total_sectors_16 != 0 {
        total_sectors_16
    } else {
        total_sectors_32
    };

    let sectors_per_fat_16 = u16::from_le_bytes([bpb[22], bpb[23]]) as u64;
    let sectors_per_fat_32 = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]) as u64;
    let sectors_per_fat = if sectors_per_fat_16 != 0 {
        sectors_per_fat_16
    } else {
        sectors_per_fat_32
    };

    let root_dir_sectors =
        ((root_entry_count as u64 * 32) + (bytes_per_sector - 1)) / bytes_per_sector;
    let data_start_sector = reserved_sectors + (num_fats as u64 * sectors_per_fat) + root_dir_sectors;
    let data_sectors = total_sectors.saturating_sub(data_start_sector);
    let total_clusters = data_sectors / sectors_per_cluster;

    // Determine FAT type.
    //
    // The Microsoft spec uses cluster count thresholds, but trimmed images
    // may have fewer clusters than the FAT32 minimum while still using FAT32
    // on-disk structures. When the 16-bit sectors-per-FAT field is zero and
    // the root entry count is zero the BPB is FAT32 format regardless of
    // cluster count.
    let fat_type = if sectors_per_fat_16 == 0 && root_entry_count == 0 {
        FatType::Fat32
    } else if total_clusters < 4085 {
        FatType::Fat12
    } else if total_clusters < 65525 {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    let root_cluster = if fat_type == FatType::Fat32 {
        u32::from_le_bytes([bpb[44], bpb[45], bpb[46], bpb[47]])
    } else {
        0
    };

    // Volume label
    let label_offset = if fat_type == FatType::Fat32 { 71 } else { 43 };
    let label_bytes = &bpb[label_offset..label_offset + 11];
    let label_str = std::str::from_utf8(label_bytes)
        .unwrap_or("")
        .trim()
        .to_string();
    let label = if label_str.is_empty() || label_str == "NO NAME" {
        None
    } else {
        Some(label_str)
    };

    let geometry = Geometry {
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        sectors_per_fat,
        root_entry_count,
        root_cluster,
        total_sectors,
        total_clusters,
        media_byte: bpb[21],
        fat_type,
        partition_offset,
    };

    Ok((geometry, label))
}

/// Build the 512-byte boot sector for a freshly formatted volume.
pub fn build_boot_sector(geometry: &Geometry, label: Option<&str>, volume_id: u32) -> [u8; 512] {
    let mut bpb = [0u8; 512];

    bpb[0] = 0xEB;
    bpb[1] = if geometry.fat_type == FatType::Fat32 {
        0x58
    } else {
        0x3C
    };
    bpb[2] = 0x90;
    bpb[3..11].copy_from_slice(b"RUSTYFS ");

    bpb[11..13].copy_from_slice(&(geometry.bytes_per_sector as u16).to_le_bytes());
    bpb[13] = geometry.sectors_per_cluster as u8;
    bpb[14..16].copy_from_slice(&(geometry.reserved_sectors as u16).to_le_bytes());
    bpb[16] = geometry.num_fats;
    bpb[17..19].copy_from_slice(&geometry.root_entry_count.to_le_bytes());

    if geometry.total_sectors <= 0xFFFF && geometry.fat_type != FatType::Fat32 {
        bpb[19..21].copy_from_slice(&(geometry.total_sectors as u16).to_le_bytes());
    } else {
        bpb[32..36].copy_from_slice(&(geometry.total_sectors as u32).to_le_bytes());
    }

    bpb[21] = geometry.media_byte;
    // Sectors per track / heads: CHS is meaningless for image-backed volumes
    // but tools expect non-zero values.
    bpb[24..26].copy_from_slice(&63u16.to_le_bytes());
    bpb[26..28].copy_from_slice(&255u16.to_le_bytes());

    let mut label_bytes = [b' '; 11];
    if let Some(label) = label {
        for (i, b) in label.bytes().take(11).enumerate() {
            label_bytes[i] = b.to_ascii_uppercase();
        }
    } else {
        label_bytes.copy_from_slice(b"NO NAME    ");
    }

    match geometry.fat_type {
        FatType::Fat32 => {
            bpb[36..40].copy_from_slice(&(geometry.sectors_per_fat as u32).to_le_bytes());
            bpb[44..48].copy_from_slice(&geometry.root_cluster.to_le_bytes());
            // FSInfo at sector 1, backup boot sector at 6
            bpb[48..50].copy_from_slice(&1u16.to_le_bytes());
            bpb[50..52].copy_from_slice(&6u16.to_le_bytes());
            bpb[64] = 0x80; // drive number
            bpb[66] = 0x29; // extended boot signature
            bpb[67..71].copy_from_slice(&volume_id.to_le_bytes());
            bpb[71..82].copy_from_slice(&label_bytes);
            bpb[82..90].copy_from_slice(b"FAT32   ");
        }
        fat12_16 => {
            bpb[22..24].copy_from_slice(&(geometry.sectors_per_fat as u16).to_le_bytes());
            bpb[36] = 0x80; // drive number
            bpb[38] = 0x29; // extended boot signature
            bpb[39..43].copy_from_slice(&volume_id.to_le_bytes());
            bpb[43..54].copy_from_slice(&label_bytes);
            bpb[54..62].copy_from_slice(if fat12_16 == FatType::Fat12 {
                b"FAT12   "
            } else {
                b"FAT16   "
            });
        }
    }

    bpb[510] = 0x55;
    bpb[511] = 0xAA;
    bpb
}

/// Compute the number of sectors needed for one FAT copy given the partition
/// parameters and FAT type.
pub fn compute_fat_sectors(
    total_sectors: u64,
    reserved: u64,
    num_fats: u64,
    root_dir_sectors: u64,
    sectors_per_cluster: u64,
    fat_type: FatType,
    bytes_per_sector: u64,
) -> u64 {
    let avail = total_sectors.saturating_sub(reserved + root_dir_sectors);
    let bps = bytes_per_sector;
    let spc = sectors_per_cluster;
    let n = num_fats;

    match fat_type {
        FatType::Fat12 => {
            // FAT12: 1.5 bytes per entry, iterate until stable
            let mut spf = 1u64;
            loop {
                let data_sectors = avail.saturating_sub(n * spf);
                let clusters = data_sectors / spc;
                let fat_bytes = ((clusters + 2) * 3 + 1) / 2;
                let needed = (fat_bytes + bps - 1) / bps;
                if needed <= spf {
                    return spf;
                }
                spf = needed;
            }
        }
        FatType::Fat16 => {
            // Closed form: ceil(2 * (avail + 2*spc) / (bps*spc + 2*n))
            let num = 2 * (avail + 2 * spc);
            let den = bps * spc + 2 * n;
            (num + den - 1) / den
        }
        FatType::Fat32 => {
            let num = 4 * (avail + 2 * spc);
            let den = bps * spc + 4 * n;
            (num + den - 1) / den
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fat16_geometry() -> Geometry {
        let total_sectors = 65536u64; // 32 MB at 512 b/s
        let spf = compute_fat_sectors(total_sectors, 4, 2, 32, 4, FatType::Fat16, 512);
        Geometry {
            bytes_per_sector: 512,
            sectors_per_cluster: 4,
            reserved_sectors: 4,
            num_fats: 2,
            sectors_per_fat: spf,
            root_entry_count: 512,
            root_cluster: 0,
            total_sectors,
            total_clusters: (total_sectors - 4 - 2 * spf - 32) / 4,
            media_byte: 0xF8,
            fat_type: FatType::Fat16,
            partition_offset: 0,
        }
    }

    #[test]
    fn test_boot_sector_round_trip() {
        let geometry = fat16_geometry();
        let bpb = build_boot_sector(&geometry, Some("TESTVOL"), 0x1234_5678);
        let mut device = Cursor::new(bpb.to_vec());

        let (parsed, label) = parse(&mut device, 0).unwrap();
        assert_eq!(parsed.fat_type, FatType::Fat16);
        assert_eq!(parsed.bytes_per_sector, 512);
        assert_eq!(parsed.sectors_per_cluster, 4);
        assert_eq!(parsed.sectors_per_fat, geometry.sectors_per_fat);
        assert_eq!(parsed.root_entry_count, 512);
        assert_eq!(label.as_deref(), Some("TESTVOL"));
    }

    #[test]
    fn test_parse_rejects_bad_jump() {
        let mut device = Cursor::new(vec![0u8; 512]);
        assert!(parse(&mut device, 0).is_err());
    }

    #[test]
    fn test_cluster_offset() {
        let geometry = fat16_geometry();
        let data_start = geometry.data_start_sector() * 512;
        assert_eq!(geometry.cluster_offset(2), data_start);
        assert_eq!(
            geometry.cluster_offset(3),
            data_start + geometry.cluster_size()
        );
    }

    #[test]
    fn test_fat12_sectors_converge() {
        // 1.44 MB floppy: 2880 sectors, 1 sector/cluster, 1 reserved, 2 FATs
        let spf = compute_fat_sectors(2880, 1, 2, 14, 1, FatType::Fat12, 512);
        assert_eq!(spf, 9);
    }
}
