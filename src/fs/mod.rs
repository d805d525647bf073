pub mod entry;
pub mod fat;
pub mod filesystem;

use std::io::{Read, Seek, Write};

use crate::error::FilesystemError;
use filesystem::Filesystem;

/// Open a filesystem for browsing within a partition.
///
/// `reader` must be seekable and positioned at the partition start.
/// `partition_type` is the MBR partition type byte.
pub fn open_filesystem<S: Read + Write + Seek + Send + 'static>(
    reader: S,
    partition_offset: u64,
    partition_type: u8,
) -> Result<Box<dyn Filesystem>, FilesystemError> {
    match partition_type {
        // FAT12
        0x01 => Ok(Box::new(fat::FatFilesystem::open(
            reader,
            partition_offset,
        )?)),
        // FAT16
        0x04 | 0x06 | 0x0E | 0x14 | 0x16 | 0x1E => Ok(Box::new(fat::FatFilesystem::open(
            reader,
            partition_offset,
        )?)),
        // FAT32
        0x0B | 0x0C | 0x1B | 0x1C => Ok(Box::new(fat::FatFilesystem::open(
            reader,
            partition_offset,
        )?)),
        // NTFS/exFAT share the same type byte
        0x07 => Err(FilesystemError::Unsupported(
            "NTFS/exFAT browsing not yet supported".into(),
        )),
        // Linux
        0x83 => Err(FilesystemError::Unsupported(
            "ext2/3/4 browsing not yet supported".into(),
        )),
        _ => Err(FilesystemError::Unsupported(format!(
            "filesystem type 0x{:02X} not supported for browsing",
            partition_type
        ))),
    }
}
