//! Read/write access to on-disk filesystem formats.
//!
//! The crate currently implements the FAT family (FAT12, FAT16, FAT32) with
//! VFAT long filename support, including full write access: creating,
//! renaming and deleting files and directories, and streaming file contents
//! through cluster-chain-backed readers/writers.
//!
//! Filesystems are accessed through any `Read + Write + Seek` byte stream,
//! so the same code path works against raw device files, partition slices
//! and in-memory images.

pub mod error;
pub mod fs;

pub use error::FilesystemError;
pub use fs::entry::FileEntry;
pub use fs::fat::{
    format_volume, validate_fat_integrity, FatFile, FatFilesystem, FatOptions, FileAccess,
    FileMode, FormatOptions, TimeSource,
};
pub use fs::filesystem::{EditableFilesystem, Filesystem};
