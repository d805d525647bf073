//! FAT12/16/32 filesystem with VFAT long filename support.
//!
//! The volume facade resolves paths through cached [`directory::Directory`]
//! objects, hands out cluster-chain-backed file streams, and keeps the FAT
//! flushed after every structural change.

pub mod bpb;
pub mod codepage;
pub mod dir_entry;
mod directory;
pub mod filename;
pub mod free_table;
pub mod table;

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::NaiveDateTime;
use log::{debug, warn};

use crate::error::FilesystemError;
use crate::fs::entry::FileEntry;
use crate::fs::filesystem::{EditableFilesystem, Filesystem};

pub use bpb::FatType;

use bpb::Geometry;
use codepage::SingleByteEncodingTable;
use dir_entry::{DirectoryEntry, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_READ_ONLY, DIR_ENTRY_SIZE};
use directory::{DirIo, DirLocation, Directory, ParentLink};
use filename::FatFileName;
use table::{ClusterAllocator, ClusterTable};

/// Cache key of the root directory. Real directories are keyed by their
/// first cluster, which is never below 2.
const ROOT_KEY: u32 = 0;

/// Source of "now" for new timestamps, in the volume's local-time
/// convention. Swappable so tests get deterministic clocks.
pub trait TimeSource: Send {
    fn now(&self) -> NaiveDateTime;
}

/// Default time source: the host's local clock.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Options for opening a FAT volume.
pub struct FatOptions {
    /// OEM code page for short names (437, 850, 1252, or a registered one).
    pub code_page: u16,
    /// Refuse all mutations when set.
    pub read_only: bool,
    pub time_source: Box<dyn TimeSource>,
}

impl Default for FatOptions {
    fn default() -> Self {
        Self {
            code_page: 437,
            read_only: false,
            time_source: Box::new(SystemTimeSource),
        }
    }
}

/// How to open a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    /// Open an existing file; fail if missing.
    Open,
    /// Open an existing file or create it.
    OpenOrCreate,
    /// Create a new file; fail if it exists.
    CreateNew,
    /// Create or truncate to zero length.
    Create,
    /// Not handled at this layer; higher layers emulate via open + set-length.
    Truncate,
    /// Not handled at this layer; higher layers emulate via open + seek.
    Append,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

impl FileAccess {
    fn can_read(&self) -> bool {
        matches!(self, FileAccess::Read | FileAccess::ReadWrite)
    }

    fn can_write(&self) -> bool {
        matches!(self, FileAccess::Write | FileAccess::ReadWrite)
    }
}

/// A FAT volume open for reading and (unless `read_only`) writing.
pub struct FatFilesystem<S: Read + Write + Seek> {
    device: S,
    geometry: Geometry,
    table: ClusterTable,
    dirs: HashMap<u32, Directory>,
    encoding: &'static SingleByteEncodingTable,
    time_source: Box<dyn TimeSource>,
    read_only: bool,
    label: Option<String>,
}

impl<S: Read + Write + Seek> FatFilesystem<S> {
    /// Open a FAT filesystem at the given offset within a device.
    pub fn open(device: S, partition_offset: u64) -> Result<Self, FilesystemError> {
        Self::open_with_options(device, partition_offset, FatOptions::default())
    }

    pub fn open_with_options(
        mut device: S,
        partition_offset: u64,
        options: FatOptions,
    ) -> Result<Self, FilesystemError> {
        let (geometry, label) = bpb::parse(&mut device, partition_offset)?;
        let table = ClusterTable::load(&mut device, &geometry)?;
        let encoding = codepage::get(options.code_page)?;
        debug!(
            "opened {} volume: {} clusters of {} bytes",
            geometry.fat_type.name(),
            geometry.total_clusters,
            geometry.cluster_size()
        );

        Ok(Self {
            device,
            geometry,
            table,
            dirs: HashMap::new(),
            encoding,
            time_source: options.time_source,
            read_only: options.read_only,
            label,
        })
    }

    /// Consume the filesystem, returning the underlying device.
    pub fn into_device(mut self) -> Result<S, (FilesystemError, S)> {
        match self.table.flush(&mut self.device) {
            Ok(()) => Ok(self.device),
            Err(e) => Err((e, self.device)),
        }
    }

    pub fn fat_type(&self) -> FatType {
        self.geometry.fat_type
    }

    // -----------------------------------------------------------------------
    // Directory plumbing
    // -----------------------------------------------------------------------

    fn root_location(&self) -> DirLocation {
        if self.geometry.fat_type == FatType::Fat32 {
            DirLocation::Chain {
                first_cluster: self.geometry.root_cluster,
            }
        } else {
            DirLocation::FixedRoot
        }
    }

    fn dir(&self, key: u32) -> Result<&Directory, FilesystemError> {
        self.dirs
            .get(&key)
            .ok_or_else(|| FilesystemError::Corrupt(format!("directory {key} not loaded")))
    }

    fn ensure_dir(
        &mut self,
        key: u32,
        location: DirLocation,
        parent: Option<ParentLink>,
    ) -> Result<(), FilesystemError> {
        if self.dirs.contains_key(&key) {
            return Ok(());
        }
        let mut io = DirIo {
            device: &mut self.device,
            table: &mut self.table,
            geometry: &self.geometry,
            encoding: self.encoding,
        };
        let dir = Directory::load(&mut io, location, parent)?;
        self.dirs.insert(key, dir);
        Ok(())
    }

    fn ensure_root(&mut self) -> Result<(), FilesystemError> {
        let location = self.root_location();
        self.ensure_dir(ROOT_KEY, location, None)
    }

    /// Walk a directory path ("", "/", "a/b", ...) to its cache key.
    fn resolve_dir(&mut self, path: &str) -> Result<u32, FilesystemError> {
        self.ensure_root()?;
        let mut key = ROOT_KEY;
        for component in components(path) {
            let dir = self.dir(key)?;
            let pos = dir
                .find(component, self.encoding)
                .ok_or_else(|| FilesystemError::NotFound(path.to_string()))?;
            let entry = dir
                .get_entry(pos)
                .ok_or_else(|| FilesystemError::Corrupt(format!("index out of sync at {path}")))?
                .clone();
            if !entry.is_directory() {
                return Err(FilesystemError::NotADirectory(path.to_string()));
            }
            let child = entry.first_cluster;
            self.ensure_dir(
                child,
                DirLocation::Chain {
                    first_cluster: child,
                },
                Some(ParentLink {
                    parent_key: key,
                    entry_pos: pos,
                }),
            )?;
            key = child;
        }
        Ok(key)
    }

    /// Resolve a file path to its parent directory key and final component.
    fn resolve_parent<'p>(&mut self, path: &'p str) -> Result<(u32, &'p str), FilesystemError> {
        let (dir_path, name) = split_path(path)?;
        let key = self.resolve_dir(dir_path)?;
        Ok((key, name))
    }

    /// Stamp the mutated directory's entry in its parent, mirroring the new
    /// timestamps into the child's in-cluster `.` and `..` records when they
    /// changed. The root has no such mirror.
    fn touch_directory(&mut self, key: u32, write: bool) -> Result<(), FilesystemError> {
        let now = self.time_source.now();
        let link = match self.dir(key)?.parent {
            Some(link) => link,
            None => return Ok(()),
        };

        let parent = self
            .dirs
            .get_mut(&link.parent_key)
            .ok_or_else(|| FilesystemError::Corrupt("parent directory not loaded".into()))?;
        let mut entry = parent
            .get_entry(link.entry_pos)
            .ok_or_else(|| FilesystemError::Corrupt("parent entry vanished".into()))?
            .clone();

        let mut changed = false;
        if entry.last_access != now.date() {
            entry.last_access = now.date();
            changed = true;
        }
        if write && entry.last_write != now {
            entry.last_write = now;
            changed = true;
        }
        if !changed {
            return Ok(());
        }

        let mut io = DirIo {
            device: &mut self.device,
            table: &mut self.table,
            geometry: &self.geometry,
            encoding: self.encoding,
        };
        parent.update_entry(&mut io, link.entry_pos, entry.clone())?;

        let child = self
            .dirs
            .get_mut(&key)
            .ok_or_else(|| FilesystemError::Corrupt("directory vanished from cache".into()))?;
        child.mirror_entry_times(&mut io, &entry)?;
        Ok(())
    }

    fn check_writable(&self) -> Result<(), FilesystemError> {
        if self.read_only {
            return Err(FilesystemError::ReadOnly(
                "volume was opened read-only".into(),
            ));
        }
        Ok(())
    }

    /// Flush the FAT on both the success and the error path of a mutation.
    fn finish_mutation<T>(
        &mut self,
        result: Result<T, FilesystemError>,
    ) -> Result<T, FilesystemError> {
        let flushed = self.table.flush(&mut self.device);
        match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// List a directory by path, directories first, then alphabetical.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<FileEntry>, FilesystemError> {
        let key = self.resolve_dir(path)?;
        let dir = self.dir(key)?;

        let parent_path = normalize_dir_path(path);
        let mut entries: Vec<FileEntry> = dir
            .iter()
            .map(|(_, entry)| {
                let display = entry.name.full_name().to_string();
                let path = join_path(&parent_path, &display);
                let mut out = if entry.is_directory() {
                    FileEntry::new_directory(display, path, entry.first_cluster as u64)
                } else {
                    FileEntry::new_file(
                        display,
                        path,
                        entry.size as u64,
                        entry.first_cluster as u64,
                    )
                };
                out.modified = Some(entry.last_write);
                out
            })
            .collect();

        entries.sort_by(|a, b| {
            let dir_ord = b.is_directory().cmp(&a.is_directory());
            if dir_ord != std::cmp::Ordering::Equal {
                dir_ord
            } else {
                a.name.to_lowercase().cmp(&b.name.to_lowercase())
            }
        });
        Ok(entries)
    }

    /// Create a directory, including the `.`/`..` records in its fresh
    /// cluster.
    pub fn create_dir(&mut self, path: &str) -> Result<FileEntry, FilesystemError> {
        self.check_writable()?;
        let (parent_key, name) = self.resolve_parent(path)?;
        if self.dir(parent_key)?.find(name, self.encoding).is_some() {
            return Err(FilesystemError::AlreadyExists(path.to_string()));
        }

        let result = self.create_dir_inner(parent_key, name);
        let result = self.finish_mutation(result);
        let entry = result?;
        Ok(FileEntry::new_directory(
            entry.name.full_name().to_string(),
            normalize_dir_path(path),
            entry.first_cluster as u64,
        ))
    }

    fn create_dir_inner(
        &mut self,
        parent_key: u32,
        name: &str,
    ) -> Result<DirectoryEntry, FilesystemError> {
        let now = self.time_source.now();
        let parent_first = match self.dir(parent_key)?.location() {
            // `..` pointing at the root is stored as cluster 0
            DirLocation::FixedRoot => 0,
            DirLocation::Chain { first_cluster } => {
                if parent_key == ROOT_KEY {
                    0
                } else {
                    first_cluster
                }
            }
        };

        let parent = self
            .dirs
            .get_mut(&parent_key)
            .ok_or_else(|| FilesystemError::Corrupt("parent directory not loaded".into()))?;
        let fat_name = {
            let encoding = self.encoding;
            FatFileName::generate(name, encoding, |candidate| {
                parent.short_name_exists(candidate, encoding)
            })?
        };

        let mut io = DirIo {
            device: &mut self.device,
            table: &mut self.table,
            geometry: &self.geometry,
            encoding: self.encoding,
        };

        let cluster = io.alloc_chain_start()?;
        let mut entry = DirectoryEntry::new(fat_name, ATTR_DIRECTORY, now);
        entry.first_cluster = cluster;

        if let Err(e) = parent.add_entry(&mut io, entry.clone()) {
            io.table.free_chain(cluster);
            return Err(e);
        }

        // Seed the child's stream with its `.` and `..` records
        let mut seed = [0u8; 2 * DIR_ENTRY_SIZE];
        let mut dot = DirectoryEntry::new(FatFileName::self_entry(), ATTR_DIRECTORY, now);
        dot.first_cluster = cluster;
        dot.encode(&mut seed[..DIR_ENTRY_SIZE], io.encoding)?;
        let mut dotdot = DirectoryEntry::new(FatFileName::parent_entry(), ATTR_DIRECTORY, now);
        dotdot.first_cluster = parent_first;
        dotdot.encode(&mut seed[DIR_ENTRY_SIZE..], io.encoding)?;
        io.write_at(
            DirLocation::Chain {
                first_cluster: cluster,
            },
            0,
            &seed,
            false,
        )?;

        self.touch_directory(parent_key, true)?;
        Ok(entry)
    }

    /// Open a file per the mode table. `Truncate` and `Append` are rejected
    /// here; higher layers emulate them via open + set-length / open + seek.
    pub fn open_file(
        &mut self,
        path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<FatFile<'_, S>, FilesystemError> {
        if matches!(mode, FileMode::Truncate | FileMode::Append) {
            return Err(FilesystemError::Unsupported(format!(
                "{mode:?} is not handled by the FAT layer"
            )));
        }
        if access.can_write() {
            self.check_writable()?;
        }

        let (dir_key, name) = self.resolve_parent(path)?;
        let existing = self.dir(dir_key)?.find(name, self.encoding);

        let (entry_pos, entry) = match existing {
            Some(pos) => {
                if mode == FileMode::CreateNew {
                    return Err(FilesystemError::AlreadyExists(path.to_string()));
                }
                let entry = self
                    .dir(dir_key)?
                    .get_entry(pos)
                    .ok_or_else(|| FilesystemError::Corrupt("index out of sync".into()))?
                    .clone();
                if entry.is_directory() {
                    return Err(FilesystemError::InvalidData(format!(
                        "not a file: {path}"
                    )));
                }
                if access.can_write() && entry.attributes & ATTR_READ_ONLY != 0 {
                    return Err(FilesystemError::ReadOnly(path.to_string()));
                }
                if mode == FileMode::Create && (entry.size > 0 || entry.first_cluster >= 2) {
                    let result = self.truncate_entry(dir_key, pos);
                    let entry = self.finish_mutation(result)?;
                    (pos, entry)
                } else {
                    (pos, entry)
                }
            }
            None => {
                if mode == FileMode::Open {
                    return Err(FilesystemError::NotFound(path.to_string()));
                }
                self.check_writable()?;
                let result = self.create_file_entry(dir_key, name);
                let (pos, entry) = self.finish_mutation(result)?;
                (pos, entry)
            }
        };

        Ok(FatFile {
            fs: self,
            dir_key,
            entry_pos,
            first_cluster: entry.first_cluster,
            size: entry.size,
            pos: 0,
            access,
            dirty: false,
        })
    }

    fn create_file_entry(
        &mut self,
        dir_key: u32,
        name: &str,
    ) -> Result<(u64, DirectoryEntry), FilesystemError> {
        let now = self.time_source.now();
        let dir = self
            .dirs
            .get_mut(&dir_key)
            .ok_or_else(|| FilesystemError::Corrupt("directory not loaded".into()))?;
        let fat_name = {
            let encoding = self.encoding;
            FatFileName::generate(name, encoding, |candidate| {
                dir.short_name_exists(candidate, encoding)
            })?
        };
        let entry = DirectoryEntry::new(fat_name, ATTR_ARCHIVE, now);

        let mut io = DirIo {
            device: &mut self.device,
            table: &mut self.table,
            geometry: &self.geometry,
            encoding: self.encoding,
        };
        let pos = dir.add_entry(&mut io, entry.clone())?;
        self.touch_directory(dir_key, true)?;
        Ok((pos, entry))
    }

    /// Release a file's chain and zero its size (FileMode::Create on an
    /// existing file).
    fn truncate_entry(
        &mut self,
        dir_key: u32,
        pos: u64,
    ) -> Result<DirectoryEntry, FilesystemError> {
        let now = self.time_source.now();
        let dir = self
            .dirs
            .get_mut(&dir_key)
            .ok_or_else(|| FilesystemError::Corrupt("directory not loaded".into()))?;
        let mut entry = dir
            .get_entry(pos)
            .ok_or_else(|| FilesystemError::Corrupt("index out of sync".into()))?
            .clone();

        let mut io = DirIo {
            device: &mut self.device,
            table: &mut self.table,
            geometry: &self.geometry,
            encoding: self.encoding,
        };
        io.table.free_chain(entry.first_cluster);
        entry.first_cluster = 0;
        entry.size = 0;
        entry.last_write = now;
        entry.last_access = now.date();
        dir.update_entry(&mut io, pos, entry.clone())?;
        self.touch_directory(dir_key, true)?;
        Ok(entry)
    }

    /// Delete a file or an empty directory.
    pub fn delete(&mut self, path: &str) -> Result<(), FilesystemError> {
        self.check_writable()?;
        let (parent_key, name) = self.resolve_parent(path)?;
        let pos = self
            .dir(parent_key)?
            .find(name, self.encoding)
            .ok_or_else(|| FilesystemError::NotFound(path.to_string()))?;
        let entry = self
            .dir(parent_key)?
            .get_entry(pos)
            .ok_or_else(|| FilesystemError::Corrupt("index out of sync".into()))?
            .clone();

        if entry.is_directory() {
            let child = entry.first_cluster;
            self.ensure_dir(
                child,
                DirLocation::Chain {
                    first_cluster: child,
                },
                Some(ParentLink {
                    parent_key,
                    entry_pos: pos,
                }),
            )?;
            if !self.dir(child)?.is_empty() {
                return Err(FilesystemError::InvalidData(format!(
                    "directory not empty: {path}"
                )));
            }
            self.dirs.remove(&child);
        }

        let result = self.delete_inner(parent_key, pos);
        self.finish_mutation(result)
    }

    fn delete_inner(&mut self, parent_key: u32, pos: u64) -> Result<(), FilesystemError> {
        let parent = self
            .dirs
            .get_mut(&parent_key)
            .ok_or_else(|| FilesystemError::Corrupt("directory not loaded".into()))?;
        let mut io = DirIo {
            device: &mut self.device,
            table: &mut self.table,
            geometry: &self.geometry,
            encoding: self.encoding,
        };
        parent.delete_entry(&mut io, pos, true)?;
        self.touch_directory(parent_key, true)
    }

    /// Rename (or move) a file or directory. Implemented as add-then-delete
    /// so a failure never loses the entry.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<(), FilesystemError> {
        self.check_writable()?;
        let (src_key, src_name) = self.resolve_parent(src)?;
        let src_pos = self
            .dir(src_key)?
            .find(src_name, self.encoding)
            .ok_or_else(|| FilesystemError::NotFound(src.to_string()))?;
        let entry = self
            .dir(src_key)?
            .get_entry(src_pos)
            .ok_or_else(|| FilesystemError::Corrupt("index out of sync".into()))?
            .clone();

        let (dst_key, dst_name) = self.resolve_parent(dst)?;
        if self.dir(dst_key)?.find(dst_name, self.encoding).is_some() {
            return Err(FilesystemError::AlreadyExists(dst.to_string()));
        }

        let result = self.rename_inner(&entry, src_key, src_pos, dst_key, dst_name);
        self.finish_mutation(result)
    }

    fn rename_inner(
        &mut self,
        entry: &DirectoryEntry,
        src_key: u32,
        src_pos: u64,
        dst_key: u32,
        dst_name: &str,
    ) -> Result<(), FilesystemError> {
        let dst_dir = self
            .dirs
            .get_mut(&dst_key)
            .ok_or_else(|| FilesystemError::Corrupt("directory not loaded".into()))?;
        let fat_name = {
            let encoding = self.encoding;
            FatFileName::generate(dst_name, encoding, |candidate| {
                dst_dir.short_name_exists(candidate, encoding)
            })?
        };

        let mut renamed = entry.clone();
        renamed.name = fat_name;

        let mut io = DirIo {
            device: &mut self.device,
            table: &mut self.table,
            geometry: &self.geometry,
            encoding: self.encoding,
        };
        let dst_pos = dst_dir.add_entry(&mut io, renamed)?;

        let src_dir = self
            .dirs
            .get_mut(&src_key)
            .ok_or_else(|| FilesystemError::Corrupt("directory not loaded".into()))?;
        // The chain now belongs to the new entry
        src_dir.delete_entry(&mut io, src_pos, false)?;

        // A moved directory needs its cache link and `..` record rewired
        if entry.is_directory() {
            self.dirs.remove(&entry.first_cluster);
            if src_key != dst_key {
                let child_key = entry.first_cluster;
                self.ensure_dir(
                    child_key,
                    DirLocation::Chain {
                        first_cluster: child_key,
                    },
                    Some(ParentLink {
                        parent_key: dst_key,
                        entry_pos: dst_pos,
                    }),
                )?;
                let now = self.time_source.now();
                let dst_first = if dst_key == ROOT_KEY { 0 } else { dst_key };
                let mut dotdot =
                    DirectoryEntry::new(FatFileName::parent_entry(), ATTR_DIRECTORY, now);
                dotdot.first_cluster = dst_first;

                let child = self
                    .dirs
                    .get_mut(&child_key)
                    .ok_or_else(|| FilesystemError::Corrupt("directory not loaded".into()))?;
                let mut io = DirIo {
                    device: &mut self.device,
                    table: &mut self.table,
                    geometry: &self.geometry,
                    encoding: self.encoding,
                };
                child.set_parent_record(&mut io, dotdot)?;
            }
        }

        self.touch_directory(dst_key, true)?;
        if src_key != dst_key {
            self.touch_directory(src_key, true)?;
        }
        Ok(())
    }

    /// Convenience: read a whole file into memory.
    pub fn read_to_vec(&mut self, path: &str, max_bytes: usize) -> Result<Vec<u8>, FilesystemError> {
        let mut file = self.open_file(path, FileMode::Open, FileAccess::Read)?;
        let mut data = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        while data.len() < max_bytes {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let take = n.min(max_bytes - data.len());
            data.extend_from_slice(&buf[..take]);
        }
        Ok(data)
    }

    fn cluster_at(&self, first: u32, index: u64) -> Option<u32> {
        let mut cluster = first;
        for _ in 0..index {
            cluster = self.table.next_cluster(cluster)?;
        }
        Some(cluster)
    }
}

// ---------------------------------------------------------------------------
// File streams
// ---------------------------------------------------------------------------

/// A file opened on a FAT volume: a seekable stream over its cluster chain.
///
/// Writes extend the chain lazily; the directory entry (size, first cluster,
/// write time, archive bit) is written back on [`FatFile::flush`] and on
/// drop.
pub struct FatFile<'a, S: Read + Write + Seek> {
    fs: &'a mut FatFilesystem<S>,
    dir_key: u32,
    entry_pos: u64,
    first_cluster: u32,
    size: u32,
    pos: u64,
    access: FileAccess,
    dirty: bool,
}

impl<S: Read + Write + Seek> FatFile<'_, S> {
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    fn stream_read(&mut self, buf: &mut [u8]) -> Result<usize, FilesystemError> {
        if !self.access.can_read() {
            return Err(FilesystemError::ReadOnly("file opened write-only".into()));
        }
        let end = self.size as u64;
        if self.pos >= end || self.first_cluster < 2 || buf.is_empty() {
            return Ok(0);
        }

        let cluster_size = self.fs.geometry.cluster_size();
        let mut total = 0usize;
        while total < buf.len() && self.pos < end {
            let cluster = match self.fs.cluster_at(self.first_cluster, self.pos / cluster_size) {
                Some(c) => c,
                None => break, // chain shorter than the recorded size
            };
            let offset = self.pos % cluster_size;
            let chunk = (buf.len() - total)
                .min((cluster_size - offset) as usize)
                .min((end - self.pos) as usize);
            self.fs
                .device
                .seek(SeekFrom::Start(self.fs.geometry.cluster_offset(cluster) + offset))?;
            self.fs.device.read_exact(&mut buf[total..total + chunk])?;
            total += chunk;
            self.pos += chunk as u64;
        }
        Ok(total)
    }

    fn stream_write(&mut self, data: &[u8]) -> Result<usize, FilesystemError> {
        if !self.access.can_write() {
            return Err(FilesystemError::ReadOnly("file opened read-only".into()));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let new_end = self.pos + data.len() as u64;
        if new_end > u32::MAX as u64 {
            return Err(FilesystemError::NoSpace(
                "FAT files are limited to 4 GiB".into(),
            ));
        }

        let mut io = DirIo {
            device: &mut self.fs.device,
            table: &mut self.fs.table,
            geometry: &self.fs.geometry,
            encoding: self.fs.encoding,
        };
        if self.first_cluster < 2 {
            self.first_cluster = io.alloc_chain_start()?;
        }
        io.chain_write(self.first_cluster, self.pos, data, true)?;

        self.pos = new_end;
        self.size = self.size.max(new_end as u32);
        self.dirty = true;
        Ok(data.len())
    }

    fn sync(&mut self) -> Result<(), FilesystemError> {
        if !self.dirty {
            return Ok(());
        }
        let now = self.fs.time_source.now();
        let dir = self
            .fs
            .dirs
            .get_mut(&self.dir_key)
            .ok_or_else(|| FilesystemError::Corrupt("directory not loaded".into()))?;
        let mut entry = dir
            .get_entry(self.entry_pos)
            .ok_or_else(|| FilesystemError::Corrupt("file entry vanished".into()))?
            .clone();
        entry.first_cluster = self.first_cluster;
        entry.size = self.size;
        entry.last_write = now;
        entry.last_access = now.date();
        entry.attributes |= ATTR_ARCHIVE;

        let mut io = DirIo {
            device: &mut self.fs.device,
            table: &mut self.fs.table,
            geometry: &self.fs.geometry,
            encoding: self.fs.encoding,
        };
        dir.update_entry(&mut io, self.entry_pos, entry)?;
        self.fs.touch_directory(self.dir_key, true)?;
        self.fs.table.flush(&mut self.fs.device)?;
        self.fs.device.flush()?;
        self.dirty = false;
        Ok(())
    }

    /// Flush buffered metadata (directory entry and FAT) to the device.
    pub fn flush(&mut self) -> Result<(), FilesystemError> {
        self.sync()
    }
}

impl<S: Read + Write + Seek> Read for FatFile<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_read(buf).map_err(into_io_error)
    }
}

impl<S: Read + Write + Seek> Write for FatFile<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_write(buf).map_err(into_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(into_io_error)
    }
}

impl<S: Read + Write + Seek> Seek for FatFile<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.size as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl<S: Read + Write + Seek> Drop for FatFile<'_, S> {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.sync() {
                warn!("failed to flush file on drop: {e}");
            }
        }
    }
}

fn into_io_error(e: FilesystemError) -> io::Error {
    match e {
        FilesystemError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

// ---------------------------------------------------------------------------
// Browsing / editing trait implementations
// ---------------------------------------------------------------------------

impl<S: Read + Write + Seek + Send> Filesystem for FatFilesystem<S> {
    fn root(&mut self) -> Result<FileEntry, FilesystemError> {
        let mut root = FileEntry::root();
        root.location = if self.geometry.fat_type == FatType::Fat32 {
            self.geometry.root_cluster as u64
        } else {
            0
        };
        Ok(root)
    }

    fn list_directory(&mut self, entry: &FileEntry) -> Result<Vec<FileEntry>, FilesystemError> {
        if !entry.is_directory() {
            return Err(FilesystemError::NotADirectory(entry.path.clone()));
        }
        self.list_dir(&entry.path)
    }

    fn read_file(
        &mut self,
        entry: &FileEntry,
        max_bytes: usize,
    ) -> Result<Vec<u8>, FilesystemError> {
        if entry.is_directory() {
            return Err(FilesystemError::NotADirectory(entry.path.clone()));
        }
        self.read_to_vec(&entry.path, max_bytes)
    }

    fn volume_label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn fs_type(&self) -> &str {
        self.geometry.fat_type.name()
    }

    fn total_size(&self) -> u64 {
        self.geometry.total_size()
    }

    fn used_size(&mut self) -> Result<u64, FilesystemError> {
        let used = self.geometry.total_clusters - self.table.count_free();
        Ok(used * self.geometry.cluster_size())
    }
}

impl<S: Read + Write + Seek + Send> EditableFilesystem for FatFilesystem<S> {
    fn create_file(
        &mut self,
        parent: &FileEntry,
        name: &str,
        data: &mut dyn Read,
        data_len: u64,
    ) -> Result<FileEntry, FilesystemError> {
        let path = join_path(&normalize_dir_path(&parent.path), name);
        let mut remaining = data_len;
        let location;
        let written;
        {
            let mut file = self.open_file(&path, FileMode::CreateNew, FileAccess::ReadWrite)?;
            let mut buf = [0u8; 64 * 1024];
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                let got = data.read(&mut buf[..want])?;
                if got == 0 {
                    break;
                }
                file.write_all(&buf[..got])?;
                remaining -= got as u64;
            }
            file.flush()?;
            location = file.first_cluster as u64;
            written = file.size();
        }
        let mut entry = FileEntry::new_file(name.to_string(), path, written, location);
        entry.modified = Some(self.time_source.now());
        Ok(entry)
    }

    fn create_directory(
        &mut self,
        parent: &FileEntry,
        name: &str,
    ) -> Result<FileEntry, FilesystemError> {
        let path = join_path(&normalize_dir_path(&parent.path), name);
        self.create_dir(&path)
    }

    fn delete_entry(
        &mut self,
        _parent: &FileEntry,
        entry: &FileEntry,
    ) -> Result<(), FilesystemError> {
        self.delete(&entry.path)
    }

    fn sync_metadata(&mut self) -> Result<(), FilesystemError> {
        self.table.flush(&mut self.device)?;
        self.device.flush()?;
        Ok(())
    }

    fn free_space(&mut self) -> Result<u64, FilesystemError> {
        Ok(self.table.count_free() * self.geometry.cluster_size())
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Options for [`format_volume`].
pub struct FormatOptions {
    /// Force a FAT variant; chosen from the volume size when `None`.
    pub fat_type: Option<FatType>,
    /// Force a cluster size; chosen to fit the variant's limits when `None`.
    pub sectors_per_cluster: Option<u8>,
    pub bytes_per_sector: u16,
    pub label: Option<String>,
    pub volume_id: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fat_type: None,
            sectors_per_cluster: None,
            bytes_per_sector: 512,
            label: None,
            volume_id: 0,
        }
    }
}

/// Format `total_sectors` of the device at offset 0 as an empty FAT volume.
pub fn format_volume<S: Read + Write + Seek>(
    device: &mut S,
    total_sectors: u64,
    options: &FormatOptions,
) -> Result<(), FilesystemError> {
    let bps = options.bytes_per_sector as u64;
    let total_bytes = total_sectors * bps;

    let fat_type = options.fat_type.unwrap_or(if total_bytes < 4 << 20 {
        FatType::Fat12
    } else if total_bytes < 512 << 20 {
        FatType::Fat16
    } else {
        FatType::Fat32
    });

    let (reserved, root_entry_count) = match fat_type {
        FatType::Fat12 => (1u64, 224u16),
        FatType::Fat16 => (4, 512),
        FatType::Fat32 => (32, 0),
    };
    let root_dir_sectors = (root_entry_count as u64 * 32 + bps - 1) / bps;

    let spc = match options.sectors_per_cluster {
        Some(spc) => spc as u64,
        None => pick_sectors_per_cluster(total_sectors, reserved, root_dir_sectors, fat_type, bps)?,
    };

    let spf = bpb::compute_fat_sectors(total_sectors, reserved, 2, root_dir_sectors, spc, fat_type, bps);
    let data_sectors = total_sectors.saturating_sub(reserved + 2 * spf + root_dir_sectors);
    let total_clusters = data_sectors / spc;

    let in_range = match fat_type {
        FatType::Fat12 => total_clusters < 4085,
        FatType::Fat16 => (4085..65525).contains(&total_clusters),
        FatType::Fat32 => total_clusters >= 65525 || options.fat_type.is_some(),
    };
    if !in_range {
        return Err(FilesystemError::InvalidData(format!(
            "{} cluster count {} out of range for the volume size",
            fat_type.name(),
            total_clusters
        )));
    }

    let mut geometry = Geometry {
        bytes_per_sector: bps,
        sectors_per_cluster: spc,
        reserved_sectors: reserved,
        num_fats: 2,
        sectors_per_fat: spf,
        root_entry_count,
        root_cluster: 0,
        total_sectors,
        total_clusters,
        media_byte: 0xF8,
        fat_type,
        partition_offset: 0,
    };

    let mut table = ClusterTable::new_empty(&geometry);
    if fat_type == FatType::Fat32 {
        // The root directory gets the first data cluster
        geometry.root_cluster = 2;
        table.set_end_of_chain(2);
    }

    // Size the image, then lay the pieces down
    device.seek(SeekFrom::Start(total_bytes - 1))?;
    device.write_all(&[0])?;

    let boot = bpb::build_boot_sector(&geometry, options.label.as_deref(), options.volume_id);
    device.seek(SeekFrom::Start(0))?;
    device.write_all(&boot)?;

    if fat_type == FatType::Fat32 {
        let fsinfo = build_fsinfo(total_clusters as u32 - 1, 3);
        device.seek(SeekFrom::Start(bps))?;
        device.write_all(&fsinfo)?;
        // Backup boot sector at sector 6, backup FSInfo right after it
        device.seek(SeekFrom::Start(6 * bps))?;
        device.write_all(&boot)?;
        device.write_all(&fsinfo)?;
    }

    table.flush(device)?;

    // Zero the root directory region / root cluster
    if fat_type == FatType::Fat32 {
        let zeroes = vec![0u8; geometry.cluster_size() as usize];
        device.seek(SeekFrom::Start(geometry.cluster_offset(2)))?;
        device.write_all(&zeroes)?;
    } else {
        let zeroes = vec![0u8; geometry.root_region_len() as usize];
        device.seek(SeekFrom::Start(geometry.root_region_offset()))?;
        device.write_all(&zeroes)?;
    }
    device.flush()?;

    debug!(
        "formatted {}: {} sectors, {} sectors/cluster, {} clusters",
        fat_type.name(),
        total_sectors,
        spc,
        total_clusters
    );
    Ok(())
}

fn pick_sectors_per_cluster(
    total_sectors: u64,
    reserved: u64,
    root_dir_sectors: u64,
    fat_type: FatType,
    bps: u64,
) -> Result<u64, FilesystemError> {
    for spc in [1u64, 2, 4, 8, 16, 32, 64, 128] {
        let spf = bpb::compute_fat_sectors(total_sectors, reserved, 2, root_dir_sectors, spc, fat_type, bps);
        let data_sectors = total_sectors.saturating_sub(reserved + 2 * spf + root_dir_sectors);
        let clusters = data_sectors / spc;
        let fits = match fat_type {
            FatType::Fat12 => clusters < 4085,
            FatType::Fat16 => clusters < 65525,
            FatType::Fat32 => clusters < 0x0FFF_FFF5,
        };
        if fits {
            return Ok(spc);
        }
    }
    Err(FilesystemError::InvalidData(
        "volume too large for the requested FAT type".into(),
    ))
}

fn build_fsinfo(free_count: u32, next_free: u32) -> [u8; 512] {
    let mut fsinfo = [0u8; 512];
    fsinfo[0..4].copy_from_slice(&0x41615252u32.to_le_bytes());
    fsinfo[484..488].copy_from_slice(&0x61417272u32.to_le_bytes());
    fsinfo[488..492].copy_from_slice(&free_count.to_le_bytes());
    fsinfo[492..496].copy_from_slice(&next_free.to_le_bytes());
    fsinfo[510] = 0x55;
    fsinfo[511] = 0xAA;
    fsinfo
}

// ---------------------------------------------------------------------------
// Integrity checking
// ---------------------------------------------------------------------------

/// Validate the integrity of a FAT filesystem after manipulation.
///
/// Checks BPB consistency, FAT[0] media byte, FAT[1] clean flags, FSInfo
/// signatures (FAT32) and cluster chain bounds. Returns a list of warning
/// messages (empty = all good).
pub fn validate_fat_integrity<S: Read + Write + Seek>(
    device: &mut S,
    partition_offset: u64,
) -> anyhow::Result<Vec<String>> {
    let mut warnings = Vec::new();

    let (geometry, _) = match bpb::parse(device, partition_offset) {
        Ok(parsed) => parsed,
        Err(e) => {
            warnings.push(format!("BPB: {e}"));
            return Ok(warnings);
        }
    };

    if geometry.data_start_sector() > geometry.total_sectors {
        warnings.push(format!(
            "BPB: data start ({}) beyond total sectors ({})",
            geometry.data_start_sector(),
            geometry.total_sectors
        ));
    }

    let table = ClusterTable::load(device, &geometry)?;

    // FAT[0] carries the media byte with the remaining bits set
    let entry0 = table.entry(0);
    let expected0 = match geometry.fat_type {
        FatType::Fat12 => 0x0F00 | geometry.media_byte as u32,
        FatType::Fat16 => 0xFF00 | geometry.media_byte as u32,
        FatType::Fat32 => 0x0FFF_FF00 | geometry.media_byte as u32,
    };
    if entry0 != expected0 {
        warnings.push(format!(
            "{}: FAT[0] = {:#X}, expected {:#X}",
            geometry.fat_type.name(),
            entry0,
            expected0
        ));
    }

    // FAT[1] clean-shutdown flags (FAT12 has none)
    let entry1 = table.entry(1);
    match geometry.fat_type {
        FatType::Fat16 => {
            if entry1 & 0x8000 == 0 {
                warnings.push("FAT16: FAT[1] clean shutdown bit not set".into());
            }
            if entry1 & 0x4000 == 0 {
                warnings.push("FAT16: FAT[1] no-error bit not set".into());
            }
        }
        FatType::Fat32 => {
            if entry1 & 0x0800_0000 == 0 {
                warnings.push("FAT32: FAT[1] clean shutdown bit not set".into());
            }
            if entry1 & 0x0400_0000 == 0 {
                warnings.push("FAT32: FAT[1] no-error bit not set".into());
            }
        }
        FatType::Fat12 => {}
    }

    // FSInfo signatures
    if geometry.fat_type == FatType::Fat32 {
        device.seek(SeekFrom::Start(partition_offset + 48))?;
        let fsinfo_sector = device.read_u16::<LittleEndian>()? as u64;
        if fsinfo_sector > 0 && fsinfo_sector < geometry.reserved_sectors {
            let fsinfo_offset = partition_offset + fsinfo_sector * geometry.bytes_per_sector;
            device.seek(SeekFrom::Start(fsinfo_offset))?;
            let sig1 = device.read_u32::<LittleEndian>()?;
            device.seek(SeekFrom::Start(fsinfo_offset + 484))?;
            let sig2 = device.read_u32::<LittleEndian>()?;
            if sig1 != 0x41615252 {
                warnings.push(format!("FSInfo: bad signature1 {sig1:#010X}"));
            }
            if sig2 != 0x61417272 {
                warnings.push(format!("FSInfo: bad signature2 {sig2:#010X}"));
            }
        }
    }

    // Chains referencing beyond the cluster count
    let mut out_of_bounds = 0u32;
    for cluster in 2..=geometry.max_cluster() {
        let entry = table.entry(cluster);
        if entry == 0 || table.is_end_of_chain(entry) || table.is_bad_cluster(entry) {
            continue;
        }
        if entry < 2 || entry > geometry.max_cluster() {
            out_of_bounds += 1;
        }
    }
    if out_of_bounds > 0 {
        warnings.push(format!(
            "{out_of_bounds} cluster(s) reference beyond the volume"
        ));
    }

    Ok(warnings)
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty())
}

fn split_path(path: &str) -> Result<(&str, &str), FilesystemError> {
    let trimmed = path.trim_matches(['/', '\\']);
    if trimmed.is_empty() {
        return Err(FilesystemError::InvalidName("empty path".into()));
    }
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => Ok((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Ok(("", trimmed)),
    }
}

fn normalize_dir_path(path: &str) -> String {
    let trimmed = path.trim_matches(['/', '\\']);
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(split_path("/a/b/c").unwrap(), ("a/b", "c"));
        assert_eq!(split_path("top.txt").unwrap(), ("", "top.txt"));
        assert!(split_path("/").is_err());
        assert_eq!(normalize_dir_path(""), "/");
        assert_eq!(normalize_dir_path("/a/"), "/a");
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }

    #[test]
    fn test_components() {
        let parts: Vec<&str> = components("/a//b\\c/").collect();
        assert_eq!(parts, ["a", "b", "c"]);
        assert_eq!(components("/").count(), 0);
    }
}
