use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use log::warn;

use crate::error::FilesystemError;

use super::bpb::{FatType, Geometry};
use super::codepage::SingleByteEncodingTable;
use super::dir_entry::{DirectoryEntry, ATTR_LONG_NAME, DIR_ENTRY_SIZE};
use super::filename::FatFileName;
use super::free_table::FreeDirectoryEntryTable;
use super::table::{ClusterAllocator, ClusterTable};

/// Where a directory's byte stream lives on the volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum DirLocation {
    /// The fixed root region of FAT12/16 volumes.
    FixedRoot,
    /// A cluster chain (FAT32 root and every subdirectory).
    Chain { first_cluster: u32 },
}

/// Back-pointer from a directory to its entry in the parent's stream.
/// The root has none.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ParentLink {
    pub parent_key: u32,
    pub entry_pos: u64,
}

/// Borrowed I/O context for directory operations: the device, the FAT and
/// the volume geometry. Directories own no I/O state themselves, so they
/// stay independently testable and the volume keeps a single exclusive
/// borrow per operation.
pub(crate) struct DirIo<'a, S> {
    pub device: &'a mut S,
    pub table: &'a mut ClusterTable,
    pub geometry: &'a Geometry,
    pub encoding: &'static SingleByteEncodingTable,
}

impl<'a, S: Read + Write + Seek> DirIo<'a, S> {
    /// Read a directory's entire byte stream.
    pub fn read_stream(&mut self, location: DirLocation) -> Result<Vec<u8>, FilesystemError> {
        match location {
            DirLocation::FixedRoot => {
                let len = self.geometry.root_region_len() as usize;
                self.device
                    .seek(SeekFrom::Start(self.geometry.root_region_offset()))?;
                let mut buf = vec![0u8; len];
                self.device.read_exact(&mut buf)?;
                Ok(buf)
            }
            DirLocation::Chain { first_cluster } => {
                let cluster_size = self.geometry.cluster_size() as usize;
                let mut data = Vec::new();
                let mut cluster = first_cluster;
                let mut count = 0u32;
                loop {
                    if cluster < 2 || count > self.table.max_cluster() {
                        break;
                    }
                    self.device
                        .seek(SeekFrom::Start(self.geometry.cluster_offset(cluster)))?;
                    let mut buf = vec![0u8; cluster_size];
                    self.device.read_exact(&mut buf)?;
                    data.extend_from_slice(&buf);
                    count += 1;
                    match self.table.next_cluster(cluster) {
                        Some(next) => cluster = next,
                        None => break,
                    }
                }
                Ok(data)
            }
        }
    }

    /// Write bytes at a stream position, following (and optionally
    /// extending) the cluster chain.
    pub fn write_at(
        &mut self,
        location: DirLocation,
        pos: u64,
        data: &[u8],
        extend: bool,
    ) -> Result<(), FilesystemError> {
        match location {
            DirLocation::FixedRoot => {
                if pos + data.len() as u64 > self.geometry.root_region_len() {
                    return Err(FilesystemError::NoSpace(
                        "fixed root directory is full".into(),
                    ));
                }
                self.device
                    .seek(SeekFrom::Start(self.geometry.root_region_offset() + pos))?;
                self.device.write_all(data)?;
                Ok(())
            }
            DirLocation::Chain { first_cluster } => {
                self.chain_write(first_cluster, pos, data, extend)
            }
        }
    }

    pub fn chain_write(
        &mut self,
        first_cluster: u32,
        mut pos: u64,
        mut data: &[u8],
        extend: bool,
    ) -> Result<(), FilesystemError> {
        let cluster_size = self.geometry.cluster_size();
        let mut cluster = first_cluster;
        let mut cluster_start = 0u64;

        while pos >= cluster_start + cluster_size {
            cluster = self.step_chain(cluster, extend)?;
            cluster_start += cluster_size;
        }

        while !data.is_empty() {
            let offset = pos - cluster_start;
            let chunk = ((cluster_size - offset) as usize).min(data.len());
            self.device
                .seek(SeekFrom::Start(self.geometry.cluster_offset(cluster) + offset))?;
            self.device.write_all(&data[..chunk])?;
            data = &data[chunk..];
            pos += chunk as u64;
            if !data.is_empty() {
                cluster = self.step_chain(cluster, extend)?;
                cluster_start += cluster_size;
            }
        }
        Ok(())
    }

    fn step_chain(&mut self, cluster: u32, extend: bool) -> Result<u32, FilesystemError> {
        match self.table.next_cluster(cluster) {
            Some(next) => Ok(next),
            None if extend => self.extend_chain(cluster),
            None => Err(FilesystemError::InvalidData(format!(
                "write past end of cluster chain at cluster {cluster}"
            ))),
        }
    }

    /// Allocate a fresh zeroed cluster and link it after `tail`.
    pub fn extend_chain(&mut self, tail: u32) -> Result<u32, FilesystemError> {
        let new = self
            .table
            .try_get_free_cluster()
            .ok_or_else(|| FilesystemError::NoSpace("no free clusters left".into()))?;
        self.table.set_end_of_chain(new);
        self.table.set_next(tail, new);
        self.zero_cluster(new)?;
        Ok(new)
    }

    /// Allocate the first cluster of a new chain, zero-filled and terminated.
    pub fn alloc_chain_start(&mut self) -> Result<u32, FilesystemError> {
        let new = self
            .table
            .try_get_free_cluster()
            .ok_or_else(|| FilesystemError::NoSpace("no free clusters left".into()))?;
        self.table.set_end_of_chain(new);
        self.zero_cluster(new)?;
        Ok(new)
    }

    pub fn zero_cluster(&mut self, cluster: u32) -> Result<(), FilesystemError> {
        let zeroes = vec![0u8; self.geometry.cluster_size() as usize];
        self.device
            .seek(SeekFrom::Start(self.geometry.cluster_offset(cluster)))?;
        self.device.write_all(&zeroes)?;
        Ok(())
    }
}

/// A live directory: the decoded view of one directory stream plus the
/// indexes and free-slot bookkeeping needed to mutate it in place.
pub(crate) struct Directory {
    location: DirLocation,
    /// Stream position of each live entry's first record.
    entries: HashMap<u64, DirectoryEntry>,
    /// OEM-uppercased short name -> position.
    short_index: HashMap<String, u64>,
    /// OEM-uppercased full name -> position.
    full_index: HashMap<String, u64>,
    free_table: FreeDirectoryEntryTable,
    /// First never-written stream offset (the null terminator's position).
    end_of_entries: u64,
    /// The `.` record in this directory's own stream, if present.
    self_entry: Option<(u64, DirectoryEntry)>,
    /// The `..` record, if present.
    parent_entry: Option<(u64, DirectoryEntry)>,
    /// Link to this directory's entry in its parent (None for the root).
    pub parent: Option<ParentLink>,
}

impl Directory {
    /// Scan a directory stream into a live object.
    ///
    /// Tombstones and orphaned LFN slots become free runs; a checksum
    /// mismatch never fails the load. The watermark is the offset of the
    /// first all-zero record, or the stream length if none exists.
    pub fn load<S: Read + Write + Seek>(
        io: &mut DirIo<'_, S>,
        location: DirLocation,
        parent: Option<ParentLink>,
    ) -> Result<Self, FilesystemError> {
        let data = io.read_stream(location)?;
        let fat32 = io.geometry.fat_type == FatType::Fat32;

        let mut dir = Self {
            location,
            entries: HashMap::new(),
            short_index: HashMap::new(),
            full_index: HashMap::new(),
            free_table: FreeDirectoryEntryTable::new(),
            end_of_entries: data.len() as u64,
            self_entry: None,
            parent_entry: None,
            parent,
        };

        let mut free_runs: Vec<(u64, usize)> = Vec::new();
        let mut mark_free = |pos: usize| match free_runs.last_mut() {
            Some((start, count)) if *start + (*count as u64) * DIR_ENTRY_SIZE as u64 == pos as u64 => {
                *count += 1;
            }
            _ => free_runs.push((pos as u64, 1)),
        };

        let mut pos = 0usize;
        while pos + DIR_ENTRY_SIZE <= data.len() {
            if data[pos] == 0x00 {
                dir.end_of_entries = pos as u64;
                break;
            }

            let (name, consumed) = FatFileName::decode(&data[pos..], io.encoding);
            if name.is_deleted() {
                if data[pos] != 0xE5 && data[pos + 11] == ATTR_LONG_NAME {
                    warn!("orphaned LFN slot at directory offset {pos}, reclaiming as free");
                }
                mark_free(pos);
                pos += DIR_ENTRY_SIZE;
                continue;
            }

            let record = &data[pos + consumed - DIR_ENTRY_SIZE..pos + consumed];
            let entry = DirectoryEntry::from_record(name, record, fat32);

            if entry.name.is_self() {
                dir.self_entry = Some((pos as u64, entry));
            } else if entry.name.is_parent() {
                dir.parent_entry = Some((pos as u64, entry));
            } else if entry.is_volume_label() {
                // Label records stay where they are: occupied but unindexed
            } else {
                let short_key = io.encoding.oem_upper(entry.name.short_name());
                let full_key = io.encoding.oem_upper(entry.name.full_name());
                if dir.short_index.contains_key(&short_key)
                    || dir.full_index.contains_key(&full_key)
                {
                    warn!(
                        "duplicate directory entry for {:?} at offset {pos}, keeping the first",
                        entry.name.full_name()
                    );
                } else {
                    dir.short_index.insert(short_key, pos as u64);
                    dir.full_index.insert(full_key, pos as u64);
                    dir.entries.insert(pos as u64, entry);
                }
            }
            pos += consumed;
        }

        for (start, count) in free_runs {
            dir.free_table.add_free_range(start, count);
        }
        Ok(dir)
    }

    pub fn location(&self) -> DirLocation {
        self.location
    }

    pub fn end_of_entries(&self) -> u64 {
        self.end_of_entries
    }

    pub fn get_entry(&self, pos: u64) -> Option<&DirectoryEntry> {
        self.entries.get(&pos)
    }

    /// Case-insensitive lookup by long or short name.
    pub fn find(&self, name: &str, encoding: &SingleByteEncodingTable) -> Option<u64> {
        let key = encoding.oem_upper(name);
        self.full_index
            .get(&key)
            .or_else(|| self.short_index.get(&key))
            .copied()
    }

    /// True when a short name (in display form) is already taken.
    pub fn short_name_exists(&self, short: &str, encoding: &SingleByteEncodingTable) -> bool {
        self.short_index.contains_key(&encoding.oem_upper(short))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &DirectoryEntry)> {
        self.entries.iter().map(|(&pos, entry)| (pos, entry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new entry, preferring recycled slots over growing the
    /// stream. Returns the stream position of the entry's first record.
    pub fn add_entry<S: Read + Write + Seek>(
        &mut self,
        io: &mut DirIo<'_, S>,
        entry: DirectoryEntry,
    ) -> Result<u64, FilesystemError> {
        let short_key = io.encoding.oem_upper(entry.name.short_name());
        let full_key = io.encoding.oem_upper(entry.name.full_name());
        if self.short_index.contains_key(&short_key) || self.full_index.contains_key(&full_key) {
            return Err(FilesystemError::AlreadyExists(
                entry.name.full_name().to_string(),
            ));
        }

        let slots = entry.slot_count();
        let mut buf = vec![0u8; entry.encoded_len()];
        entry.encode(&mut buf, io.encoding)?;

        let (pos, appended) = match self.free_table.allocate(slots) {
            Some(pos) => (pos, false),
            None => {
                let pos = self.end_of_entries;
                self.end_of_entries = pos + (slots * DIR_ENTRY_SIZE) as u64;
                (pos, true)
            }
        };

        if let Err(e) = io.write_at(self.location, pos, &buf, true) {
            // Undo the reservation so the table stays conserved
            if appended {
                self.end_of_entries = pos;
            } else {
                self.free_table.add_free_range(pos, slots);
            }
            return Err(e);
        }

        self.short_index.insert(short_key, pos);
        self.full_index.insert(full_key, pos);
        self.entries.insert(pos, entry);
        Ok(pos)
    }

    /// Tombstone an entry's records and return the run to the free table.
    /// With `release_contents` the entry's cluster chain is freed too.
    pub fn delete_entry<S: Read + Write + Seek>(
        &mut self,
        io: &mut DirIo<'_, S>,
        pos: u64,
        release_contents: bool,
    ) -> Result<DirectoryEntry, FilesystemError> {
        let entry = self
            .entries
            .remove(&pos)
            .ok_or_else(|| FilesystemError::NotFound(format!("no entry at offset {pos}")))?;

        let slots = entry.slot_count();
        let mut tombstones = vec![0u8; slots * DIR_ENTRY_SIZE];
        for slot in 0..slots {
            tombstones[slot * DIR_ENTRY_SIZE] = 0xE5;
        }
        io.write_at(self.location, pos, &tombstones, false)?;

        if release_contents {
            io.table.free_chain(entry.first_cluster);
        }

        self.short_index
            .remove(&io.encoding.oem_upper(entry.name.short_name()));
        self.full_index
            .remove(&io.encoding.oem_upper(entry.name.full_name()));
        self.free_table.add_free_range(pos, slots);
        Ok(entry)
    }

    /// Rewrite an entry in place. The caller must not change the name (and
    /// with it the slot count); renames go through delete + add.
    pub fn update_entry<S: Read + Write + Seek>(
        &mut self,
        io: &mut DirIo<'_, S>,
        pos: u64,
        entry: DirectoryEntry,
    ) -> Result<(), FilesystemError> {
        let old = self
            .entries
            .get(&pos)
            .ok_or_else(|| FilesystemError::NotFound(format!("no entry at offset {pos}")))?;
        if old.slot_count() != entry.slot_count() {
            return Err(FilesystemError::InvalidData(
                "entry update must not change the record count".into(),
            ));
        }

        let mut buf = vec![0u8; entry.encoded_len()];
        entry.encode(&mut buf, io.encoding)?;
        io.write_at(self.location, pos, &buf, false)?;
        self.entries.insert(pos, entry);
        Ok(())
    }

    pub fn self_entry(&self) -> Option<&(u64, DirectoryEntry)> {
        self.self_entry.as_ref()
    }

    pub fn parent_entry(&self) -> Option<&(u64, DirectoryEntry)> {
        self.parent_entry.as_ref()
    }

    /// Copy the changed access/write timestamps of this directory's entry in
    /// its parent into the local `.` and `..` records, so both agree with
    /// the parent's view.
    pub fn mirror_entry_times<S: Read + Write + Seek>(
        &mut self,
        io: &mut DirIo<'_, S>,
        source: &DirectoryEntry,
    ) -> Result<(), FilesystemError> {
        let location = self.location;
        for slot in [self.self_entry.as_mut(), self.parent_entry.as_mut()] {
            if let Some((pos, record)) = slot {
                record.last_access = source.last_access;
                record.last_write = source.last_write;
                let mut buf = [0u8; DIR_ENTRY_SIZE];
                record.encode(&mut buf, io.encoding)?;
                io.write_at(location, *pos, &buf, false)?;
            }
        }
        Ok(())
    }

    /// Rewrite the `..` record (used when a fresh subdirectory is wired up).
    pub fn set_parent_record<S: Read + Write + Seek>(
        &mut self,
        io: &mut DirIo<'_, S>,
        record: DirectoryEntry,
    ) -> Result<(), FilesystemError> {
        let location = self.location;
        if let Some((pos, cached)) = self.parent_entry.as_mut() {
            let mut buf = [0u8; DIR_ENTRY_SIZE];
            record.encode(&mut buf, io.encoding)?;
            io.write_at(location, *pos, &buf, false)?;
            *cached = record;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::codepage;
    use crate::fs::fat::dir_entry::ATTR_ARCHIVE;
    use chrono::NaiveDate;
    use std::io::Cursor;

    /// A tiny FAT12 volume with a 32-entry fixed root, all in memory.
    fn test_geometry() -> Geometry {
        Geometry {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            num_fats: 2,
            sectors_per_fat: 2,
            root_entry_count: 32,
            root_cluster: 0,
            total_sectors: 64,
            total_clusters: 57,
            media_byte: 0xF8,
            fat_type: FatType::Fat12,
            partition_offset: 0,
        }
    }

    struct Fixture {
        device: Cursor<Vec<u8>>,
        table: ClusterTable,
        geometry: Geometry,
    }

    impl Fixture {
        fn new() -> Self {
            let geometry = test_geometry();
            let device = Cursor::new(vec![0u8; geometry.total_size() as usize]);
            let table = ClusterTable::new_empty(&geometry);
            Self {
                device,
                table,
                geometry,
            }
        }

        fn io(&mut self) -> DirIo<'_, Cursor<Vec<u8>>> {
            DirIo {
                device: &mut self.device,
                table: &mut self.table,
                geometry: &self.geometry,
                encoding: codepage::get(437).unwrap(),
            }
        }

        fn root_offset(&self) -> usize {
            self.geometry.root_region_offset() as usize
        }
    }

    fn now() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn make_entry(name: &str) -> DirectoryEntry {
        let table = codepage::get(437).unwrap();
        let name = FatFileName::generate(name, table, |_| false).unwrap();
        DirectoryEntry::new(name, ATTR_ARCHIVE, now())
    }

    #[test]
    fn test_load_empty_root() {
        let mut fx = Fixture::new();
        let dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        assert!(dir.is_empty());
        assert_eq!(dir.end_of_entries(), 0);
    }

    #[test]
    fn test_add_find_reload() {
        let mut fx = Fixture::new();
        let mut dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();

        let pos = dir.add_entry(&mut fx.io(), make_entry("Hello World.txt")).unwrap();
        assert_eq!(pos, 0);
        // 15 chars -> 2 LFN slots + 1 SFN
        assert_eq!(dir.end_of_entries(), 96);

        let encoding = codepage::get(437).unwrap();
        assert_eq!(dir.find("hello world.TXT", encoding), Some(0));
        assert_eq!(dir.find("HELLOW~1.TXT", encoding), Some(0));
        assert_eq!(dir.find("other.txt", encoding), None);

        // A fresh scan of the stream sees the same state
        let reloaded = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        assert_eq!(reloaded.find("Hello World.txt", encoding), Some(0));
        assert_eq!(reloaded.end_of_entries(), 96);
    }

    #[test]
    fn test_delete_reuses_slots() {
        let mut fx = Fixture::new();
        let mut dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();

        // 3 slots, then 1 slot
        let first = dir.add_entry(&mut fx.io(), make_entry("FOO_long_entry_1")).unwrap();
        let second = dir.add_entry(&mut fx.io(), make_entry("second.txt")).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 96);

        dir.delete_entry(&mut fx.io(), first, true).unwrap();
        // Tombstones on disk
        let disk = fx.device.get_ref();
        assert_eq!(disk[fx.root_offset()], 0xE5);
        assert_eq!(disk[fx.root_offset() + 32], 0xE5);
        assert_eq!(disk[fx.root_offset() + 64], 0xE5);

        // A 1-slot entry lands in the freed run, remainder keeps serving
        let ta = dir.add_entry(&mut fx.io(), make_entry("TA")).unwrap();
        let tb = dir.add_entry(&mut fx.io(), make_entry("TB")).unwrap();
        let tc = dir.add_entry(&mut fx.io(), make_entry("TC")).unwrap();
        assert_eq!(ta, 0);
        assert_eq!(tb, 32);
        assert_eq!(tc, 64);
        // Watermark untouched by recycling
        assert_eq!(dir.end_of_entries(), 128);
    }

    #[test]
    fn test_orphan_lfn_is_reclaimed() {
        let mut fx = Fixture::new();

        // Hand-craft: one orphaned LFN slot, then a valid plain entry
        let encoding = codepage::get(437).unwrap();
        let entry = make_entry("REAL.TXT");
        let mut bytes = vec![0u8; 64];
        bytes[0] = 0x41; // sequence 1 | last
        bytes[11] = ATTR_LONG_NAME;
        bytes[13] = 0xAB; // checksum matching nothing
        entry.encode(&mut bytes[32..64], encoding).unwrap();

        let root = fx.root_offset();
        fx.device.get_mut()[root..root + 64].copy_from_slice(&bytes);

        let mut dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        assert_eq!(dir.find("REAL.TXT", encoding), Some(32));
        assert_eq!(dir.end_of_entries(), 64);

        // The orphan slot is free: a 1-slot entry reuses position 0
        let pos = dir.add_entry(&mut fx.io(), make_entry("NEW.TXT")).unwrap();
        assert_eq!(pos, 0);
    }

    #[test]
    fn test_checksum_flip_tolerated() {
        let mut fx = Fixture::new();
        let encoding = codepage::get(437).unwrap();

        let entry = make_entry("long name victim.dat");
        let mut bytes = vec![0u8; entry.encoded_len()];
        entry.encode(&mut bytes, encoding).unwrap();
        bytes[13] ^= 0x5A; // corrupt the first LFN slot's checksum

        let root = fx.root_offset();
        let end = root + bytes.len();
        fx.device.get_mut()[root..end].copy_from_slice(&bytes);

        let dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        // The long name is lost but the short-name record survives
        let pos = dir.find("LONGNA~1.DAT", encoding).expect("SFN entry should survive");
        assert_eq!(dir.get_entry(pos).unwrap().name.long_name(), None);
    }

    #[test]
    fn test_add_collision_is_fatal() {
        let mut fx = Fixture::new();
        let mut dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        dir.add_entry(&mut fx.io(), make_entry("readme.md")).unwrap();
        let dup = dir.add_entry(&mut fx.io(), make_entry("README.MD"));
        assert!(matches!(dup, Err(FilesystemError::AlreadyExists(_))));
    }

    #[test]
    fn test_fixed_root_fills_up() {
        let mut fx = Fixture::new();
        let mut dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        // 32 root slots, one per short entry
        for i in 0..32 {
            dir.add_entry(&mut fx.io(), make_entry(&format!("F{i}.BIN"))).unwrap();
        }
        let overflow = dir.add_entry(&mut fx.io(), make_entry("LAST.BIN"));
        assert!(matches!(overflow, Err(FilesystemError::NoSpace(_))));
        // The failed append must not leak the watermark
        assert_eq!(dir.end_of_entries(), 32 * 32);
    }

    #[test]
    fn test_update_entry_in_place() {
        let mut fx = Fixture::new();
        let mut dir = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        let pos = dir.add_entry(&mut fx.io(), make_entry("grow.dat")).unwrap();

        let mut updated = dir.get_entry(pos).unwrap().clone();
        updated.size = 4096;
        updated.first_cluster = 9;
        dir.update_entry(&mut fx.io(), pos, updated).unwrap();

        let reloaded = Directory::load(&mut fx.io(), DirLocation::FixedRoot, None).unwrap();
        let entry = reloaded.get_entry(pos).unwrap();
        assert_eq!(entry.size, 4096);
        assert_eq!(entry.first_cluster, 9);
    }
}
