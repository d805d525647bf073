use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::FilesystemError;

use super::codepage::SingleByteEncodingTable;
use super::filename::FatFileName;

/// Size of one directory record.
pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// The reserved combination marking an LFN slot. This is a distinct record
/// kind, not a flag composition: detection compares the whole byte.
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// A decoded directory entry: name, attributes, timestamps, first cluster
/// and size.
///
/// Timestamps are civil time in the volume's local-time convention at one
/// second resolution. The on-disk write time has two-second granularity;
/// the creation time keeps its odd second through the tenths byte.
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    pub name: FatFileName,
    pub attributes: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub creation: NaiveDateTime,
    pub last_access: NaiveDate,
    pub last_write: NaiveDateTime,
}

impl DirectoryEntry {
    pub fn new(name: FatFileName, attributes: u8, now: NaiveDateTime) -> Self {
        Self {
            name,
            attributes,
            first_cluster: 0,
            size: 0,
            creation: now,
            last_access: now.date(),
            last_write: now,
        }
    }

    /// Records occupied on disk: the LFN chain plus the short-name record.
    pub fn slot_count(&self) -> usize {
        1 + self.name.lfn_slot_count()
    }

    pub fn encoded_len(&self) -> usize {
        self.slot_count() * DIR_ENTRY_SIZE
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes != ATTR_LONG_NAME && self.attributes & ATTR_VOLUME_ID != 0
    }

    /// Decode an entry starting at `data[0]`, returning the entry and the
    /// bytes consumed. `None` for null, deleted and orphaned records.
    pub fn decode(
        data: &[u8],
        table: &SingleByteEncodingTable,
        fat32: bool,
    ) -> Option<(Self, usize)> {
        let (name, consumed) = FatFileName::decode(data, table);
        if name.is_null() || name.is_deleted() {
            return None;
        }
        let record = &data[consumed - DIR_ENTRY_SIZE..consumed];
        Some((Self::from_record(name, record, fat32), consumed))
    }

    /// Build an entry from an already-decoded name and its short-name
    /// record.
    pub fn from_record(name: FatFileName, record: &[u8], fat32: bool) -> Self {
        let attributes = record[11];
        let tenths = record[13];
        let creation_time = u16::from_le_bytes([record[14], record[15]]);
        let creation_date = u16::from_le_bytes([record[16], record[17]]);
        let access_date = u16::from_le_bytes([record[18], record[19]]);
        let cluster_hi = u16::from_le_bytes([record[20], record[21]]) as u32;
        let write_time = u16::from_le_bytes([record[22], record[23]]);
        let write_date = u16::from_le_bytes([record[24], record[25]]);
        let cluster_lo = u16::from_le_bytes([record[26], record[27]]) as u32;
        let size = u32::from_le_bytes([record[28], record[29], record[30], record[31]]);

        // The high half is only meaningful on FAT32; FAT12/16 reuse those
        // bytes for extended attributes.
        let first_cluster = if fat32 {
            (cluster_hi << 16) | cluster_lo
        } else {
            cluster_lo
        };

        let creation = decode_datetime(creation_date, creation_time)
            + chrono::Duration::seconds((tenths.min(199) / 100) as i64);

        Self {
            name,
            attributes,
            first_cluster,
            size,
            creation,
            last_access: decode_date(access_date),
            last_write: decode_datetime(write_date, write_time),
        }
    }

    /// Encode into `slot_count() * 32` bytes: LFN slots first, then the
    /// short-name record.
    pub fn encode(
        &self,
        buf: &mut [u8],
        table: &SingleByteEncodingTable,
    ) -> Result<(), FilesystemError> {
        debug_assert_eq!(buf.len(), self.encoded_len());
        self.name.encode(buf, table)?;

        let off = buf.len() - DIR_ENTRY_SIZE;
        let record = &mut buf[off..];
        record[11] = self.attributes;
        record[13] = (self.creation.second() % 2) as u8 * 100;
        record[14..16].copy_from_slice(&encode_time(self.creation.time()).to_le_bytes());
        record[16..18].copy_from_slice(&encode_date(self.creation.date()).to_le_bytes());
        record[18..20].copy_from_slice(&encode_date(self.last_access).to_le_bytes());
        record[20..22].copy_from_slice(&((self.first_cluster >> 16) as u16).to_le_bytes());
        record[22..24].copy_from_slice(&encode_time(self.last_write.time()).to_le_bytes());
        record[24..26].copy_from_slice(&encode_date(self.last_write.date()).to_le_bytes());
        record[26..28].copy_from_slice(&(self.first_cluster as u16).to_le_bytes());
        record[28..32].copy_from_slice(&self.size.to_le_bytes());
        Ok(())
    }
}

/// 1980-01-01T00:00:00, the sentinel for absent or invalid stored dates.
pub fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Unpack a DOS date: `(year-1980) << 9 | month << 5 | day`.
pub fn decode_date(raw: u16) -> NaiveDate {
    if raw == 0x0000 || raw == 0xFFFF {
        return epoch().date();
    }
    let day = (raw & 0x1F) as u32;
    let month = ((raw >> 5) & 0x0F) as u32;
    let year = 1980 + ((raw >> 9) & 0x7F) as i32;
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_else(|| epoch().date())
}

/// Unpack a DOS time: `hour << 11 | minute << 5 | second / 2`.
pub fn decode_time(raw: u16) -> NaiveTime {
    let second = ((raw & 0x1F) * 2) as u32;
    let minute = ((raw >> 5) & 0x3F) as u32;
    let hour = ((raw >> 11) & 0x1F) as u32;
    NaiveTime::from_hms_opt(hour, minute, second).unwrap_or_else(|| epoch().time())
}

pub fn decode_datetime(date: u16, time: u16) -> NaiveDateTime {
    decode_date(date).and_time(decode_time(time))
}

/// Pack a DOS date, clamping years outside 1980..=2107 into range.
pub fn encode_date(date: NaiveDate) -> u16 {
    if date.year() < 1980 {
        return 0x0021; // the epoch, 1980-01-01
    }
    let year = (date.year().min(2107) - 1980) as u16;
    (year << 9) | (date.month() as u16) << 5 | date.day() as u16
}

/// Pack a DOS time. Odd seconds round down; the caller keeps the odd second
/// in the creation tenths byte where the format allows it.
pub fn encode_time(time: NaiveTime) -> u16 {
    (time.hour() as u16) << 11 | (time.minute() as u16) << 5 | (time.second() as u16) / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::codepage;

    fn table() -> &'static SingleByteEncodingTable {
        codepage::get(437).unwrap()
    }

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_date_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 29).unwrap();
        assert_eq!(decode_date(encode_date(date)), date);
    }

    #[test]
    fn test_invalid_dates_decode_to_epoch() {
        assert_eq!(decode_date(0x0000), epoch().date());
        assert_eq!(decode_date(0xFFFF), epoch().date());
        // month 0 is structurally invalid
        assert_eq!(decode_date(1 << 9 | 5), epoch().date());
    }

    #[test]
    fn test_pre_epoch_clamps() {
        let date = NaiveDate::from_ymd_opt(1975, 6, 1).unwrap();
        assert_eq!(decode_date(encode_date(date)), epoch().date());
    }

    #[test]
    fn test_odd_seconds_round_down_in_write_time() {
        let time = NaiveTime::from_hms_opt(14, 30, 33).unwrap();
        let decoded = decode_time(encode_time(time));
        assert_eq!(decoded, NaiveTime::from_hms_opt(14, 30, 32).unwrap());
    }

    #[test]
    fn test_creation_keeps_odd_second_via_tenths() {
        let name = FatFileName::generate("a.txt", table(), |_| false).unwrap();
        let mut entry = DirectoryEntry::new(name, ATTR_ARCHIVE, dt(2026, 3, 5, 10, 20, 31));
        entry.size = 42;

        let mut buf = vec![0u8; entry.encoded_len()];
        entry.encode(&mut buf, table()).unwrap();
        let (decoded, _) = DirectoryEntry::decode(&buf, table(), false).unwrap();

        assert_eq!(decoded.creation, dt(2026, 3, 5, 10, 20, 31));
        assert_eq!(decoded.last_write, dt(2026, 3, 5, 10, 20, 30));
        assert_eq!(decoded.size, 42);
    }

    #[test]
    fn test_layout() {
        let name = FatFileName::generate("KERNEL.SYS", table(), |_| false).unwrap();
        let mut entry = DirectoryEntry::new(name, ATTR_ARCHIVE, dt(2020, 12, 24, 23, 59, 58));
        entry.first_cluster = 0x0012_0034;
        entry.size = 0xDEAD_BEEF;

        let mut buf = vec![0u8; 32];
        entry.encode(&mut buf, table()).unwrap();

        assert_eq!(&buf[0..11], b"KERNEL  SYS");
        assert_eq!(buf[11], ATTR_ARCHIVE);
        assert_eq!(u16::from_le_bytes([buf[20], buf[21]]), 0x0012);
        assert_eq!(u16::from_le_bytes([buf[26], buf[27]]), 0x0034);
        assert_eq!(
            u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
            0xDEAD_BEEF
        );

        // FAT32 reassembles the split cluster, FAT12/16 ignore the high half
        let (on32, _) = DirectoryEntry::decode(&buf, table(), true).unwrap();
        assert_eq!(on32.first_cluster, 0x0012_0034);
        let (on16, _) = DirectoryEntry::decode(&buf, table(), false).unwrap();
        assert_eq!(on16.first_cluster, 0x0034);
    }

    #[test]
    fn test_long_name_entry_round_trip() {
        let name =
            FatFileName::generate("Quarterly Report (final).docx", table(), |_| false).unwrap();
        let mut entry = DirectoryEntry::new(name, ATTR_ARCHIVE, dt(2026, 7, 1, 9, 0, 0));
        entry.first_cluster = 77;
        entry.size = 1024;

        let mut buf = vec![0u8; entry.encoded_len()];
        entry.encode(&mut buf, table()).unwrap();
        let (decoded, consumed) = DirectoryEntry::decode(&buf, table(), true).unwrap();

        assert_eq!(consumed, buf.len());
        assert_eq!(
            decoded.name.long_name(),
            Some("Quarterly Report (final).docx")
        );
        assert_eq!(decoded.first_cluster, 77);
        assert_eq!(decoded.slot_count(), entry.slot_count());
    }
}
