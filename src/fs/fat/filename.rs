use std::fmt;

use crate::error::FilesystemError;

use super::codepage::SingleByteEncodingTable;
use super::dir_entry::{ATTR_LONG_NAME, DIR_ENTRY_SIZE};

/// UTF-16 code units stored per LFN slot.
const LFN_CHARS_PER_SLOT: usize = 13;

/// Maximum long filename length in UTF-16 code units.
pub const MAX_LONG_NAME: usize = 255;

/// Characters rejected in long filenames (plus all controls < 0x20).
const LONG_NAME_INVALID: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

/// Characters legal in long names but not in 8.3 short names.
const SHORT_NAME_INVALID: &[char] = &['+', ',', ';', '=', '[', ']'];

/// A FAT filename: an 8.3 short name plus an optional VFAT long name.
///
/// The short name is kept in display case; the case-flag bits of the
/// directory record are derived from it on encode. The long name, when
/// present, is the reason the name needs LFN slots: it differs from the
/// short name in length, character set, or intra-part case mixing.
///
/// Besides normal names there are three special values: the `.` and `..`
/// sentinels, the null marker (an all-zero record, terminating the
/// directory), and the deleted marker (a tombstoned or orphaned record).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatFileName {
    short: String,
    long: Option<String>,
    marker: Marker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Marker {
    Normal,
    Null,
    Deleted,
}

impl FatFileName {
    pub fn null() -> Self {
        Self {
            short: String::new(),
            long: None,
            marker: Marker::Null,
        }
    }

    pub fn deleted() -> Self {
        Self {
            short: String::new(),
            long: None,
            marker: Marker::Deleted,
        }
    }

    pub fn self_entry() -> Self {
        Self {
            short: ".".into(),
            long: None,
            marker: Marker::Normal,
        }
    }

    pub fn parent_entry() -> Self {
        Self {
            short: "..".into(),
            long: None,
            marker: Marker::Normal,
        }
    }

    pub fn is_null(&self) -> bool {
        self.marker == Marker::Null
    }

    pub fn is_deleted(&self) -> bool {
        self.marker == Marker::Deleted
    }

    pub fn is_self(&self) -> bool {
        self.marker == Marker::Normal && self.short == "."
    }

    pub fn is_parent(&self) -> bool {
        self.marker == Marker::Normal && self.short == ".."
    }

    pub fn short_name(&self) -> &str {
        &self.short
    }

    pub fn long_name(&self) -> Option<&str> {
        self.long.as_deref()
    }

    /// The name presented to users: the long name when present, otherwise
    /// the case-restored short name.
    pub fn full_name(&self) -> &str {
        self.long.as_deref().unwrap_or(&self.short)
    }

    /// Number of LFN slots preceding the short-name record on disk.
    pub fn lfn_slot_count(&self) -> usize {
        match &self.long {
            Some(long) => (long.encode_utf16().count() + LFN_CHARS_PER_SLOT - 1) / LFN_CHARS_PER_SLOT,
            None => 0,
        }
    }

    /// Encoded size on disk: one record per LFN slot plus the short-name
    /// record.
    pub fn encoded_len(&self) -> usize {
        (self.lfn_slot_count() + 1) * DIR_ENTRY_SIZE
    }

    // -----------------------------------------------------------------------
    // Decode
    // -----------------------------------------------------------------------

    /// Decode a name from one or more consecutive 32-byte records.
    ///
    /// Returns the name and the number of bytes consumed. Malformed LFN
    /// chains (bad sequence, wrong attribute, checksum mismatch, missing
    /// short-name record) consume only the first record and come back as the
    /// deleted marker, so the scanner can turn them into free slots.
    pub fn decode(data: &[u8], table: &SingleByteEncodingTable) -> (FatFileName, usize) {
        debug_assert!(data.len() >= DIR_ENTRY_SIZE);

        match data[0] {
            0x00 => return (FatFileName::null(), DIR_ENTRY_SIZE),
            0xE5 => return (FatFileName::deleted(), DIR_ENTRY_SIZE),
            _ => {}
        }

        if data[11] == ATTR_LONG_NAME {
            match Self::decode_lfn_chain(data, table) {
                Some(result) => result,
                None => (FatFileName::deleted(), DIR_ENTRY_SIZE),
            }
        } else {
            (Self::decode_sfn(data, table), DIR_ENTRY_SIZE)
        }
    }

    fn decode_lfn_chain(
        data: &[u8],
        table: &SingleByteEncodingTable,
    ) -> Option<(FatFileName, usize)> {
        let first = data[0];
        // The physically first slot must be the chain terminator
        if first & 0x40 == 0 {
            return None;
        }
        let count = (first & 0x3F) as usize;
        if count == 0 || count > (MAX_LONG_NAME + 12) / 13 {
            return None;
        }
        if data.len() < (count + 1) * DIR_ENTRY_SIZE {
            return None;
        }

        let checksum = data[13];
        for k in 0..count {
            let slot = &data[k * DIR_ENTRY_SIZE..(k + 1) * DIR_ENTRY_SIZE];
            let expected_seq = (count - k) as u8 | if k == 0 { 0x40 } else { 0 };
            if slot[0] != expected_seq || slot[11] != ATTR_LONG_NAME || slot[13] != checksum {
                return None;
            }
        }

        let sfn = &data[count * DIR_ENTRY_SIZE..(count + 1) * DIR_ENTRY_SIZE];
        if sfn[0] == 0x00 || sfn[0] == 0xE5 || sfn[11] == ATTR_LONG_NAME {
            return None;
        }
        let mut name_bytes = [0u8; 11];
        name_bytes.copy_from_slice(&sfn[0..11]);
        if checksum != Self::checksum(&name_bytes) {
            return None;
        }

        // Assemble code units in increasing index order (reverse of the
        // physical order), stopping at the NUL terminator.
        let mut units = Vec::with_capacity(count * LFN_CHARS_PER_SLOT);
        'slots: for k in (0..count).rev() {
            let slot = &data[k * DIR_ENTRY_SIZE..(k + 1) * DIR_ENTRY_SIZE];
            for &(lo, hi) in LFN_UNIT_OFFSETS.iter() {
                let unit = u16::from_le_bytes([slot[lo], slot[hi]]);
                if unit == 0x0000 {
                    break 'slots;
                }
                units.push(unit);
            }
        }
        let long = String::from_utf16(&units).ok()?;
        if long.is_empty() {
            return None;
        }

        let sfn_name = Self::decode_sfn(sfn, table);
        Some((
            FatFileName {
                short: sfn_name.short,
                long: Some(long),
                marker: Marker::Normal,
            },
            (count + 1) * DIR_ENTRY_SIZE,
        ))
    }

    /// Decode the 8.3 name of a single short-name record, restoring the
    /// 0x05 -> 0xE5 lead byte and applying the case flags of byte 12.
    fn decode_sfn(record: &[u8], table: &SingleByteEncodingTable) -> FatFileName {
        let mut raw = [0u8; 11];
        raw.copy_from_slice(&record[0..11]);
        if raw[0] == 0x05 {
            raw[0] = 0xE5;
        }

        // The self/parent sentinels are raw dots, not code-page text
        if raw.starts_with(b".. ") {
            return FatFileName::parent_entry();
        }
        if raw.starts_with(b". ") {
            return FatFileName::self_entry();
        }

        let flags = record[12];
        let decode_part = |bytes: &[u8], lower: bool| -> String {
            let trimmed = match bytes.iter().rposition(|&b| b != 0x20) {
                Some(last) => &bytes[..=last],
                None => &bytes[..0],
            };
            let part: String = trimmed.iter().map(|&b| table.decode_byte(b)).collect();
            if lower {
                part.to_lowercase()
            } else {
                part
            }
        };

        let base = decode_part(&raw[0..8], flags & 0x08 != 0);
        let ext = decode_part(&raw[8..11], flags & 0x10 != 0);

        let short = if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        };

        FatFileName {
            short,
            long: None,
            marker: Marker::Normal,
        }
    }

    // -----------------------------------------------------------------------
    // Encode
    // -----------------------------------------------------------------------

    /// Encode this name into `(lfn_slot_count + 1) * 32` bytes.
    ///
    /// LFN slots are written completely; of the final short-name record only
    /// the name bytes `[0..11]` and the case-flag byte `[12]` are filled.
    /// The directory-entry codec owns the rest of that record.
    pub fn encode(
        &self,
        buf: &mut [u8],
        table: &SingleByteEncodingTable,
    ) -> Result<(), FilesystemError> {
        debug_assert_eq!(buf.len(), self.encoded_len());
        debug_assert_eq!(self.marker, Marker::Normal);

        let lfn_count = self.lfn_slot_count();
        let sfn_off = lfn_count * DIR_ENTRY_SIZE;
        let mut name_bytes = self.short_name_bytes(table)?;
        // 0x05 substitution happens before checksumming: the checksum covers
        // the bytes as stored, and decode recomputes it from the disk bytes
        if name_bytes[0] == 0xE5 {
            name_bytes[0] = 0x05;
        }

        let sfn = &mut buf[sfn_off..sfn_off + DIR_ENTRY_SIZE];
        sfn[0..11].copy_from_slice(&name_bytes);
        sfn[12] = if self.long.is_none() {
            self.case_flags()
        } else {
            0
        };

        if let Some(long) = &self.long {
            let units: Vec<u16> = long.encode_utf16().collect();
            let checksum = Self::checksum(&name_bytes);
            for i in (1..=lfn_count).rev() {
                let slot_off = (lfn_count - i) * DIR_ENTRY_SIZE;
                let slot = &mut buf[slot_off..slot_off + DIR_ENTRY_SIZE];
                slot[0] = i as u8 | if i == lfn_count { 0x40 } else { 0 };
                slot[11] = ATTR_LONG_NAME;
                slot[12] = 0;
                slot[13] = checksum;
                slot[26] = 0;
                slot[27] = 0;
                for (j, &(lo, hi)) in LFN_UNIT_OFFSETS.iter().enumerate() {
                    let idx = (i - 1) * LFN_CHARS_PER_SLOT + j;
                    // One NUL terminator after the name, 0xFFFF fill beyond
                    let unit = match idx.cmp(&units.len()) {
                        std::cmp::Ordering::Less => units[idx],
                        std::cmp::Ordering::Equal => 0x0000,
                        std::cmp::Ordering::Greater => 0xFFFF,
                    };
                    let bytes = unit.to_le_bytes();
                    slot[lo] = bytes[0];
                    slot[hi] = bytes[1];
                }
            }
        }

        Ok(())
    }

    /// The 11 raw name bytes: upper-cased base padded to 8, extension padded
    /// to 3.
    pub fn short_name_bytes(
        &self,
        table: &SingleByteEncodingTable,
    ) -> Result<[u8; 11], FilesystemError> {
        let mut out = [0x20u8; 11];

        if self.is_self() {
            out[0] = b'.';
            return Ok(out);
        }
        if self.is_parent() {
            out[0] = b'.';
            out[1] = b'.';
            return Ok(out);
        }

        let (base, ext) = split_short(&self.short);
        if base.chars().count() > 8 || ext.chars().count() > 3 {
            return Err(FilesystemError::InvalidName(format!(
                "not an 8.3 name: {}",
                self.short
            )));
        }
        for (i, c) in base.chars().enumerate() {
            out[i] = table.upper_byte_of(c).ok_or_else(|| {
                FilesystemError::InvalidName(format!(
                    "character {c:?} not encodable in code page {}",
                    table.code_page()
                ))
            })?;
        }
        for (i, c) in ext.chars().enumerate() {
            out[8 + i] = table.upper_byte_of(c).ok_or_else(|| {
                FilesystemError::InvalidName(format!(
                    "character {c:?} not encodable in code page {}",
                    table.code_page()
                ))
            })?;
        }
        Ok(out)
    }

    /// Byte 12 of the short-name record: bit 3 = base stored lowercase,
    /// bit 4 = extension stored lowercase.
    fn case_flags(&self) -> u8 {
        let (base, ext) = split_short(&self.short);
        let mut flags = 0u8;
        if is_all_lowercase(base) {
            flags |= 0x08;
        }
        if is_all_lowercase(ext) {
            flags |= 0x10;
        }
        flags
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Derive a `FatFileName` from a user-supplied name.
    ///
    /// `exists` reports whether a candidate short name is already taken in
    /// the target directory; it drives the `~n` collision tail and the hash
    /// fallback after four collisions.
    pub fn generate(
        name: &str,
        table: &SingleByteEncodingTable,
        mut exists: impl FnMut(&str) -> bool,
    ) -> Result<FatFileName, FilesystemError> {
        if name.is_empty() {
            return Err(FilesystemError::InvalidName("empty name".into()));
        }
        if name.encode_utf16().count() > MAX_LONG_NAME {
            return Err(FilesystemError::InvalidName(format!(
                "name longer than {MAX_LONG_NAME} characters"
            )));
        }
        for c in name.chars() {
            if c < '\x20' || LONG_NAME_INVALID.contains(&c) {
                return Err(FilesystemError::InvalidName(format!(
                    "character {c:?} not allowed in a filename"
                )));
            }
        }

        let stripped = name.trim_end_matches('.');
        if stripped.is_empty() {
            return Err(FilesystemError::InvalidName(format!(
                "name reduces to nothing: {name:?}"
            )));
        }

        if let Some(short) = Self::try_verbatim_short(stripped, table) {
            return Ok(FatFileName {
                short,
                long: None,
                marker: Marker::Normal,
            });
        }

        // Lossy path: mangle into 8.3 with a numeric tail.
        let trimmed = stripped.trim_start_matches([' ', '.']);
        let (base_src, ext_src) = match trimmed.rfind('.') {
            Some(dot) => (&trimmed[..dot], &trimmed[dot + 1..]),
            None => (trimmed, ""),
        };

        let mut unencodable = false;
        let base = mangle_part(base_src, 8, table, &mut unencodable);
        let ext = mangle_part(ext_src, 3, table, &mut unencodable);

        let hash_tail = format!("{:04X}", Self::lfn_hash(stripped));
        let mut hashed = unencodable;
        let mut base = if hashed {
            hashed_base(&base, &hash_tail)
        } else {
            base
        };

        let ext_str = table.decode_string(&ext);
        let mut n: u64 = 1;
        let short = loop {
            let tail = format!("~{n}");
            let keep = base.len().min(8 - tail.len());
            let mut candidate = table.decode_string(&base[..keep]);
            candidate.push_str(&tail);
            if !ext_str.is_empty() {
                candidate.push('.');
                candidate.push_str(&ext_str);
            }
            if !exists(&candidate) {
                break candidate;
            }
            n += 1;
            if n > 4 && !hashed {
                hashed = true;
                base = hashed_base(&base, &hash_tail);
                n = 1;
            }
            if n > 999_999 {
                return Err(FilesystemError::NoSpace(format!(
                    "short name collision space exhausted for {name:?}"
                )));
            }
        };

        Ok(FatFileName {
            short,
            long: Some(stripped.to_string()),
            marker: Marker::Normal,
        })
    }

    /// The non-lossy fast path: the name already has 8.3 shape, needs no
    /// character substitution, and mixes case at most per-part (so the case
    /// flags can carry it without an LFN chain).
    fn try_verbatim_short(name: &str, table: &SingleByteEncodingTable) -> Option<String> {
        let (base, ext) = match name.rfind('.') {
            Some(dot) => (&name[..dot], &name[dot + 1..]),
            None => (name, ""),
        };
        if base.is_empty() || base.contains('.') {
            return None;
        }
        if base.chars().count() > 8 || ext.chars().count() > 3 {
            return None;
        }
        for c in base.chars().chain(ext.chars()) {
            if c == ' ' || c == '.' || SHORT_NAME_INVALID.contains(&c) {
                return None;
            }
            table.upper_byte_of(c)?;
        }
        if is_case_mixed(base) || is_case_mixed(ext) {
            return None;
        }
        Some(name.to_string())
    }

    // -----------------------------------------------------------------------
    // Digests
    // -----------------------------------------------------------------------

    /// Checksum over the 11 raw short-name bytes, stored in byte 13 of every
    /// LFN slot: rotate right one bit, add the next byte, wrap at 8 bits.
    pub fn checksum(name_bytes: &[u8; 11]) -> u8 {
        let mut sum = 0u8;
        for &b in name_bytes {
            sum = (((sum & 1) << 7) | (sum >> 1)).wrapping_add(b);
        }
        sum
    }

    /// 16-bit digest of a long name, used for collision-resistant short-name
    /// tails. Deterministic and stable across platforms.
    pub fn lfn_hash(name: &str) -> u16 {
        let mut h: u16 = 0;
        for unit in name.encode_utf16() {
            h = h.wrapping_mul(0x25).wrapping_add(unit);
        }
        let scrambled = (h as u32).wrapping_mul(314_159_269) as i32;
        let mut t = (scrambled as i64).abs();
        t -= ((t * 1_152_921_497) >> 60) * 1_000_000_007;
        let h = t as u16;
        // Reverse the four nibbles
        (h >> 12) | ((h >> 4) & 0x00F0) | ((h << 4) & 0x0F00) | (h << 12)
    }
}

impl fmt::Display for FatFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.marker {
            Marker::Null => write!(f, "<null>"),
            Marker::Deleted => write!(f, "<deleted>"),
            Marker::Normal => f.write_str(self.full_name()),
        }
    }
}

/// Byte offsets of the (low, high) halves of the 13 UTF-16 code units within
/// an LFN slot: five at [1..11], six at [14..26], two at [28..32].
#[rustfmt::skip]
const LFN_UNIT_OFFSETS: [(usize, usize); 13] = [
    (1, 2), (3, 4), (5, 6), (7, 8), (9, 10),
    (14, 15), (16, 17), (18, 19), (20, 21), (22, 23), (24, 25),
    (28, 29), (30, 31),
];

fn split_short(short: &str) -> (&str, &str) {
    match short.rfind('.') {
        Some(dot) => (&short[..dot], &short[dot + 1..]),
        None => (short, ""),
    }
}

fn is_all_lowercase(part: &str) -> bool {
    part.chars().any(|c| c.is_lowercase()) && !part.chars().any(|c| c.is_uppercase())
}

fn is_case_mixed(part: &str) -> bool {
    part.chars().any(|c| c.is_lowercase()) && part.chars().any(|c| c.is_uppercase())
}

/// Build a mangled 8.3 part: spaces and dots are dropped, characters illegal
/// in short names become `_`, everything is upper-cased through the code
/// page, and the result is capped at `max` bytes. Characters the code page
/// cannot represent are skipped and flagged for the hash fallback.
fn mangle_part(
    src: &str,
    max: usize,
    table: &SingleByteEncodingTable,
    unencodable: &mut bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(max);
    for c in src.chars() {
        if c == ' ' || c == '.' {
            continue;
        }
        let b = if SHORT_NAME_INVALID.contains(&c) {
            Some(b'_')
        } else {
            table.upper_byte_of(c)
        };
        match b {
            Some(b) => {
                if out.len() < max {
                    out.push(b);
                }
            }
            None => *unencodable = true,
        }
    }
    out
}

/// Replace the base's tail with the 4-hex-digit hash, keeping at most the
/// first two encodable characters.
fn hashed_base(base: &[u8], hash_tail: &str) -> Vec<u8> {
    let mut out = base[..base.len().min(2)].to_vec();
    out.extend_from_slice(hash_tail.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::codepage;

    fn table() -> &'static SingleByteEncodingTable {
        codepage::get(437).unwrap()
    }

    fn never_exists(_: &str) -> bool {
        false
    }

    #[test]
    fn test_generate_truncates_with_tail() {
        let name = FatFileName::generate("this_is_a_long_name", table(), never_exists).unwrap();
        assert_eq!(name.short_name(), "THIS_I~1");
        assert_eq!(name.long_name(), Some("this_is_a_long_name"));
    }

    #[test]
    fn test_generate_numeric_tail_collision() {
        let name = FatFileName::generate("V1Abcd_this_is_to_long.TXT", table(), |s| {
            s == "V1ABCD~1.TXT"
        })
        .unwrap();
        assert_eq!(name.short_name(), "V1ABCD~2.TXT");
        assert_eq!(name.long_name(), Some("V1Abcd_this_is_to_long.TXT"));
    }

    #[test]
    fn test_generate_hash_fallback_after_four_collisions() {
        let taken = [
            "V2ABCD~1.TXT",
            "V2ABCD~2.TXT",
            "V2ABCD~3.TXT",
            "V2ABCD~4.TXT",
        ];
        let name = FatFileName::generate("V2Abcd_this_is_to_long.TXT", table(), |s| {
            taken.contains(&s)
        })
        .unwrap();
        assert_eq!(name.short_name(), "V2DB58~1.TXT");
        assert_eq!(name.long_name(), Some("V2Abcd_this_is_to_long.TXT"));
    }

    #[test]
    fn test_generate_unencodable_uses_hash() {
        let name = FatFileName::generate("✨.txt", table(), never_exists).unwrap();
        assert_eq!(name.short_name(), "6393~1.TXT");
        assert_eq!(name.long_name(), Some("✨.txt"));
    }

    #[test]
    fn test_generate_trailing_dots_stripped() {
        let name = FatFileName::generate("txt...", table(), never_exists).unwrap();
        assert_eq!(name.short_name(), "txt");
        assert_eq!(name.long_name(), None);
    }

    #[test]
    fn test_generate_case_only_difference_needs_no_lfn() {
        let name = FatFileName::generate("readme.TXT", table(), never_exists).unwrap();
        assert_eq!(name.short_name(), "readme.TXT");
        assert_eq!(name.long_name(), None);
        assert_eq!(name.lfn_slot_count(), 0);
    }

    #[test]
    fn test_generate_mixed_case_within_part_needs_lfn() {
        let name = FatFileName::generate("Readme.txt", table(), never_exists).unwrap();
        assert_eq!(name.short_name(), "README~1.TXT");
        assert_eq!(name.long_name(), Some("Readme.txt"));
    }

    #[test]
    fn test_generate_rejections() {
        assert!(FatFileName::generate("", table(), never_exists).is_err());
        assert!(FatFileName::generate("...", table(), never_exists).is_err());
        assert!(FatFileName::generate("a\u{7}b", table(), never_exists).is_err());
        assert!(FatFileName::generate("a*b", table(), never_exists).is_err());
        assert!(FatFileName::generate("a\\b", table(), never_exists).is_err());
    }

    #[test]
    fn test_generate_length_boundary() {
        let max = "x".repeat(255);
        let name = FatFileName::generate(&max, table(), never_exists).unwrap();
        assert_eq!(name.long_name(), Some(max.as_str()));
        assert_eq!(name.lfn_slot_count(), 20);

        let too_long = "x".repeat(256);
        assert!(FatFileName::generate(&too_long, table(), never_exists).is_err());
    }

    #[test]
    fn test_round_trip_long_name() {
        let name = FatFileName::generate("Some long Filename.dat", table(), never_exists).unwrap();
        let mut buf = vec![0u8; name.encoded_len()];
        name.encode(&mut buf, table()).unwrap();

        let (decoded, consumed) = FatFileName::decode(&buf, table());
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, name);
    }

    #[test]
    fn test_round_trip_case_flags() {
        for input in ["lower.txt", "UPPER.low", "mix.TXT"] {
            let name = FatFileName::generate(input, table(), never_exists).unwrap();
            assert_eq!(name.long_name(), None, "{input} should not need an LFN");
            let mut buf = vec![0u8; 32];
            name.encode(&mut buf, table()).unwrap();
            let (decoded, consumed) = FatFileName::decode(&buf, table());
            assert_eq!(consumed, 32);
            assert_eq!(decoded.short_name(), input);
        }
    }

    #[test]
    fn test_decode_corrupt_checksum_is_orphan() {
        let name = FatFileName::generate("corruptible name.bin", table(), never_exists).unwrap();
        let mut buf = vec![0u8; name.encoded_len()];
        name.encode(&mut buf, table()).unwrap();
        buf[13] ^= 0xFF;

        let (decoded, consumed) = FatFileName::decode(&buf, table());
        assert!(decoded.is_deleted());
        assert_eq!(consumed, 32);
    }

    #[test]
    fn test_decode_markers() {
        let zeroes = [0u8; 32];
        let (name, _) = FatFileName::decode(&zeroes, table());
        assert!(name.is_null());

        let mut tomb = [0u8; 32];
        tomb[0] = 0xE5;
        let (name, _) = FatFileName::decode(&tomb, table());
        assert!(name.is_deleted());
    }

    #[test]
    fn test_decode_kanji_lead_byte() {
        let mut record = [0x20u8; 32];
        record[0] = 0x05; // stored form of 0xE5
        record[1] = b'X';
        let (name, _) = FatFileName::decode(&record, table());
        assert_eq!(name.short_name().chars().next(), Some('σ'));
    }

    #[test]
    fn test_round_trip_lfn_with_kanji_lead_byte() {
        // CP850 stores Õ as 0xE5, so the short name's lead byte goes to
        // disk as 0x05 and the LFN checksum must cover the stored form
        let table = codepage::get(850).unwrap();
        let name = FatFileName::generate("Õther file.txt", table, |_| false).unwrap();
        assert_eq!(name.short_name(), "ÕTHERF~1.TXT");
        assert_eq!(name.long_name(), Some("Õther file.txt"));

        let mut buf = vec![0u8; name.encoded_len()];
        name.encode(&mut buf, table).unwrap();
        assert_eq!(buf[buf.len() - 32], 0x05);

        let (decoded, consumed) = FatFileName::decode(&buf, table);
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, name);
    }

    #[test]
    fn test_lfn_hash_values() {
        assert_eq!(
            format!("{:04X}", FatFileName::lfn_hash("V2Abcd_this_is_to_long.TXT")),
            "DB58"
        );
        assert_eq!(format!("{:04X}", FatFileName::lfn_hash("✨.txt")), "6393");
    }

    #[test]
    fn test_checksum_rotation() {
        // Rotate-right-and-add over "A" then spaces
        let mut bytes = [0x20u8; 11];
        bytes[0] = b'A';
        let direct = FatFileName::checksum(&bytes);
        let mut expected = b'A';
        for _ in 0..10 {
            expected = (((expected & 1) << 7) | (expected >> 1)).wrapping_add(0x20);
        }
        assert_eq!(direct, expected);
    }

    #[test]
    fn test_sentinels() {
        let dot = FatFileName::self_entry();
        assert!(dot.is_self());
        let mut buf = [0u8; 32];
        dot.encode(&mut buf, table()).unwrap();
        assert_eq!(&buf[0..11], b".          ");

        let dotdot = FatFileName::parent_entry();
        let mut buf = [0u8; 32];
        dotdot.encode(&mut buf, table()).unwrap();
        assert_eq!(&buf[0..11], b"..         ");
        let (decoded, _) = FatFileName::decode(&buf, table());
        assert!(decoded.is_parent());
    }
}
