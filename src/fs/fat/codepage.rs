use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::FilesystemError;

/// Bidirectional map between bytes 0-255 and Unicode characters under one
/// OEM code page.
///
/// FAT short names are stored in a single-byte OEM encoding (CP437 unless
/// the volume was created under a localized DOS/Windows). Long names are
/// always UTF-16LE and never go through this table.
///
/// Tables are immutable after construction and cached process-wide keyed by
/// code-page id; the cache only ever inserts, so readers need no
/// coordination beyond the lookup lock.
pub struct SingleByteEncodingTable {
    code_page: u16,
    chars: [char; 256],
    to_byte: HashMap<char, u8>,
    /// `upper[b]` is the byte of the upper-cased character for byte `b`,
    /// falling back to `b` itself when the upper-case form is not in the
    /// table.
    upper: [u8; 256],
}

impl SingleByteEncodingTable {
    /// Build a table from the 128 high-half characters (bytes 0x80-0xFF).
    /// Bytes 0x00-0x7F always map to ASCII.
    pub fn new(code_page: u16, high: &[char; 128]) -> Self {
        let mut chars = ['\0'; 256];
        for (b, slot) in chars.iter_mut().enumerate() {
            *slot = if b < 0x80 {
                b as u8 as char
            } else {
                high[b - 0x80]
            };
        }

        let mut to_byte = HashMap::with_capacity(256);
        for (b, &c) in chars.iter().enumerate() {
            to_byte.entry(c).or_insert(b as u8);
        }

        let mut upper = [0u8; 256];
        for (b, slot) in upper.iter_mut().enumerate() {
            let uc = single_char_uppercase(chars[b]);
            *slot = to_byte.get(&uc).copied().unwrap_or(b as u8);
        }

        Self {
            code_page,
            chars,
            to_byte,
            upper,
        }
    }

    pub fn code_page(&self) -> u16 {
        self.code_page
    }

    /// Decode a single byte to its Unicode character.
    pub fn decode_byte(&self, b: u8) -> char {
        self.chars[b as usize]
    }

    /// Encode a character to its byte, if representable in this code page.
    pub fn byte_of(&self, c: char) -> Option<u8> {
        self.to_byte.get(&c).copied()
    }

    /// Encode a character to the byte of its upper-case form.
    ///
    /// Returns `None` when neither the character nor its upper-case form is
    /// representable.
    pub fn upper_byte_of(&self, c: char) -> Option<u8> {
        if let Some(b) = self.byte_of(c) {
            return Some(self.upper[b as usize]);
        }
        self.byte_of(single_char_uppercase(c))
    }

    /// Decode a byte slice to a `String`.
    pub fn decode_string(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.decode_byte(b)).collect()
    }

    /// Upper-case a string the way the OEM code page does: characters in the
    /// table go through the byte-level upper lookup, anything else through
    /// Unicode upper-casing. Used for case-insensitive name index keys.
    pub fn oem_upper(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            match self.byte_of(c) {
                Some(b) => out.push(self.decode_byte(self.upper[b as usize])),
                None => out.extend(c.to_uppercase()),
            }
        }
        out
    }
}

/// Single-character upper-case form, or the input itself when upper-casing
/// expands to multiple characters (e.g. 'ß' -> "SS").
fn single_char_uppercase(c: char) -> char {
    let mut it = c.to_uppercase();
    match (it.next(), it.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}

static TABLES: OnceLock<Mutex<HashMap<u16, &'static SingleByteEncodingTable>>> = OnceLock::new();

/// Look up (and lazily build) the table for a code page.
///
/// Built-in pages: 437 (default), 850, 1252. Other pages must be registered
/// through [`register`] first.
pub fn get(code_page: u16) -> Result<&'static SingleByteEncodingTable, FilesystemError> {
    let map = TABLES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = map.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(table) = cache.get(&code_page) {
        return Ok(table);
    }

    let high = match code_page {
        437 => &CP437_HIGH,
        850 => &CP850_HIGH,
        1252 => &CP1252_HIGH,
        _ => {
            return Err(FilesystemError::Unsupported(format!(
                "no built-in table for code page {code_page}"
            )))
        }
    };
    let table: &'static _ = Box::leak(Box::new(SingleByteEncodingTable::new(code_page, high)));
    cache.insert(code_page, table);
    Ok(table)
}

/// Register a custom code-page table. Ignored if the page is already cached.
pub fn register(table: SingleByteEncodingTable) -> &'static SingleByteEncodingTable {
    let map = TABLES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = map.lock().unwrap_or_else(|e| e.into_inner());
    let key = table.code_page;
    *cache
        .entry(key)
        .or_insert_with(|| Box::leak(Box::new(table)))
}

/// CP437 to Unicode mapping for bytes 0x80-0xFF.
#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    // 0x80-0x8F
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    // 0x90-0x9F
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','¢','£','¥','₧','ƒ',
    // 0xA0-0xAF
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','⌐','¬','½','¼','¡','«','»',
    // 0xB0-0xBF
    '░','▒','▓','│','┤','╡','╢','╖', '╕','╣','║','╗','╝','╜','╛','┐',
    // 0xC0-0xCF
    '└','┴','┬','├','─','┼','╞','╟', '╚','╔','╩','╦','╠','═','╬','╧',
    // 0xD0-0xDF
    '╨','╤','╥','╙','╘','╒','╓','╫', '╪','┘','┌','█','▄','▌','▐','▀',
    // 0xE0-0xEF
    'α','ß','Γ','π','Σ','σ','µ','τ', 'Φ','Θ','Ω','δ','∞','φ','ε','∩',
    // 0xF0-0xFF
    '≡','±','≥','≤','⌠','⌡','÷','≈', '°','∙','·','√','ⁿ','²','■','\u{00A0}',
];

/// CP850 (DOS Latin-1) to Unicode mapping for bytes 0x80-0xFF.
#[rustfmt::skip]
const CP850_HIGH: [char; 128] = [
    // 0x80-0x8F
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    // 0x90-0x9F
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','ø','£','Ø','×','ƒ',
    // 0xA0-0xAF
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','®','¬','½','¼','¡','«','»',
    // 0xB0-0xBF
    '░','▒','▓','│','┤','Á','Â','À', '©','╣','║','╗','╝','¢','¥','┐',
    // 0xC0-0xCF
    '└','┴','┬','├','─','┼','ã','Ã', '╚','╔','╩','╦','╠','═','╬','¤',
    // 0xD0-0xDF
    'ð','Ð','Ê','Ë','È','ı','Í','Î', 'Ï','┘','┌','█','▄','¦','Ì','▀',
    // 0xE0-0xEF
    'Ó','ß','Ô','Ò','õ','Õ','µ','þ', 'Þ','Ú','Û','Ù','ý','Ý','¯','´',
    // 0xF0-0xFF
    '\u{00AD}','±','‗','¾','¶','§','÷','¸', '°','¨','·','¹','³','²','■','\u{00A0}',
];

/// Windows-1252 to Unicode mapping for bytes 0x80-0xFF. Undefined slots map
/// to the corresponding C1 control so the table stays bijective.
#[rustfmt::skip]
const CP1252_HIGH: [char; 128] = [
    // 0x80-0x8F
    '€','\u{0081}','‚','ƒ','„','…','†','‡', 'ˆ','‰','Š','‹','Œ','\u{008D}','Ž','\u{008F}',
    // 0x90-0x9F
    '\u{0090}','\u{2018}','\u{2019}','“','”','•','–','—', '˜','™','š','›','œ','\u{009D}','ž','Ÿ',
    // 0xA0-0xAF
    '\u{00A0}','¡','¢','£','¤','¥','¦','§', '¨','©','ª','«','¬','\u{00AD}','®','¯',
    // 0xB0-0xBF
    '°','±','²','³','´','µ','¶','·', '¸','¹','º','»','¼','½','¾','¿',
    // 0xC0-0xCF
    'À','Á','Â','Ã','Ä','Å','Æ','Ç', 'È','É','Ê','Ë','Ì','Í','Î','Ï',
    // 0xD0-0xDF
    'Ð','Ñ','Ò','Ó','Ô','Õ','Ö','×', 'Ø','Ù','Ú','Û','Ü','Ý','Þ','ß',
    // 0xE0-0xEF
    'à','á','â','ã','ä','å','æ','ç', 'è','é','ê','ë','ì','í','î','ï',
    // 0xF0-0xFF
    'ð','ñ','ò','ó','ô','õ','ö','÷', 'ø','ù','ú','û','ü','ý','þ','ÿ',
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_round_trip() {
        let table = get(437).unwrap();
        assert_eq!(table.decode_byte(b'A'), 'A');
        assert_eq!(table.byte_of('z'), Some(b'z'));
        assert_eq!(table.upper_byte_of('z'), Some(b'Z'));
    }

    #[test]
    fn test_cp437_high_half() {
        let table = get(437).unwrap();
        // 0x82 = é, upper-cases to É = 0x90
        assert_eq!(table.decode_byte(0x82), 'é');
        assert_eq!(table.byte_of('é'), Some(0x82));
        assert_eq!(table.upper_byte_of('é'), Some(0x90));
        // 0x98 = ÿ: Ÿ is not in CP437, so upper-casing falls back
        assert_eq!(table.upper_byte_of('ÿ'), Some(0x98));
    }

    #[test]
    fn test_unencodable() {
        let table = get(437).unwrap();
        assert_eq!(table.byte_of('✨'), None);
        assert_eq!(table.upper_byte_of('✨'), None);
    }

    #[test]
    fn test_cp850_differs_from_437() {
        let t850 = get(850).unwrap();
        assert_eq!(t850.decode_byte(0x9B), 'ø');
        assert_eq!(t850.upper_byte_of('ø'), Some(0x9D));
        let t437 = get(437).unwrap();
        assert_eq!(t437.decode_byte(0x9B), '¢');
    }

    #[test]
    fn test_cp1252() {
        let table = get(1252).unwrap();
        assert_eq!(table.byte_of('€'), Some(0x80));
        assert_eq!(table.upper_byte_of('é'), Some(0xC9));
    }

    #[test]
    fn test_oem_upper() {
        let table = get(437).unwrap();
        assert_eq!(table.oem_upper("réadme.txt"), "RÉADME.TXT");
        assert_eq!(table.oem_upper("Mixed✨Case"), "MIXED✨CASE");
    }

    #[test]
    fn test_unknown_code_page() {
        assert!(get(932).is_err());
    }
}
