//! Character-set registry.
//!
//! Static tables map MySQL charset names and collation ids to the byte
//! encodings the driver can decode. Charsets whose encoding is not
//! supported fall back to UTF-8.
//!
//! Per-server facts that are not in the static tables (custom collations,
//! max bytes per character for exotic charsets) are loaded once per pool
//! through a [`ServerCharsetCache`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use sqlwire_core::Result;

/// Collation ids used by the driver.
pub mod collation {
    pub const LATIN1_SWEDISH_CI: u16 = 8;
    pub const UTF8_GENERAL_CI: u16 = 33;
    pub const UTF8MB4_GENERAL_CI: u16 = 45;
    pub const BINARY: u16 = 63;
    pub const UTF8MB4_UNICODE_CI: u16 = 224;
    pub const UTF8MB4_0900_AI_CI: u16 = 255;

    /// Collation requested in the handshake unless configured otherwise.
    pub const DEFAULT: u16 = UTF8MB4_GENERAL_CI;
}

/// A byte encoding the driver can convert to and from Rust strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Utf8,
    /// MySQL's `latin1` is Windows-1252.
    Windows1252,
    Ascii,
    Utf16Be,
    Utf16Le,
    Utf32Be,
    /// Raw bytes; each byte decodes to the code point of the same value.
    Binary,
}

/// Code points for Windows-1252 bytes 0x80..=0x9F.
const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

impl Encoding {
    /// Look up an encoding by its (case-insensitive) name.
    pub fn for_name(name: &str) -> Option<Self> {
        let encoding = match name.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Encoding::Utf8,
            "windows-1252" | "cp1252" | "latin1" | "iso-8859-1" => Encoding::Windows1252,
            "us-ascii" | "ascii" => Encoding::Ascii,
            "utf-16be" | "utf-16" => Encoding::Utf16Be,
            "utf-16le" => Encoding::Utf16Le,
            "utf-32be" | "utf-32" => Encoding::Utf32Be,
            "binary" => Encoding::Binary,
            _ => return None,
        };
        Some(encoding)
    }

    /// Decode bytes, replacing invalid sequences with U+FFFD.
    pub fn decode<'a>(self, bytes: &'a [u8]) -> Cow<'a, str> {
        if bytes.is_empty() {
            return Cow::Borrowed("");
        }
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes),
            Encoding::Ascii => {
                if bytes.is_ascii() {
                    String::from_utf8_lossy(bytes)
                } else {
                    Cow::Owned(
                        bytes
                            .iter()
                            .map(|&b| if b.is_ascii() { char::from(b) } else { '\u{FFFD}' })
                            .collect(),
                    )
                }
            }
            Encoding::Binary => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
            Encoding::Windows1252 => {
                if bytes.is_ascii() {
                    return String::from_utf8_lossy(bytes);
                }
                Cow::Owned(
                    bytes
                        .iter()
                        .map(|&b| match b {
                            0x80..=0x9F => CP1252_HIGH[usize::from(b - 0x80)],
                            _ => char::from(b),
                        })
                        .collect(),
                )
            }
            Encoding::Utf16Be | Encoding::Utf16Le => {
                let units = bytes.chunks(2).map(|pair| match (self, pair) {
                    (Encoding::Utf16Be, [hi, lo]) => u16::from_be_bytes([*hi, *lo]),
                    (_, [lo, hi]) => u16::from_le_bytes([*lo, *hi]),
                    _ => 0xFFFD,
                });
                Cow::Owned(
                    char::decode_utf16(units)
                        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                        .collect(),
                )
            }
            Encoding::Utf32Be => Cow::Owned(
                bytes
                    .chunks(4)
                    .map(|quad| match quad {
                        [a, b, c, d] => char::from_u32(u32::from_be_bytes([*a, *b, *c, *d]))
                            .unwrap_or(char::REPLACEMENT_CHARACTER),
                        _ => char::REPLACEMENT_CHARACTER,
                    })
                    .collect(),
            ),
        }
    }

    /// Encode a string; unmappable characters become `?`.
    pub fn encode<'a>(self, s: &'a str) -> Cow<'a, [u8]> {
        match self {
            Encoding::Utf8 => Cow::Borrowed(s.as_bytes()),
            _ if s.is_ascii() && !self.is_wide() => Cow::Borrowed(s.as_bytes()),
            Encoding::Ascii => Cow::Owned(
                s.chars()
                    .map(|c| u8::try_from(c).ok().filter(u8::is_ascii).unwrap_or(b'?'))
                    .collect(),
            ),
            Encoding::Binary => Cow::Owned(
                s.chars()
                    .map(|c| u8::try_from(c).unwrap_or(b'?'))
                    .collect(),
            ),
            Encoding::Windows1252 => Cow::Owned(
                s.chars()
                    .map(|c| {
                        if let Some(pos) = CP1252_HIGH.iter().position(|&h| h == c) {
                            // Position is < 32, so it fits.
                            0x80 + u8::try_from(pos).unwrap_or(0x1F)
                        } else {
                            u8::try_from(c).unwrap_or(b'?')
                        }
                    })
                    .collect(),
            ),
            Encoding::Utf16Be => Cow::Owned(s.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            Encoding::Utf16Le => Cow::Owned(s.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            Encoding::Utf32Be => Cow::Owned(
                s.chars()
                    .flat_map(|c| u32::from(c).to_be_bytes())
                    .collect(),
            ),
        }
    }

    fn is_wide(self) -> bool {
        matches!(
            self,
            Encoding::Utf16Be | Encoding::Utf16Le | Encoding::Utf32Be
        )
    }
}

/// A MySQL character set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharSetInfo {
    /// MySQL charset name
    pub name: &'static str,
    /// Name of the byte encoding
    pub encoding_name: &'static str,
    /// Maximum bytes per character
    pub max_len: u8,
}

impl CharSetInfo {
    /// The encoding for this charset, falling back to UTF-8 when the
    /// encoding is not supported.
    pub fn encoding(&self) -> Encoding {
        Encoding::for_name(self.encoding_name).unwrap_or_else(|| {
            tracing::trace!(
                charset = self.name,
                encoding = self.encoding_name,
                "unsupported encoding, using utf-8"
            );
            Encoding::Utf8
        })
    }
}

const fn cs(name: &'static str, encoding_name: &'static str, max_len: u8) -> CharSetInfo {
    CharSetInfo {
        name,
        encoding_name,
        max_len,
    }
}

/// Every charset the registry knows, keyed by MySQL name.
pub static CHARSETS: &[CharSetInfo] = &[
    cs("big5", "big5", 2),
    cs("dec8", "dec8", 1),
    cs("cp850", "ibm850", 1),
    cs("hp8", "hp8", 1),
    cs("koi8r", "koi8-r", 1),
    cs("latin1", "windows-1252", 1),
    cs("latin2", "latin2", 1),
    cs("swe7", "swe7", 1),
    cs("ascii", "us-ascii", 1),
    cs("ujis", "euc-jp", 3),
    cs("sjis", "shift-jis", 2),
    cs("hebrew", "iso-8859-8", 1),
    cs("tis620", "windows-874", 1),
    cs("euckr", "euc-kr", 2),
    cs("koi8u", "koi8-u", 1),
    cs("gb2312", "gb2312", 2),
    cs("greek", "iso-8859-7", 1),
    cs("cp1250", "windows-1250", 1),
    cs("gbk", "gbk", 2),
    cs("latin5", "iso-8859-9", 1),
    cs("armscii8", "armscii8", 1),
    cs("utf8", "utf-8", 3),
    cs("utf8mb3", "utf-8", 3),
    cs("ucs2", "utf-16be", 2),
    cs("cp866", "cp866", 1),
    cs("keybcs2", "keybcs2", 1),
    cs("macce", "x-mac-ce", 1),
    cs("macroman", "x-mac-romanian", 1),
    cs("cp852", "ibm852", 2),
    cs("latin7", "iso-8859-7", 1),
    cs("utf8mb4", "utf-8", 4),
    cs("cp1251", "windows-1251", 1),
    cs("utf16", "utf-16be", 4),
    cs("utf16le", "utf-16le", 4),
    cs("cp1256", "windows-1256", 1),
    cs("cp1257", "windows-1257", 1),
    cs("utf32", "utf-32be", 4),
    cs("binary", "binary", 1),
    cs("geostd8", "geostd8", 1),
    cs("cp932", "cp932", 2),
    cs("eucjpms", "euc-jp", 3),
    cs("gb18030", "gb18030", 4),
];

/// Alternative spellings accepted by [`lookup`].
static ALIASES: &[(&str, &str)] = &[
    ("utf-8", "utf8mb4"),
    ("cp1252", "latin1"),
    ("iso-8859-1", "latin1"),
    ("usa7", "ascii"),
    ("koi8_ru", "koi8r"),
    ("unicode", "ucs2"),
];

/// Look up a charset by name or alias (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static CharSetInfo> {
    let lower = name.to_ascii_lowercase();
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map_or(lower.as_str(), |(_, target)| target);
    CHARSETS.iter().find(|info| info.name == canonical)
}

/// Encoding for a charset name, falling back to UTF-8 for unknown names.
pub fn encoding_for_charset(name: &str) -> Encoding {
    lookup(name).map_or(Encoding::Utf8, CharSetInfo::encoding)
}

/// Charset name for the built-in collation ids.
pub fn charset_for_collation(id: u16) -> Option<&'static str> {
    let name = match id {
        1 | 84 => "big5",
        3 | 69 => "dec8",
        4 | 80 => "cp850",
        6 | 72 => "hp8",
        7 | 74 => "koi8r",
        5 | 8 | 15 | 31 | 47..=49 | 94 => "latin1",
        2 | 9 | 21 | 27 | 77 => "latin2",
        10 | 82 => "swe7",
        11 | 65 => "ascii",
        12 | 91 => "ujis",
        13 | 88 => "sjis",
        16 | 71 => "hebrew",
        18 | 89 => "tis620",
        19 | 85 => "euckr",
        22 | 75 => "koi8u",
        24 | 86 => "gb2312",
        25 | 70 => "greek",
        26 | 34 | 44 | 66 | 99 => "cp1250",
        28 | 87 => "gbk",
        30 | 78 => "latin5",
        32 | 64 => "armscii8",
        33 | 76 | 83 | 192..=215 | 223 => "utf8",
        35 | 90 | 128..=151 | 159 => "ucs2",
        36 | 68 => "cp866",
        37 | 73 => "keybcs2",
        38 | 43 => "macce",
        39 | 53 => "macroman",
        40 | 81 => "cp852",
        20 | 41 | 42 | 79 => "latin7",
        45 | 46 | 224..=247 | 255..=323 => "utf8mb4",
        14 | 23 | 50..=52 => "cp1251",
        54 | 55 | 101..=124 | 327 => "utf16",
        56 | 62 => "utf16le",
        57 | 67 => "cp1256",
        29 | 58 | 59 => "cp1257",
        60 | 61 | 160..=183 => "utf32",
        63 => "binary",
        92 | 93 => "geostd8",
        95 | 96 => "cp932",
        97 | 98 => "eucjpms",
        248..=250 => "gb18030",
        _ => return None,
    };
    Some(name)
}

/// Default collation id for a charset name, as sent in the handshake.
///
/// Only ids below 256 fit the handshake's one-byte charset field.
pub fn default_collation(name: &str) -> Option<u16> {
    let info = lookup(name)?;
    let id = match info.name {
        "utf8mb4" => collation::UTF8MB4_GENERAL_CI,
        "utf8" | "utf8mb3" => collation::UTF8_GENERAL_CI,
        "latin1" => collation::LATIN1_SWEDISH_CI,
        "binary" => collation::BINARY,
        other => (1..256).find(|&id| charset_for_collation(id) == Some(other))?,
    };
    Some(id)
}

/// Per-server charset facts, loaded at most once per pool.
///
/// Both maps are filled by check-then-populate under one lock; the loader
/// runs without the lock held, so two sessions may both load and the last
/// one wins. The queries are idempotent.
#[derive(Debug, Default)]
pub struct ServerCharsetCache {
    inner: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    collations: Option<HashMap<u16, String>>,
    max_lengths: Option<HashMap<String, u8>>,
}

impl ServerCharsetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charset name for a collation id, loading the server's collation
    /// table with `load` on first use.
    #[allow(clippy::result_large_err)]
    pub fn collation_charset<F>(&self, id: u16, load: F) -> Result<Option<String>>
    where
        F: FnOnce() -> Result<HashMap<u16, String>>,
    {
        if let Some(map) = &self.lock().collations {
            return Ok(map.get(&id).cloned());
        }
        let loaded = load()?;
        let found = loaded.get(&id).cloned();
        self.lock().collations = Some(loaded);
        Ok(found)
    }

    /// Max bytes per character for a charset, loading the server's charset
    /// table with `load` on first use.
    #[allow(clippy::result_large_err)]
    pub fn max_length<F>(&self, charset: &str, load: F) -> Result<Option<u8>>
    where
        F: FnOnce() -> Result<HashMap<String, u8>>,
    {
        if let Some(map) = &self.lock().max_lengths {
            return Ok(map.get(charset).copied());
        }
        let loaded = load()?;
        let found = loaded.get(charset).copied();
        self.lock().max_lengths = Some(loaded);
        Ok(found)
    }

    /// Charset name for a collation id from an already loaded table.
    /// Never loads.
    pub fn cached_collation_charset(&self, id: u16) -> Option<String> {
        self.lock().collations.as_ref()?.get(&id).cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().collations.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
