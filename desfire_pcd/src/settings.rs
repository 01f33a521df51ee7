//! Application/file identifiers, access-rights encoding, and the
//! application- and file-level settings records exchanged with
//! `create_application`/`get_app_settings`/`create_file`/`get_file_settings`
//! (§3 "Data model", §3.1).

use crate::buffer::{BinData, ByteStream};
use crate::key::CipherType;
use nom::number::Endianness;

/// A Desfire application ID: a 24-bit namespace. Transmitted LSB-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Aid(pub u32);

/// The root application, selected by default on every card. Allows creating
/// sub-applications and, if its master key permits, changing PICC-wide
/// configuration.
pub const ROOT_AID: Aid = Aid(0);

impl Aid {
    pub fn new(value: u32) -> Aid {
        assert!(value <= 0x00FF_FFFF, "AID does not fit in 24 bits");
        Aid(value)
    }

    pub fn is_root(self) -> bool {
        self.0 == 0
    }

    pub fn push_wire(self, out: &mut BinData) {
        out.push_u24(self.0, Endianness::Little);
    }

    pub fn pull_wire(stream: &mut ByteStream) -> Aid {
        Aid(stream.pull_u24(Endianness::Little))
    }
}

/// A Desfire file ID: a single byte in a per-application namespace.
pub type FileId = u8;

/// One slot of an access-rights word or a key-change policy: either a
/// specific key number, or one of the two sentinel values the card
/// reserves at the top of the nibble range (§3 "Access-rights word",
/// §9 "Access-rights 'free' vs 'no-key'").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Key(u8),
    /// No key is authorized; the operation is permanently forbidden.
    NoKey,
    /// No authentication is required at all.
    Free,
}

const NO_KEY_NIBBLE: u8 = 0xE;
const FREE_NIBBLE: u8 = 0xF;

impl KeySlot {
    fn from_nibble(nibble: u8) -> KeySlot {
        match nibble {
            NO_KEY_NIBBLE => KeySlot::NoKey,
            FREE_NIBBLE => KeySlot::Free,
            key_no => KeySlot::Key(key_no),
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            KeySlot::Key(key_no) => key_no & 0x0F,
            KeySlot::NoKey => NO_KEY_NIBBLE,
            KeySlot::Free => FREE_NIBBLE,
        }
    }

    pub fn is_free(self) -> bool {
        matches!(self, KeySlot::Free)
    }
}

/// Which file operation an access check is for (§4.6 "trust-card"
/// auto-detection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Change,
    Read,
    Write,
}

/// The four independent access-rights slots of a file (§3 "Access-rights
/// word"). Wire layout follows the card vendor's documented bit
/// assignment: bits 0-3 read, 4-7 write, 8-11 read/write, 12-15 change
/// (least-significant byte transmitted first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRights {
    pub change: KeySlot,
    pub read_write: KeySlot,
    pub read: KeySlot,
    pub write: KeySlot,
}

impl AccessRights {
    /// Only the master key holds any right.
    pub fn master_key_only() -> AccessRights {
        AccessRights {
            change: KeySlot::Key(0),
            read_write: KeySlot::Key(0),
            read: KeySlot::Key(0),
            write: KeySlot::Key(0),
        }
    }

    pub fn free() -> AccessRights {
        AccessRights {
            change: KeySlot::Free,
            read_write: KeySlot::Free,
            read: KeySlot::Free,
            write: KeySlot::Free,
        }
    }

    pub fn single_key(key_no: u8) -> AccessRights {
        AccessRights {
            change: KeySlot::Key(key_no),
            read_write: KeySlot::Key(key_no),
            read: KeySlot::Key(key_no),
            write: KeySlot::Key(key_no),
        }
    }

    pub fn from_word(word: u16) -> AccessRights {
        AccessRights {
            read: KeySlot::from_nibble((word & 0x000F) as u8),
            write: KeySlot::from_nibble(((word >> 4) & 0x000F) as u8),
            read_write: KeySlot::from_nibble(((word >> 8) & 0x000F) as u8),
            change: KeySlot::from_nibble(((word >> 12) & 0x000F) as u8),
        }
    }

    pub fn to_word(self) -> u16 {
        (self.read.to_nibble() as u16)
            | ((self.write.to_nibble() as u16) << 4)
            | ((self.read_write.to_nibble() as u16) << 8)
            | ((self.change.to_nibble() as u16) << 12)
    }

    pub fn push_wire(self, out: &mut BinData) {
        out.push_u16(self.to_word(), Endianness::Little);
    }

    pub fn pull_wire(stream: &mut ByteStream) -> AccessRights {
        AccessRights::from_word(stream.pull_u16(Endianness::Little))
    }

    /// True if `access` degrades to [`KeySlot::Free`] (§9: "free on change
    /// degrades security to plain; on read/write, it degrades only the
    /// plain case"). `read_write` grants `Read`/`Write` with an "or", so
    /// either slot being free is enough.
    pub fn is_free(self, access: FileAccess) -> bool {
        match access {
            FileAccess::Change => self.change.is_free(),
            FileAccess::Read => self.read.is_free() || self.read_write.is_free(),
            FileAccess::Write => self.write.is_free() || self.read_write.is_free(),
        }
    }
}

/// Who is allowed to change which key (§3 "App settings"), plus the flags
/// that govern app/PICC-level directory listing, creation, and
/// configuration changes (`key_settings` byte of `create_application`/
/// `change_key_settings`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChangePolicy {
    /// Changing any key requires authenticating with that same key
    /// (the default).
    SameKey,
    /// No key may ever be changed again.
    Frozen,
    /// Changing any key requires authenticating with this key number.
    Key(u8),
}

impl KeyChangePolicy {
    fn from_nibble(nibble: u8) -> KeyChangePolicy {
        match nibble {
            NO_KEY_NIBBLE => KeyChangePolicy::SameKey,
            FREE_NIBBLE => KeyChangePolicy::Frozen,
            key_no => KeyChangePolicy::Key(key_no),
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            KeyChangePolicy::Key(key_no) => key_no & 0x0F,
            KeyChangePolicy::SameKey => NO_KEY_NIBBLE,
            KeyChangePolicy::Frozen => FREE_NIBBLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRights {
    pub allowed_to_change_keys: KeyChangePolicy,
    pub master_key_changeable: bool,
    pub dir_access_without_auth: bool,
    pub create_delete_without_master_key: bool,
    pub config_changeable: bool,
}

impl Default for KeyRights {
    fn default() -> Self {
        KeyRights {
            allowed_to_change_keys: KeyChangePolicy::SameKey,
            master_key_changeable: true,
            dir_access_without_auth: true,
            create_delete_without_master_key: false,
            config_changeable: true,
        }
    }
}

impl KeyRights {
    pub fn from_byte(byte: u8) -> KeyRights {
        KeyRights {
            allowed_to_change_keys: KeyChangePolicy::from_nibble(byte >> 4),
            master_key_changeable: byte & 0x01 != 0,
            dir_access_without_auth: byte & 0x02 != 0,
            create_delete_without_master_key: byte & 0x04 != 0,
            config_changeable: byte & 0x08 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut low = 0u8;
        if self.master_key_changeable {
            low |= 0x01;
        }
        if self.dir_access_without_auth {
            low |= 0x02;
        }
        if self.create_delete_without_master_key {
            low |= 0x04;
        }
        if self.config_changeable {
            low |= 0x08;
        }
        (self.allowed_to_change_keys.to_nibble() << 4) | low
    }
}

/// Settings of an application, as given to `create_application` and
/// returned by `get_app_settings` (§3 "App settings"). The wire form is
/// two bytes: the key-rights byte, and a byte combining `max_num_keys`
/// with the cipher-selector bits ([`CipherType::change_key_cipher_bit`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppSettings {
    pub rights: KeyRights,
    pub max_num_keys: u8,
    pub cipher: CipherType,
}

impl AppSettings {
    pub fn new(cipher: CipherType) -> AppSettings {
        AppSettings {
            rights: KeyRights::default(),
            max_num_keys: crate::key::MAX_KEY_NUMBER + 1,
            cipher,
        }
    }

    pub fn push_wire(&self, out: &mut BinData) {
        out.push_u8(self.rights.to_byte());
        out.push_u8((self.max_num_keys & 0x0F) | self.cipher.change_key_cipher_bit());
    }

    pub fn pull_wire(stream: &mut ByteStream) -> AppSettings {
        let rights = KeyRights::from_byte(stream.pull_u8());
        let second = stream.pull_u8();
        let cipher = match second & 0xC0 {
            0x80 => CipherType::Aes128,
            0x40 => CipherType::ThreeKeyTripleDes,
            _ => CipherType::TwoKeyTripleDes,
        };
        AppSettings {
            rights,
            max_num_keys: second & 0x0F,
            cipher,
        }
    }
}

/// Security applied to a file's content or value (§3 "File settings").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSecurity {
    None,
    Maced,
    Encrypted,
}

impl FileSecurity {
    fn from_byte(byte: u8) -> FileSecurity {
        match byte {
            1 => FileSecurity::Maced,
            2 => FileSecurity::Encrypted,
            _ => FileSecurity::None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            FileSecurity::None => 0,
            FileSecurity::Maced => 1,
            FileSecurity::Encrypted => 2,
        }
    }
}

/// Fields shared by every file type: security mode and access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonFileSettings {
    pub security: FileSecurity,
    pub rights: AccessRights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileSettings {
    /// File size in bytes (a 24-bit quantity on the wire).
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueFileSettings {
    pub lower_limit: i32,
    pub upper_limit: i32,
    pub value: i32,
    pub limited_credit_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFileSettings {
    /// Size in bytes of a single record (a 24-bit quantity on the wire).
    pub record_size: u32,
    /// Maximum number of records the file can hold (24-bit on the wire).
    pub max_record_count: u32,
    /// Current number of records; unused for file creation.
    pub record_count: u32,
}

/// A file's complete settings, tagged by [`FileType`] (§9 "closed-set
/// variant for frames and keys": prefer a tagged enum over a class
/// hierarchy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSettings {
    Standard { common: CommonFileSettings, data: DataFileSettings },
    Backup { common: CommonFileSettings, data: DataFileSettings },
    Value { common: CommonFileSettings, value: ValueFileSettings },
    LinearRecord { common: CommonFileSettings, record: RecordFileSettings },
    CyclicRecord { common: CommonFileSettings, record: RecordFileSettings },
}

/// The file-type byte prefixing a `get_file_settings` response and a
/// `create_file` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Standard,
    Backup,
    Value,
    LinearRecord,
    CyclicRecord,
}

impl FileType {
    pub fn wire_byte(self) -> u8 {
        match self {
            FileType::Standard => 0x00,
            FileType::Backup => 0x01,
            FileType::Value => 0x02,
            FileType::LinearRecord => 0x03,
            FileType::CyclicRecord => 0x04,
        }
    }

    pub fn from_wire_byte(byte: u8) -> Option<FileType> {
        match byte {
            0x00 => Some(FileType::Standard),
            0x01 => Some(FileType::Backup),
            0x02 => Some(FileType::Value),
            0x03 => Some(FileType::LinearRecord),
            0x04 => Some(FileType::CyclicRecord),
            _ => None,
        }
    }
}

impl FileSettings {
    pub fn file_type(&self) -> FileType {
        match self {
            FileSettings::Standard { .. } => FileType::Standard,
            FileSettings::Backup { .. } => FileType::Backup,
            FileSettings::Value { .. } => FileType::Value,
            FileSettings::LinearRecord { .. } => FileType::LinearRecord,
            FileSettings::CyclicRecord { .. } => FileType::CyclicRecord,
        }
    }

    pub fn common(&self) -> &CommonFileSettings {
        match self {
            FileSettings::Standard { common, .. }
            | FileSettings::Backup { common, .. }
            | FileSettings::Value { common, .. }
            | FileSettings::LinearRecord { common, .. }
            | FileSettings::CyclicRecord { common, .. } => common,
        }
    }

    /// Wire body for `create_file`: file type, security+rights, then the
    /// type-specific tail. (`get_file_settings` responses carry the same
    /// layout minus the leading file type, which is read separately.)
    pub fn push_wire(&self, out: &mut BinData) {
        out.push_u8(self.file_type().wire_byte());
        self.push_wire_body(out);
    }

    pub fn push_wire_body(&self, out: &mut BinData) {
        let common = self.common();
        out.push_u8(common.security.to_byte());
        common.rights.push_wire(out);
        match self {
            FileSettings::Standard { data, .. } | FileSettings::Backup { data, .. } => {
                out.push_u24(data.size, Endianness::Little);
            }
            FileSettings::Value { value, .. } => {
                out.push_i32(value.lower_limit, Endianness::Little);
                out.push_i32(value.upper_limit, Endianness::Little);
                out.push_i32(value.value, Endianness::Little);
                out.push_bool(value.limited_credit_enabled);
            }
            FileSettings::LinearRecord { record, .. } | FileSettings::CyclicRecord { record, .. } => {
                out.push_u24(record.record_size, Endianness::Little);
                out.push_u24(record.max_record_count, Endianness::Little);
                out.push_u24(record.record_count, Endianness::Little);
            }
        }
    }

    /// Parses a `get_file_settings` response body (file type byte followed
    /// by the common and type-specific fields).
    pub fn pull_wire(stream: &mut ByteStream) -> Option<FileSettings> {
        let file_type = FileType::from_wire_byte(stream.pull_u8())?;
        Self::pull_wire_body(file_type, stream)
    }

    pub fn pull_wire_body(file_type: FileType, stream: &mut ByteStream) -> Option<FileSettings> {
        let common = CommonFileSettings {
            security: FileSecurity::from_byte(stream.pull_u8()),
            rights: AccessRights::pull_wire(stream),
        };
        Some(match file_type {
            FileType::Standard => FileSettings::Standard {
                common,
                data: DataFileSettings {
                    size: stream.pull_u24(Endianness::Little),
                },
            },
            FileType::Backup => FileSettings::Backup {
                common,
                data: DataFileSettings {
                    size: stream.pull_u24(Endianness::Little),
                },
            },
            FileType::Value => FileSettings::Value {
                common,
                value: ValueFileSettings {
                    lower_limit: stream.pull_i32(Endianness::Little),
                    upper_limit: stream.pull_i32(Endianness::Little),
                    value: stream.pull_i32(Endianness::Little),
                    limited_credit_enabled: stream.pull_bool(),
                },
            },
            FileType::LinearRecord => FileSettings::LinearRecord {
                common,
                record: RecordFileSettings {
                    record_size: stream.pull_u24(Endianness::Little),
                    max_record_count: stream.pull_u24(Endianness::Little),
                    record_count: stream.pull_u24(Endianness::Little),
                },
            },
            FileType::CyclicRecord => FileSettings::CyclicRecord {
                common,
                record: RecordFileSettings {
                    record_size: stream.pull_u24(Endianness::Little),
                    max_record_count: stream.pull_u24(Endianness::Little),
                    record_count: stream.pull_u24(Endianness::Little),
                },
            },
        })
    }
}

/// An approximate storage size as reported by `get_info`: just an
/// exponent and a bit saying whether the number is exact or only a range
/// (§3.1 "Version info"). Bit 0 of the wire byte is the approximation
/// flag; bits 1-7 are the exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSize(u8);

impl StorageSize {
    pub fn from_wire_byte(byte: u8) -> StorageSize {
        StorageSize(byte)
    }

    pub fn wire_byte(self) -> u8 {
        self.0
    }

    fn exponent(self) -> u32 {
        (self.0 >> 1) as u32
    }

    fn is_approximate(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn bytes_lower_bound(self) -> usize {
        1usize << self.exponent()
    }

    pub fn bytes_upper_bound(self) -> usize {
        if self.is_approximate() {
            1usize << (self.exponent() + 1)
        } else {
            self.bytes_lower_bound()
        }
    }
}

/// Hardware or software sub-record of [`VersionInfo`] (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WareInfo {
    pub vendor_id: u8,
    pub hardware_type: u8,
    pub subtype: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub storage_size: StorageSize,
    pub comm_protocol_type: u8,
}

impl WareInfo {
    pub fn pull_wire(stream: &mut ByteStream) -> WareInfo {
        WareInfo {
            vendor_id: stream.pull_u8(),
            hardware_type: stream.pull_u8(),
            subtype: stream.pull_u8(),
            version_major: stream.pull_u8(),
            version_minor: stream.pull_u8(),
            storage_size: StorageSize::from_wire_byte(stream.pull_u8()),
            comm_protocol_type: stream.pull_u8(),
        }
    }
}

/// Card hardware/software/production information, assembled from the
/// three `additional-frame` chunks of a `get_version` response (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub hardware: WareInfo,
    pub software: WareInfo,
    pub serial_no: [u8; 7],
    pub batch_no: [u8; 5],
    pub production_week: u8,
    pub production_year: u8,
}

impl VersionInfo {
    /// Parses the already-concatenated three-chunk response body: 7 bytes
    /// of hardware info, 7 of software info, then the 14-byte production
    /// record (serial, batch, week, year).
    pub fn pull_wire(stream: &mut ByteStream) -> VersionInfo {
        let hardware = WareInfo::pull_wire(stream);
        let software = WareInfo::pull_wire(stream);
        let mut serial_no = [0u8; 7];
        for b in serial_no.iter_mut() {
            *b = stream.pull_u8();
        }
        let mut batch_no = [0u8; 5];
        for b in batch_no.iter_mut() {
            *b = stream.pull_u8();
        }
        let production_week = stream.pull_u8();
        let production_year = stream.pull_u8();
        VersionInfo {
            hardware,
            software,
            serial_no,
            batch_no,
            production_week,
            production_year,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_rights_word_round_trips() {
        let rights = AccessRights {
            change: KeySlot::Key(0),
            read_write: KeySlot::Free,
            read: KeySlot::NoKey,
            write: KeySlot::Key(3),
        };
        let word = rights.to_word();
        assert_eq!(AccessRights::from_word(word), rights);
    }

    #[test]
    fn free_access_degrades_read_via_read_write() {
        let rights = AccessRights {
            change: KeySlot::Key(0),
            read_write: KeySlot::Free,
            read: KeySlot::Key(2),
            write: KeySlot::Key(2),
        };
        assert!(rights.is_free(FileAccess::Read));
        assert!(rights.is_free(FileAccess::Write));
        assert!(!rights.is_free(FileAccess::Change));
    }

    #[test]
    fn key_rights_byte_round_trips() {
        let rights = KeyRights {
            allowed_to_change_keys: KeyChangePolicy::Key(4),
            master_key_changeable: false,
            dir_access_without_auth: true,
            create_delete_without_master_key: true,
            config_changeable: false,
        };
        assert_eq!(KeyRights::from_byte(rights.to_byte()), rights);
    }

    #[test]
    fn app_settings_round_trips_cipher_selector() {
        let mut buf = BinData::new();
        let settings = AppSettings::new(CipherType::Aes128);
        settings.push_wire(&mut buf);
        let mut stream = ByteStream::new(buf.as_slice());
        let parsed = AppSettings::pull_wire(&mut stream);
        assert_eq!(parsed.cipher, CipherType::Aes128);
        assert_eq!(parsed.max_num_keys, settings.max_num_keys);
    }

    #[test]
    fn value_file_settings_round_trip() {
        let settings = FileSettings::Value {
            common: CommonFileSettings {
                security: FileSecurity::Encrypted,
                rights: AccessRights::master_key_only(),
            },
            value: ValueFileSettings {
                lower_limit: -10,
                upper_limit: 10,
                value: 0,
                limited_credit_enabled: false,
            },
        };
        let mut buf = BinData::new();
        settings.push_wire(&mut buf);
        let mut stream = ByteStream::new(buf.as_slice());
        let parsed = FileSettings::pull_wire(&mut stream).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn storage_size_approximate_range() {
        let size = StorageSize::from_wire_byte((10 << 1) | 1);
        assert_eq!(size.bytes_lower_bound(), 1 << 10);
        assert_eq!(size.bytes_upper_bound(), 1 << 11);
    }

    #[test]
    fn storage_size_exact() {
        let size = StorageSize::from_wire_byte(8 << 1);
        assert_eq!(size.bytes_lower_bound(), size.bytes_upper_bound());
    }
}
