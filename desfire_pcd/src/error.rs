//! The non-overlapping error taxonomy shared by every layer of this crate:
//! reader framing, the reader channel, and the card command surface.
//!
//! Mirrors the host ecosystem's convention of a hand-rolled `Error` type
//! placed behind `anyhow::Result` rather than a derive-macro error crate:
//! call sites that need to distinguish a variant use
//! `anyhow::Error::downcast_ref::<Error>()`.

use std::fmt;

/// Card status byte values, straight off the wire (`status ‖ body`).
pub mod status {
    pub const OK: u8 = 0x00;
    pub const NO_CHANGES: u8 = 0x0C;
    pub const OUT_OF_EEPROM: u8 = 0x0E;
    pub const ILLEGAL_COMMAND: u8 = 0x1C;
    pub const INTEGRITY_ERROR: u8 = 0x1E;
    pub const NO_SUCH_KEY: u8 = 0x40;
    pub const LENGTH_ERROR: u8 = 0x7E;
    pub const PERMISSION_DENIED: u8 = 0x9D;
    pub const PARAMETER_ERROR: u8 = 0x9E;
    pub const APP_NOT_FOUND: u8 = 0xA0;
    pub const APP_INTEGRITY: u8 = 0xA1;
    pub const AUTH_ERROR: u8 = 0xAE;
    pub const ADDITIONAL_FRAME: u8 = 0xAF;
    pub const BOUNDARY: u8 = 0xBE;
    pub const PICC_INTEGRITY: u8 = 0xC1;
    pub const COMMAND_ABORTED: u8 = 0xCA;
    pub const PICC_DISABLED: u8 = 0xCD;
    pub const COUNT: u8 = 0xCE;
    pub const DUPLICATE: u8 = 0xDE;
    pub const EEPROM: u8 = 0xEE;
    pub const FILE_NOT_FOUND: u8 = 0xF0;
    pub const FILE_INTEGRITY: u8 = 0xF1;
}

/// Non-overlapping taxonomy of everything that can go wrong talking to the
/// reader or the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Deadline expired before any/expected bytes arrived.
    CommTimeout,
    /// Framing/length/checksum failed, or a response body parsed into an
    /// unexpected layout (trailing bytes left over).
    CommMalformed,
    /// The transport reported a fault of its own.
    CommError,
    /// Host sent an ACK to abort a running command after a deadline expired
    /// mid-response.
    Canceled,
    /// The reader refused the command outright (NACK).
    Nack,
    /// The reader returned its own application error frame (`01 7F`).
    Failure,
    /// A MAC/CRC integrity check failed, or decrypted padding was invalid.
    CryptoError,
    /// Card status `AE`: authentication failed or is required.
    AuthenticationError,
    /// Card status `9D`: access right does not permit the operation.
    PermissionDenied,
    /// Card status `9E`: malformed command parameters.
    ParameterError,
    /// Card status `40`: referenced key number does not exist.
    NoSuchKey,
    /// Card status `A0`: no application with that AID.
    AppNotFound,
    /// Card status `F0`: no file with that ID in the active application.
    FileNotFound,
    /// Card status `1E`: PICC-level integrity error on a command.
    IntegrityError,
    /// Card status `BE`: offset/length out of bounds for the file/value.
    BoundaryError,
    /// Card status `DE`: attempt to create something that already exists.
    DuplicateError,
    /// Card status `CE`: maximum number of applications/files/keys reached.
    CountError,
    /// Card status `0E`: EEPROM has insufficient free memory.
    OutOfEeprom,
    /// Card status `EE`: generic EEPROM error.
    EepromError,
    /// Card status `1C`: command code not recognised in this state.
    IllegalCommand,
    /// Card status `7E`: command length wrong for its parameters.
    LengthError,
    /// Card status `C1`: PICC integrity error (card storage corrupted).
    PiccIntegrityError,
    /// Card status `A1`: application integrity error.
    AppIntegrityError,
    /// Card status `F1`: file integrity error.
    FileIntegrityError,
    /// Card status `CA`: a previous command was aborted and must be retried.
    CommandAborted,
    /// Card status `CD`: PICC has been disabled (`format_picc` required).
    PiccDisabledError,
}

impl Error {
    /// Maps a card status byte to its `Error` variant. `status::OK` and
    /// `status::NO_CHANGES` are not errors and are not representable here;
    /// callers must check for them before calling this.
    pub fn from_status_byte(byte: u8) -> Error {
        use status::*;
        match byte {
            OUT_OF_EEPROM => Error::OutOfEeprom,
            ILLEGAL_COMMAND => Error::IllegalCommand,
            INTEGRITY_ERROR => Error::IntegrityError,
            NO_SUCH_KEY => Error::NoSuchKey,
            LENGTH_ERROR => Error::LengthError,
            PERMISSION_DENIED => Error::PermissionDenied,
            PARAMETER_ERROR => Error::ParameterError,
            APP_NOT_FOUND => Error::AppNotFound,
            APP_INTEGRITY => Error::AppIntegrityError,
            AUTH_ERROR => Error::AuthenticationError,
            BOUNDARY => Error::BoundaryError,
            PICC_INTEGRITY => Error::PiccIntegrityError,
            COMMAND_ABORTED => Error::CommandAborted,
            PICC_DISABLED => Error::PiccDisabledError,
            COUNT => Error::CountError,
            DUPLICATE => Error::DuplicateError,
            EEPROM => Error::EepromError,
            FILE_NOT_FOUND => Error::FileNotFound,
            FILE_INTEGRITY => Error::FileIntegrityError,
            // Anything else (including a stray `AF` reaching here, which
            // means the chunking discipline in the channel was violated)
            // is reported as malformed rather than silently accepted.
            _ => Error::CommMalformed,
        }
    }

    /// True for the two status bytes that mean "the command succeeded".
    pub fn is_success_status(byte: u8) -> bool {
        byte == status::OK || byte == status::NO_CHANGES
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Error::CommTimeout => "timed out waiting for the reader",
            Error::CommMalformed => "malformed frame or response body",
            Error::CommError => "transport reported an error",
            Error::Canceled => "command canceled after a deadline expired",
            Error::Nack => "reader refused the command (NACK)",
            Error::Failure => "reader reported an application error",
            Error::CryptoError => "MAC/CRC integrity check failed",
            Error::AuthenticationError => "authentication failed or is required",
            Error::PermissionDenied => "access right does not permit this operation",
            Error::ParameterError => "invalid command parameters",
            Error::NoSuchKey => "no such key number",
            Error::AppNotFound => "no application with that AID",
            Error::FileNotFound => "no file with that ID",
            Error::IntegrityError => "PICC-level integrity error",
            Error::BoundaryError => "offset/length out of bounds",
            Error::DuplicateError => "already exists",
            Error::CountError => "maximum count reached",
            Error::OutOfEeprom => "insufficient EEPROM free space",
            Error::EepromError => "EEPROM error",
            Error::IllegalCommand => "command not valid in this state",
            Error::LengthError => "wrong command length",
            Error::PiccIntegrityError => "PICC integrity error",
            Error::AppIntegrityError => "application integrity error",
            Error::FileIntegrityError => "file integrity error",
            Error::CommandAborted => "a previous command was aborted",
            Error::PiccDisabledError => "PICC is disabled",
        };
        f.write_str(message)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_listed_status_byte() {
        let pairs = [
            (status::OUT_OF_EEPROM, Error::OutOfEeprom),
            (status::ILLEGAL_COMMAND, Error::IllegalCommand),
            (status::INTEGRITY_ERROR, Error::IntegrityError),
            (status::NO_SUCH_KEY, Error::NoSuchKey),
            (status::LENGTH_ERROR, Error::LengthError),
            (status::PERMISSION_DENIED, Error::PermissionDenied),
            (status::PARAMETER_ERROR, Error::ParameterError),
            (status::APP_NOT_FOUND, Error::AppNotFound),
            (status::APP_INTEGRITY, Error::AppIntegrityError),
            (status::AUTH_ERROR, Error::AuthenticationError),
            (status::BOUNDARY, Error::BoundaryError),
            (status::PICC_INTEGRITY, Error::PiccIntegrityError),
            (status::COMMAND_ABORTED, Error::CommandAborted),
            (status::PICC_DISABLED, Error::PiccDisabledError),
            (status::COUNT, Error::CountError),
            (status::DUPLICATE, Error::DuplicateError),
            (status::EEPROM, Error::EepromError),
            (status::FILE_NOT_FOUND, Error::FileNotFound),
            (status::FILE_INTEGRITY, Error::FileIntegrityError),
        ];
        for (byte, expected) in pairs {
            assert_eq!(Error::from_status_byte(byte), expected);
        }
    }

    #[test]
    fn ok_and_no_changes_are_success() {
        assert!(Error::is_success_status(status::OK));
        assert!(Error::is_success_status(status::NO_CHANGES));
        assert!(!Error::is_success_status(status::AUTH_ERROR));
    }
}
