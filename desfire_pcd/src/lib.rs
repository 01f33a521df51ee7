mod buffer;
mod card;
mod channel;
mod cipher;
mod error;
mod frame;
mod key;
mod reader;
mod session;
mod settings;
mod transport;

pub use self::{
    card::Tag,
    channel::Channel,
    error::{status, Error},
    key::{CipherType, Key, RandomOracle},
    reader::{
        DiagnoseResult, DiagnoseTest, FirmwareVersion, GeneralStatus, GpioStatus, GpioWrite,
        JumpDepPsl, PollModulation, Reader, RegisterWrite, RfStatus, SamMode, TargetModeStatus,
        TargetRecord, TargetStatus, WakeSource, POST_BAUD_CHANGE_DELAY,
    },
    session::{Session, TransmissionMode},
    settings::{
        AccessRights, Aid, AppSettings, CommonFileSettings, DataFileSettings, FileAccess, FileId,
        FileSecurity, FileSettings, FileType, KeyChangePolicy, KeyRights, KeySlot,
        RecordFileSettings, StorageSize, ValueFileSettings, VersionInfo, WareInfo, ROOT_AID,
    },
    transport::{Deadline, Transport},
};

pub use self::buffer::{BinData, ByteStream};
