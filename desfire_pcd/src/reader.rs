//! Typed wrappers over [`Channel`] for the reader's own command set:
//! diagnostics, firmware/status queries, register/GPIO access, RF
//! configuration, target polling/selection, data exchange with a selected
//! target, and power control (§4.5, §4.9).

use crate::buffer::{BinData, ByteStream};
use crate::channel::Channel;
use crate::transport::{Deadline, Transport};
use crate::Error;
use nom::number::Endianness;
use std::time::Duration;

mod command {
    pub const DIAGNOSE: u8 = 0x00;
    pub const GET_FIRMWARE_VERSION: u8 = 0x02;
    pub const GET_GENERAL_STATUS: u8 = 0x04;
    pub const READ_REGISTER: u8 = 0x06;
    pub const WRITE_REGISTER: u8 = 0x08;
    pub const READ_GPIO: u8 = 0x0C;
    pub const WRITE_GPIO: u8 = 0x0E;
    pub const SET_SERIAL_BAUD_RATE: u8 = 0x10;
    pub const SAM_CONFIGURATION: u8 = 0x14;
    pub const POWER_DOWN: u8 = 0x16;
    pub const RF_CONFIGURATION: u8 = 0x32;
    pub const IN_JUMP_FOR_DEP: u8 = 0x56;
    pub const IN_JUMP_FOR_PSL: u8 = 0x46;
    pub const IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
    pub const IN_DATA_EXCHANGE: u8 = 0x40;
    pub const IN_COMMUNICATE_THRU: u8 = 0x42;
    pub const IN_DESELECT: u8 = 0x44;
    pub const IN_RELEASE: u8 = 0x52;
    pub const IN_SELECT: u8 = 0x54;
    pub const IN_AUTO_POLL: u8 = 0x60;
    pub const TG_INIT_AS_TARGET: u8 = 0x8C;
    pub const TG_SET_GENERAL_BYTES: u8 = 0x92;
    pub const TG_GET_DATA: u8 = 0x86;
    pub const TG_SET_DATA: u8 = 0x8E;
    pub const TG_SET_METADATA: u8 = 0x94;
    pub const TG_GET_INITIATOR_COMMAND: u8 = 0x88;
    pub const TG_RESPONSE_TO_INITIATOR: u8 = 0x90;
    pub const TG_GET_TARGET_STATUS: u8 = 0x8A;
}

/// §4.5.1 — the reader's diagnostic test numbers, each with its own
/// request encoding.
#[derive(Debug, Clone)]
pub enum DiagnoseTest {
    CommunicationLine,
    RomTest,
    RamTest,
    PollingTest { count: u8 },
    EchoBackTest { delay: Duration, reply_delay: Duration },
    AttentionRequestOrCardDetection,
    SelfAntennaTest { threshold: u8 },
}

impl DiagnoseTest {
    fn number(&self) -> u8 {
        match self {
            DiagnoseTest::CommunicationLine => 0x00,
            DiagnoseTest::RomTest => 0x01,
            DiagnoseTest::RamTest => 0x02,
            DiagnoseTest::PollingTest { .. } => 0x04,
            DiagnoseTest::EchoBackTest { .. } => 0x05,
            DiagnoseTest::AttentionRequestOrCardDetection => 0x06,
            DiagnoseTest::SelfAntennaTest { .. } => 0x07,
        }
    }
}

/// Outcome of [`Reader::diagnose`]: a plain pass/fail for most tests, or
/// raw echoed bytes for the two tests that compare data instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnoseResult {
    Passed(bool),
    Echo(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub ic: u8,
    pub version: u8,
    pub revision: u8,
    pub support: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetStatus {
    pub logical_index: u8,
    pub baud_rate: u8,
    pub modulation_type: u8,
}

/// §2.1 — structured decode of `get_general_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralStatus {
    pub error: u8,
    pub field_present: bool,
    pub targets: Vec<TargetStatus>,
    pub sam_status: u8,
}

/// An address/value pair for the batched register read/write commands
/// (§2.1: "a single command can read/write several registers...in one
/// round trip").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub address: u16,
    pub value: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioWrite {
    pub p3: Option<u8>,
    pub p7: Option<u8>,
    pub i0i1: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioStatus {
    pub p3: u8,
    pub p7: u8,
    pub i0i1: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamMode {
    Normal,
    VirtualCard,
    WiredCard,
    DualCard,
}

impl SamMode {
    fn wire_byte(self) -> u8 {
        match self {
            SamMode::Normal => 0x01,
            SamMode::VirtualCard => 0x02,
            SamMode::WiredCard => 0x03,
            SamMode::DualCard => 0x04,
        }
    }
}

/// A source of wake-up from `power_down` (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    Inta0,
    Inta1,
    Rf,
    Rfu,
    Spi,
    Gpio,
    I2c,
    HsuOrUartInterrupt,
}

impl WakeSource {
    fn bit(self) -> u8 {
        match self {
            WakeSource::Inta0 => 0x01,
            WakeSource::Inta1 => 0x02,
            WakeSource::Rf => 0x08,
            WakeSource::Rfu => 0x10,
            WakeSource::Spi => 0x20,
            WakeSource::Gpio => 0x40,
            WakeSource::I2c => 0x80,
            WakeSource::HsuOrUartInterrupt => 0x80,
        }
    }
}

/// The status byte shared by all initiator-side commands; bit 6 (0x40) on
/// the *target* byte of a data-exchange round trip signals a continuation
/// chunk rather than appearing here, but the status byte itself is a
/// passthrough of the reader's own success/failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfStatus(pub u8);

impl RfStatus {
    pub fn is_success(self) -> bool {
        self.0 & 0x3F == 0x00
    }
}

/// Which baud rate/modulation combination to poll for (§4.5: "baud-rate-
/// specific target polling").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollModulation {
    Kbps106TypeA,
    Kbps106TypeB,
    Kbps106Jewel,
    Kbps212Felica,
    Kbps424Felica,
}

impl PollModulation {
    fn wire_byte(self) -> u8 {
        match self {
            PollModulation::Kbps106TypeA => 0x00,
            PollModulation::Kbps212Felica => 0x01,
            PollModulation::Kbps424Felica => 0x02,
            PollModulation::Kbps106TypeB => 0x03,
            PollModulation::Kbps106Jewel => 0x04,
        }
    }
}

/// One discovered target, shaped by which modulation produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRecord {
    TypeA {
        logical_index: u8,
        sens_res: u16,
        sel_res: u8,
        nfc_id: Vec<u8>,
        ats: Option<Vec<u8>>,
    },
    TypeB {
        logical_index: u8,
        atqb: Vec<u8>,
        attrib_res: Vec<u8>,
    },
    Felica {
        logical_index: u8,
        pol_res: Vec<u8>,
    },
    Jewel {
        logical_index: u8,
        sens_res: u16,
        jewel_id: [u8; 4],
    },
}

impl TargetRecord {
    pub fn logical_index(&self) -> u8 {
        match self {
            TargetRecord::TypeA { logical_index, .. }
            | TargetRecord::TypeB { logical_index, .. }
            | TargetRecord::Felica { logical_index, .. }
            | TargetRecord::Jewel { logical_index, .. } => *logical_index,
        }
    }
}

/// Outcome of a DEP/PSL activation attempt (§4.5 "initiator/target DEP/
/// PSL").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpDepPsl {
    pub status: RfStatus,
    pub logical_index: u8,
    pub target_data: Vec<u8>,
}

/// Status returned by `tg_get_target_status` describing how a target-mode
/// session is currently talking to its initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetModeStatus {
    pub state: u8,
    pub baud_rate: u8,
}

/// Typed wrapper over a [`Channel`] for the reader's own command set.
pub struct Reader<T: Transport> {
    channel: Channel<T>,
}

impl<T: Transport> Reader<T> {
    pub fn new(channel: Channel<T>) -> Reader<T> {
        Reader { channel }
    }

    pub fn channel_mut(&mut self) -> &mut Channel<T> {
        &mut self.channel
    }

    pub fn into_channel(self) -> Channel<T> {
        self.channel
    }

    fn run<F, R>(&mut self, cmd: u8, payload: &[u8], deadline: Deadline, parse: F) -> Result<R, Error>
    where
        F: FnOnce(&mut ByteStream) -> R,
    {
        self.channel.command_parse_response(cmd, payload, deadline, parse)
    }

    pub fn diagnose(&mut self, test: DiagnoseTest, deadline: Deadline) -> Result<DiagnoseResult, Error> {
        let mut payload = BinData::new();
        payload.push_u8(test.number());
        match &test {
            DiagnoseTest::PollingTest { count } => payload.push_u8(*count),
            DiagnoseTest::EchoBackTest { delay, reply_delay } => {
                payload.push_u8((delay.as_millis() / 10).min(255) as u8);
                payload.push_u8((reply_delay.as_millis() / 10).min(255) as u8);
                payload.push_bytes(b"echo");
            }
            DiagnoseTest::SelfAntennaTest { threshold } => payload.push_u8(*threshold),
            _ => {}
        }
        let is_echo = matches!(test, DiagnoseTest::PollingTest { .. } | DiagnoseTest::EchoBackTest { .. });
        self.run(command::DIAGNOSE, payload.as_slice(), deadline, move |s| {
            if is_echo {
                DiagnoseResult::Echo(s.rest().to_vec())
            } else {
                DiagnoseResult::Passed(s.pull_u8() == 0x00)
            }
        })
    }

    pub fn get_firmware_version(&mut self, deadline: Deadline) -> Result<FirmwareVersion, Error> {
        self.run(command::GET_FIRMWARE_VERSION, &[], deadline, |s| FirmwareVersion {
            ic: s.pull_u8(),
            version: s.pull_u8(),
            revision: s.pull_u8(),
            support: s.pull_u8(),
        })
    }

    pub fn get_general_status(&mut self, deadline: Deadline) -> Result<GeneralStatus, Error> {
        self.run(command::GET_GENERAL_STATUS, &[], deadline, |s| {
            let error = s.pull_u8();
            let field_present = s.pull_u8() != 0;
            let n = s.pull_u8();
            let mut targets = Vec::with_capacity(n as usize);
            for _ in 0..n {
                targets.push(TargetStatus {
                    logical_index: s.pull_u8(),
                    baud_rate: s.pull_u8(),
                    modulation_type: s.pull_u8(),
                });
            }
            let sam_status = s.pull_u8();
            GeneralStatus {
                error,
                field_present,
                targets,
                sam_status,
            }
        })
    }

    pub fn read_registers(&mut self, addresses: &[u16], deadline: Deadline) -> Result<Vec<u8>, Error> {
        let mut payload = BinData::new();
        for &addr in addresses {
            payload.push_u16(addr, Endianness::Big);
        }
        let count = addresses.len();
        self.run(command::READ_REGISTER, payload.as_slice(), deadline, move |s| {
            (0..count).map(|_| s.pull_u8()).collect()
        })
    }

    pub fn write_registers(&mut self, writes: &[RegisterWrite], deadline: Deadline) -> Result<(), Error> {
        let mut payload = BinData::new();
        for w in writes {
            payload.push_u16(w.address, Endianness::Big);
            payload.push_u8(w.value);
        }
        self.channel.command(command::WRITE_REGISTER, payload.as_slice(), deadline)?;
        Ok(())
    }

    pub fn read_gpio(&mut self, deadline: Deadline) -> Result<GpioStatus, Error> {
        self.run(command::READ_GPIO, &[], deadline, |s| GpioStatus {
            p3: s.pull_u8(),
            p7: s.pull_u8(),
            i0i1: s.pull_u8(),
        })
    }

    pub fn write_gpio(&mut self, write: GpioWrite, deadline: Deadline) -> Result<(), Error> {
        let mut payload = BinData::new();
        payload.push_u8(write.p3.map(|v| v | 0x80).unwrap_or(0));
        payload.push_u8(write.p7.map(|v| v | 0x80).unwrap_or(0));
        if let Some(i0i1) = write.i0i1 {
            payload.push_u8(i0i1);
        }
        self.channel.command(command::WRITE_GPIO, payload.as_slice(), deadline)?;
        Ok(())
    }

    /// §9 open question: the core never blocks on a wall-clock sleep. The
    /// caller is responsible for waiting at least the returned duration
    /// (and may then call [`Channel::wake`]) before issuing another
    /// command at the new rate.
    pub fn set_serial_baud_rate(&mut self, baud_code: u8, deadline: Deadline) -> Result<Duration, Error> {
        self.channel.command(command::SET_SERIAL_BAUD_RATE, &[baud_code], deadline)?;
        Ok(POST_BAUD_CHANGE_DELAY)
    }

    pub fn sam_configuration(
        &mut self,
        mode: SamMode,
        timeout_50ms_units: u8,
        use_irq_pin: bool,
        deadline: Deadline,
    ) -> Result<(), Error> {
        let payload = [mode.wire_byte(), timeout_50ms_units, use_irq_pin as u8];
        self.channel.command(command::SAM_CONFIGURATION, &payload, deadline)?;
        Ok(())
    }

    pub fn rf_field(&mut self, auto_rfca: bool, rf_on: bool, deadline: Deadline) -> Result<(), Error> {
        let mut flags = 0u8;
        if auto_rfca {
            flags |= 0x02;
        }
        if rf_on {
            flags |= 0x01;
        }
        let payload = [0x01u8, flags];
        self.channel.command(command::RF_CONFIGURATION, &payload, deadline)?;
        Ok(())
    }

    pub fn rf_timings(&mut self, rfu: u8, atr_res_timeout: u8, retry_timeout: u8, deadline: Deadline) -> Result<(), Error> {
        let payload = [0x02u8, rfu, atr_res_timeout, retry_timeout];
        self.channel.command(command::RF_CONFIGURATION, &payload, deadline)?;
        Ok(())
    }

    pub fn rf_retries(&mut self, atr: u8, psl: u8, passive_activation: u8, deadline: Deadline) -> Result<(), Error> {
        let payload = [0x05u8, atr, psl, passive_activation];
        self.channel.command(command::RF_CONFIGURATION, &payload, deadline)?;
        Ok(())
    }

    /// Raw per-modulation analog register block (§4.5: "analog settings
    /// per modulation"); `item` selects which of the reader's documented
    /// analog-configuration groups (type A 106k, FeliCa, type B, ISO/IEC
    /// 14443-4 212/424k) `registers` is written to.
    pub fn rf_configuration_analog(&mut self, item: u8, registers: &[u8], deadline: Deadline) -> Result<(), Error> {
        let mut payload = BinData::new();
        payload.push_u8(item);
        payload.push_bytes(registers);
        self.channel.command(command::RF_CONFIGURATION, payload.as_slice(), deadline)?;
        Ok(())
    }

    pub fn initiator_list_passive_target(
        &mut self,
        modulation: PollModulation,
        max_targets: u8,
        initiator_data: &[u8],
        deadline: Deadline,
    ) -> Result<Vec<TargetRecord>, Error> {
        let mut payload = BinData::new();
        payload.push_u8(max_targets);
        payload.push_u8(modulation.wire_byte());
        payload.push_bytes(initiator_data);
        match self.channel.command(command::IN_LIST_PASSIVE_TARGET, payload.as_slice(), deadline) {
            Ok(body) => {
                let mut stream = ByteStream::new(&body);
                let n = stream.pull_u8();
                let mut targets = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    targets.push(parse_target_record(modulation, &mut stream)?);
                }
                Ok(targets)
            }
            // Absence of a target is not an error (§4.5): a bare timeout
            // while polling simply means nothing answered.
            Err(Error::CommTimeout) => Ok(Vec::new()),
            Err(other) => Err(other),
        }
    }

    pub fn initiator_auto_poll(
        &mut self,
        poll_number: u8,
        period_150ms_units: u8,
        modulations: &[PollModulation],
        deadline: Deadline,
    ) -> Result<Vec<TargetRecord>, Error> {
        let mut payload = BinData::new();
        payload.push_u8(poll_number);
        payload.push_u8(period_150ms_units);
        for m in modulations {
            payload.push_u8(m.wire_byte());
        }
        match self.channel.command(command::IN_AUTO_POLL, payload.as_slice(), deadline) {
            Ok(body) => {
                let mut stream = ByteStream::new(&body);
                let n = stream.pull_u8();
                let mut out = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let ty = stream.pull_u8();
                    let _len = stream.pull_u8();
                    out.push(parse_target_record(modulation_from_auto_poll_type(ty), &mut stream)?);
                }
                Ok(out)
            }
            Err(Error::CommTimeout) => Ok(Vec::new()),
            Err(other) => Err(other),
        }
    }

    pub fn initiator_select(&mut self, logical_index: u8, deadline: Deadline) -> Result<RfStatus, Error> {
        self.run(command::IN_SELECT, &[logical_index], deadline, |s| RfStatus(s.pull_u8()))
    }

    pub fn initiator_deselect(&mut self, logical_index: u8, deadline: Deadline) -> Result<RfStatus, Error> {
        self.run(command::IN_DESELECT, &[logical_index], deadline, |s| RfStatus(s.pull_u8()))
    }

    pub fn initiator_release(&mut self, logical_index: u8, deadline: Deadline) -> Result<RfStatus, Error> {
        self.run(command::IN_RELEASE, &[logical_index], deadline, |s| RfStatus(s.pull_u8()))
    }

    /// Exchanges data with a selected target, chunking the outbound
    /// payload and reassembling the inbound one across the target byte's
    /// "more data" bit (§4.5: bit 6, `0x40`), distinct from the channel's
    /// own additional-frame chunking of a single round trip.
    pub fn initiator_data_exchange(
        &mut self,
        logical_index: u8,
        data: &[u8],
        deadline: Deadline,
    ) -> Result<(RfStatus, Vec<u8>), Error> {
        self.data_exchange_like(command::IN_DATA_EXCHANGE, logical_index, data, deadline)
    }

    pub fn initiator_communicate_through(&mut self, raw_data: &[u8], deadline: Deadline) -> Result<(RfStatus, Vec<u8>), Error> {
        let body = self.channel.command(command::IN_COMMUNICATE_THRU, raw_data, deadline)?;
        let mut stream = ByteStream::new(&body);
        let status = RfStatus(stream.pull_u8());
        Ok((status, stream.rest().to_vec()))
    }

    fn data_exchange_like(
        &mut self,
        cmd: u8,
        logical_index: u8,
        data: &[u8],
        deadline: Deadline,
    ) -> Result<(RfStatus, Vec<u8>), Error> {
        const MORE_DATA_BIT: u8 = 0x40;
        const CHUNK_CAP: usize = 260;

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(CHUNK_CAP).collect()
        };
        let last = chunks.len() - 1;
        let mut response = Vec::new();
        let mut status = RfStatus(0);
        for (i, chunk) in chunks.iter().enumerate() {
            let target_byte = if i == last { logical_index } else { logical_index | MORE_DATA_BIT };
            let mut payload = BinData::new();
            payload.push_u8(target_byte);
            payload.push_bytes(chunk);
            let body = self.channel.command(cmd, payload.as_slice(), deadline)?;
            let mut stream = ByteStream::new(&body);
            status = RfStatus(stream.pull_u8());
            response.extend_from_slice(stream.rest());
        }
        while status.0 & MORE_DATA_BIT != 0 {
            let mut payload = BinData::new();
            payload.push_u8(logical_index);
            let body = self.channel.command(cmd, payload.as_slice(), deadline)?;
            let mut stream = ByteStream::new(&body);
            status = RfStatus(stream.pull_u8());
            response.extend_from_slice(stream.rest());
        }
        Ok((status, response))
    }

    pub fn initiator_jump_for_dep(&mut self, target_data: &[u8], deadline: Deadline) -> Result<JumpDepPsl, Error> {
        self.run(command::IN_JUMP_FOR_DEP, target_data, deadline, |s| JumpDepPsl {
            status: RfStatus(s.pull_u8()),
            logical_index: s.pull_u8(),
            target_data: s.rest().to_vec(),
        })
    }

    pub fn initiator_jump_for_psl(&mut self, target_data: &[u8], deadline: Deadline) -> Result<JumpDepPsl, Error> {
        self.run(command::IN_JUMP_FOR_PSL, target_data, deadline, |s| JumpDepPsl {
            status: RfStatus(s.pull_u8()),
            logical_index: s.pull_u8(),
            target_data: s.rest().to_vec(),
        })
    }

    pub fn target_init_as_target(&mut self, config: &[u8], deadline: Deadline) -> Result<Vec<u8>, Error> {
        self.channel.command(command::TG_INIT_AS_TARGET, config, deadline)
    }

    pub fn target_set_general_bytes(&mut self, data: &[u8], deadline: Deadline) -> Result<RfStatus, Error> {
        self.run(command::TG_SET_GENERAL_BYTES, data, deadline, |s| RfStatus(s.pull_u8()))
    }

    pub fn target_get_data(&mut self, deadline: Deadline) -> Result<(RfStatus, Vec<u8>), Error> {
        let body = self.channel.command(command::TG_GET_DATA, &[], deadline)?;
        let mut stream = ByteStream::new(&body);
        let status = RfStatus(stream.pull_u8());
        Ok((status, stream.rest().to_vec()))
    }

    pub fn target_set_data(&mut self, data: &[u8], deadline: Deadline) -> Result<RfStatus, Error> {
        self.run(command::TG_SET_DATA, data, deadline, |s| RfStatus(s.pull_u8()))
    }

    pub fn target_set_metadata(&mut self, data: &[u8], deadline: Deadline) -> Result<RfStatus, Error> {
        self.run(command::TG_SET_METADATA, data, deadline, |s| RfStatus(s.pull_u8()))
    }

    pub fn target_get_initiator_command(&mut self, deadline: Deadline) -> Result<(RfStatus, Vec<u8>), Error> {
        let body = self.channel.command(command::TG_GET_INITIATOR_COMMAND, &[], deadline)?;
        let mut stream = ByteStream::new(&body);
        let status = RfStatus(stream.pull_u8());
        Ok((status, stream.rest().to_vec()))
    }

    pub fn target_response_to_initiator(&mut self, data: &[u8], deadline: Deadline) -> Result<RfStatus, Error> {
        self.run(command::TG_RESPONSE_TO_INITIATOR, data, deadline, |s| RfStatus(s.pull_u8()))
    }

    pub fn target_get_target_status(&mut self, deadline: Deadline) -> Result<TargetModeStatus, Error> {
        self.run(command::TG_GET_TARGET_STATUS, &[], deadline, |s| TargetModeStatus {
            state: s.pull_u8(),
            baud_rate: s.pull_u8(),
        })
    }

    pub fn power_down(&mut self, wake_sources: &[WakeSource], generate_irq: bool, deadline: Deadline) -> Result<RfStatus, Error> {
        let mut bits = 0u8;
        for &w in wake_sources {
            bits |= w.bit();
        }
        let payload = [bits, generate_irq as u8];
        self.run(command::POWER_DOWN, &payload, deadline, |s| RfStatus(s.pull_u8()))
    }
}

/// Maps `InAutoPoll`'s per-result type byte to the modulation whose record
/// layout `parse_target_record` should use. The type byte is a different
/// encoding from `InListPassiveTarget`'s baud/modulation byte (it also
/// distinguishes Mifare vs. plain ISO14443-4A, which this crate has no use
/// for beyond picking the record shape); these values are the well-known,
/// publicly documented `InAutoPoll` type codes for this chip.
fn modulation_from_auto_poll_type(ty: u8) -> PollModulation {
    match ty {
        0x20 => PollModulation::Kbps212Felica,
        0x21 => PollModulation::Kbps424Felica,
        0x30 | 0x40 => PollModulation::Kbps106TypeB,
        0x50 => PollModulation::Kbps106Jewel,
        _ => PollModulation::Kbps106TypeA,
    }
}

fn parse_target_record(modulation: PollModulation, stream: &mut ByteStream) -> Result<TargetRecord, Error> {
    let logical_index = stream.pull_u8();
    let record = match modulation {
        PollModulation::Kbps106TypeA => {
            let sens_res = stream.pull_u16(Endianness::Big);
            let sel_res = stream.pull_u8();
            let nfc_id_len = stream.pull_u8();
            let nfc_id = stream.read_n(nfc_id_len as usize).map(|b| b.to_vec()).unwrap_or_default();
            let ats_len = stream.pull_u8();
            let ats = if ats_len > 0 {
                stream.read_n(ats_len as usize - 1).map(|b| b.to_vec())
            } else {
                None
            };
            TargetRecord::TypeA {
                logical_index,
                sens_res,
                sel_res,
                nfc_id,
                ats,
            }
        }
        PollModulation::Kbps106TypeB => {
            let atqb = stream.read_n(12).map(|b| b.to_vec()).unwrap_or_default();
            let attrib_len = stream.pull_u8();
            let attrib_res = stream.read_n(attrib_len as usize).map(|b| b.to_vec()).unwrap_or_default();
            TargetRecord::TypeB {
                logical_index,
                atqb,
                attrib_res,
            }
        }
        PollModulation::Kbps212Felica | PollModulation::Kbps424Felica => {
            let len = stream.pull_u8();
            let pol_res = stream.read_n(len as usize).map(|b| b.to_vec()).unwrap_or_default();
            TargetRecord::Felica { logical_index, pol_res }
        }
        PollModulation::Kbps106Jewel => {
            let sens_res = stream.pull_u16(Endianness::Big);
            let mut jewel_id = [0u8; 4];
            for b in jewel_id.iter_mut() {
                *b = stream.pull_u8();
            }
            TargetRecord::Jewel {
                logical_index,
                sens_res,
                jewel_id,
            }
        }
    };
    if stream.is_bad() {
        return Err(Error::CommMalformed);
    }
    Ok(record)
}

/// §9: the minimum delay the host must honor after a baud-rate change
/// before resuming communication (the core reports this rather than
/// sleeping on it itself).
pub const POST_BAUD_CHANGE_DELAY: Duration = Duration::from_micros(200);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Direction, Frame};
    use crate::transport::test_support::MockTransport;
    use std::time::Instant;

    fn far_deadline() -> Deadline {
        Instant::now() + Duration::from_secs(10)
    }

    fn queue_response(transport: &mut MockTransport, body: Vec<u8>) {
        transport.queue_receive(Frame::info(Direction::ReaderToHost, 0x03, body).encode());
    }

    #[test]
    fn get_firmware_version_parses_four_bytes() {
        let mut transport = MockTransport::new();
        transport.queue_receive(Frame::Ack.encode());
        queue_response(&mut transport, vec![0x32, 0x01, 0x06, 0x07]);
        let mut reader = Reader::new(Channel::new(transport));
        let version = reader.get_firmware_version(far_deadline()).unwrap();
        assert_eq!(version, FirmwareVersion { ic: 0x32, version: 1, revision: 6, support: 7 });
    }

    #[test]
    fn list_passive_target_returns_empty_on_timeout() {
        let mut transport = MockTransport::new();
        transport.queue_receive(Frame::Ack.encode());
        transport.timeout_next_receive = true;
        let mut reader = Reader::new(Channel::new(transport));
        let targets = reader
            .initiator_list_passive_target(PollModulation::Kbps106TypeA, 1, &[], far_deadline())
            .unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn general_status_parses_one_target() {
        let mut transport = MockTransport::new();
        transport.queue_receive(Frame::Ack.encode());
        queue_response(&mut transport, vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00]);
        let mut reader = Reader::new(Channel::new(transport));
        let status = reader.get_general_status(far_deadline()).unwrap();
        assert!(status.field_present);
        assert_eq!(status.targets.len(), 1);
    }

    #[test]
    fn data_exchange_chunks_outbound_payload() {
        let mut transport = MockTransport::new();
        transport.queue_receive(Frame::Ack.encode());
        queue_response(&mut transport, vec![0x00]);
        transport.queue_receive(Frame::Ack.encode());
        queue_response(&mut transport, vec![0x00, 0xAA]);
        let mut reader = Reader::new(Channel::new(transport));
        let data = vec![0x11u8; 300];
        let (status, response) = reader.initiator_data_exchange(0x01, &data, far_deadline()).unwrap();
        assert!(status.is_success());
        assert_eq!(response, vec![0xAA]);
    }
}
