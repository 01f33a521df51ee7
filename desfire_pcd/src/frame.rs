//! Bit-exact encoder/decoder for the reader's wire frames: ACK, NACK, the
//! application error frame, and standard/extended-length info frames
//! carrying a direction byte, a command byte, and data.

use crate::buffer::BinData;
use crate::Error;
use nom::bytes::complete::{tag, take, take_until};
use nom::number::complete::{be_u16, u8 as nom_u8};

pub const PREAMBLE: u8 = 0x00;
pub const POSTAMBLE: u8 = 0x00;
pub const SOP: [u8; 2] = [0x00, 0xFF];
pub const EXTENDED_SENTINEL: [u8; 2] = [0xFF, 0xFF];
pub const ACK_BODY: [u8; 2] = [0x00, 0xFF];
pub const NACK_BODY: [u8; 2] = [0xFF, 0x00];
pub const ERROR_PAYLOAD: u8 = 0x7F;

/// A frame's payload may not exceed this many bytes (direction + command +
/// data), matching the reader's per-frame cap.
pub const MAX_INFO_PAYLOAD: usize = 263;

pub const DIR_HOST_TO_READER: u8 = 0xD4;
pub const DIR_READER_TO_HOST: u8 = 0xD5;

/// Command byte prepended to outbound continuation chunks, and reused as
/// the inbound request a channel sends to ask the reader for the next
/// chunk of a multi-frame response. Shares its value with
/// [`crate::error::status::ADDITIONAL_FRAME`] by convention.
pub const ADDITIONAL_FRAME_COMMAND: u8 = 0xAF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToReader,
    ReaderToHost,
}

impl Direction {
    pub(crate) fn byte(self) -> u8 {
        match self {
            Direction::HostToReader => DIR_HOST_TO_READER,
            Direction::ReaderToHost => DIR_READER_TO_HOST,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Direction> {
        match byte {
            DIR_HOST_TO_READER => Some(Direction::HostToReader),
            DIR_READER_TO_HOST => Some(Direction::ReaderToHost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    Info {
        direction: Direction,
        command: u8,
        data: Vec<u8>,
    },
    Error,
}

impl Frame {
    pub fn info(direction: Direction, command: u8, data: Vec<u8>) -> Frame {
        Frame::Info {
            direction,
            command,
            data,
        }
    }

    /// Encodes this frame to its bit-exact wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BinData::new();
        out.push_u8(PREAMBLE);
        out.push_bytes(&SOP);
        match self {
            Frame::Ack => {
                out.push_bytes(&ACK_BODY);
                out.push_u8(POSTAMBLE);
                return out.into_vec();
            }
            Frame::Nack => {
                out.push_bytes(&NACK_BODY);
                out.push_u8(POSTAMBLE);
                return out.into_vec();
            }
            Frame::Error => {
                encode_length(&mut out, 1);
                out.push_u8(ERROR_PAYLOAD);
                out.push_u8(data_checksum(&[ERROR_PAYLOAD]));
            }
            Frame::Info {
                direction,
                command,
                data,
            } => {
                let len = 2 + data.len();
                encode_length(&mut out, len);
                out.push_u8(direction.byte());
                out.push_u8(*command);
                out.push_bytes(data);
                let mut body = Vec::with_capacity(len);
                body.push(direction.byte());
                body.push(*command);
                body.extend_from_slice(data);
                out.push_u8(data_checksum(&body));
            }
        }
        out.push_u8(POSTAMBLE);
        out.into_vec()
    }

    /// Scans `input` for a frame, skipping any leading noise before the
    /// start-of-packet marker. Returns the decoded frame together with the
    /// number of bytes of `input` it consumed.
    pub fn decode(input: &[u8]) -> Result<(Frame, usize), Error> {
        let original_len = input.len();
        let (input, _noise) =
            take_until::<_, _, nom::error::Error<&[u8]>>(&SOP[..])(input).map_err(|_| Error::CommMalformed)?;
        let (input, _sop) =
            tag::<_, _, nom::error::Error<&[u8]>>(&SOP[..])(input).map_err(|_| Error::CommMalformed)?;

        let (input, marker) =
            take::<_, _, nom::error::Error<&[u8]>>(2usize)(input).map_err(|_| Error::CommMalformed)?;

        if marker == ACK_BODY {
            let consumed = original_len - input.len() + trailing_postamble(input);
            return Ok((Frame::Ack, consumed));
        }
        if marker == NACK_BODY {
            let consumed = original_len - input.len() + trailing_postamble(input);
            return Ok((Frame::Nack, consumed));
        }

        let (input, length) = if marker == EXTENDED_SENTINEL {
            decode_extended_length(input)?
        } else {
            (input, decode_short_length(marker)?)
        };

        let (input, payload) =
            take::<_, _, nom::error::Error<&[u8]>>(length)(input).map_err(|_| Error::CommMalformed)?;
        let (input, dcs) = nom_u8::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::CommMalformed)?;
        if data_checksum(payload) != dcs {
            return Err(Error::CommMalformed);
        }

        let consumed = original_len - input.len() + trailing_postamble(input);

        if length == 1 && payload[0] == ERROR_PAYLOAD {
            return Ok((Frame::Error, consumed));
        }
        if length < 2 {
            return Err(Error::CommMalformed);
        }
        let direction = Direction::from_byte(payload[0]).ok_or(Error::CommMalformed)?;
        let command = payload[1];
        let data = payload[2..].to_vec();
        Ok((
            Frame::Info {
                direction,
                command,
                data,
            },
            consumed,
        ))
    }
}

fn trailing_postamble(input: &[u8]) -> usize {
    if input.first() == Some(&POSTAMBLE) {
        1
    } else {
        0
    }
}

fn decode_short_length(marker: [u8; 2]) -> Result<usize, Error> {
    let (l, lc) = (marker[0], marker[1]);
    if l.wrapping_add(lc) != 0 {
        return Err(Error::CommMalformed);
    }
    Ok(l as usize)
}

fn decode_extended_length(input: &[u8]) -> Result<(&[u8], usize), Error> {
    let (input, length) =
        be_u16::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::CommMalformed)?;
    let (input, lcs) = nom_u8::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::CommMalformed)?;
    let bytes = length.to_be_bytes();
    let sum = bytes[0].wrapping_add(bytes[1]).wrapping_add(lcs);
    if sum != 0 {
        return Err(Error::CommMalformed);
    }
    Ok((input, length as usize))
}

fn encode_length(out: &mut BinData, len: usize) {
    if len <= 255 {
        let l = len as u8;
        out.push_u8(l);
        out.push_u8(0u8.wrapping_sub(l));
    } else {
        out.push_bytes(&EXTENDED_SENTINEL);
        let bytes = (len as u16).to_be_bytes();
        out.push_bytes(&bytes);
        out.push_u8(0u8.wrapping_sub(bytes[0]).wrapping_sub(bytes[1]));
    }
}

pub(crate) fn data_checksum(body: &[u8]) -> u8 {
    let sum: u8 = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_short_scenario() {
        let frame = Frame::info(Direction::HostToReader, 0x02, vec![]);
        assert_eq!(
            frame.encode(),
            vec![0x00, 0x00, 0xFF, 0x02, 0xFE, 0xD4, 0x02, 0x2A, 0x00]
        );
    }

    #[test]
    fn framing_extended_scenario() {
        let data = vec![0xAAu8; 300];
        let frame = Frame::info(Direction::HostToReader, 0x40, data.clone());
        let encoded = frame.encode();
        assert_eq!(&encoded[0..3], &[0x00, 0x00, 0xFF]);
        assert_eq!(&encoded[3..5], &EXTENDED_SENTINEL);
        assert_eq!(&encoded[5..7], &[0x01, 0x2E]);
        assert_eq!(encoded[7], 0xD1);
        let mut expected_sum: u32 = DIR_HOST_TO_READER as u32 + 0x40;
        expected_sum += 300 * 0xAA;
        let expected_dcs = (256 - (expected_sum % 256)) % 256;
        let dcs_index = encoded.len() - 2;
        assert_eq!(encoded[dcs_index] as u32, expected_dcs);
    }

    #[test]
    fn ack_round_trip() {
        let bytes = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];
        let (frame, consumed) = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, Frame::Ack);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn nack_round_trip() {
        let bytes = Frame::Nack.encode();
        let (frame, _) = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, Frame::Nack);
    }

    #[test]
    fn error_frame_round_trip() {
        let bytes = Frame::Error.encode();
        assert_eq!(bytes, vec![0x00, 0x00, 0xFF, 0x01, 0xFF, 0x7F, 0x81, 0x00]);
        let (frame, _) = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, Frame::Error);
    }

    #[test]
    fn info_frame_round_trip() {
        let original = Frame::info(Direction::ReaderToHost, 0x4B, vec![1, 2, 3, 4]);
        let bytes = original.encode();
        let (decoded, consumed) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn decode_skips_leading_noise() {
        let mut bytes = vec![0x00, 0x00, 0x00, 0x11, 0x22];
        bytes.extend(Frame::Ack.encode());
        let (frame, _) = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, Frame::Ack);
    }

    #[test]
    fn decode_rejects_bad_checksum() {
        let mut bytes = Frame::info(Direction::HostToReader, 0x02, vec![]).encode();
        let dcs_index = bytes.len() - 2;
        bytes[dcs_index] ^= 0xFF;
        assert_eq!(Frame::decode(&bytes), Err(Error::CommMalformed));
    }

    #[test]
    fn decode_rejects_bad_short_length_checksum() {
        let mut bytes = Frame::info(Direction::HostToReader, 0x02, vec![]).encode();
        bytes[4] ^= 0x01;
        assert_eq!(Frame::decode(&bytes), Err(Error::CommMalformed));
    }

    #[test]
    fn extended_length_round_trip_large_payload() {
        let data = vec![0x11u8; 500];
        let original = Frame::info(Direction::HostToReader, 0x01, data);
        let bytes = original.encode();
        let (decoded, _) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }
}
