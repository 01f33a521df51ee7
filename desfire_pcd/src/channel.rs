//! Reader channel: turns a [`Transport`]'s raw bytes into full command/
//! response cycles over the frame codec, including ACK/NACK handling,
//! chunking of oversized requests and responses, and deadline-driven
//! cancellation.

use crate::error::status;
use crate::frame::{self, Direction, Frame};
use crate::transport::{Deadline, Transport};
use crate::Error;
use std::time::{Duration, Instant};

/// How long the channel waits for an ACK after sending a frame, capped by
/// the caller's overall deadline.
pub const DEFAULT_ACK_WINDOW: Duration = Duration::from_millis(1000);

/// Data chunk size for outbound frames: leaves one byte of the frame's
/// payload cap for the command/continuation byte.
const CHUNK_SIZE: usize = frame::MAX_INFO_PAYLOAD - 1;

/// Malformed or timed-out response frames are retried this many times
/// (each retry sends a NACK) before the channel gives up.
const MAX_RETRIES: u32 = 3;

pub struct Channel<T: Transport> {
    transport: T,
    busy: bool,
    ack_window: Duration,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            busy: false,
            ack_window: DEFAULT_ACK_WINDOW,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn wake(&mut self) -> Result<(), Error> {
        self.transport.wake()
    }

    /// Runs a full command/response cycle and returns the concatenated
    /// response body (status byte included, continuation framing
    /// stripped). Panics if a command is already in progress: reentrant
    /// invocation is a programmer error, not a recoverable one.
    pub fn command(&mut self, command: u8, data: &[u8], deadline: Deadline) -> Result<Vec<u8>, Error> {
        assert!(!self.busy, "Channel::command called while an operation is already in progress");
        self.busy = true;
        let result = self.command_inner(command, data, deadline);
        self.busy = false;
        result
    }

    /// Runs a command, then parses its response body with `parse`. Returns
    /// [`Error::CommMalformed`] if `parse` leaves unconsumed bytes.
    pub fn command_parse_response<F, R>(
        &mut self,
        command: u8,
        data: &[u8],
        deadline: Deadline,
        parse: F,
    ) -> Result<R, Error>
    where
        F: FnOnce(&mut crate::buffer::ByteStream) -> R,
    {
        let body = self.command(command, data, deadline)?;
        let mut stream = crate::buffer::ByteStream::new(&body);
        let result = parse(&mut stream);
        if stream.is_bad() || stream.remaining() != 0 {
            return Err(Error::CommMalformed);
        }
        Ok(result)
    }

    /// Sends a bare ACK frame, e.g. to politely abandon a response the
    /// caller no longer wants to wait out.
    pub fn send_ack(&mut self, deadline: Deadline) -> Result<(), Error> {
        self.send_frame(Frame::Ack, deadline)
    }

    /// Waits for a bare ACK frame (anything else is malformed).
    pub fn receive_ack(&mut self, deadline: Deadline) -> Result<(), Error> {
        match self.receive_frame(deadline)? {
            Frame::Ack => Ok(()),
            _ => Err(Error::CommMalformed),
        }
    }

    fn command_inner(&mut self, command: u8, data: &[u8], deadline: Deadline) -> Result<Vec<u8>, Error> {
        let chunks = chunk_data(data);
        for (i, chunk) in chunks.iter().enumerate() {
            let command_byte = if i == 0 {
                command
            } else {
                frame::ADDITIONAL_FRAME_COMMAND
            };
            self.send_frame(
                Frame::info(Direction::HostToReader, command_byte, chunk.clone()),
                deadline,
            )?;
            self.await_ack(deadline)?;
        }
        self.receive_response(deadline)
    }

    fn receive_response(&mut self, deadline: Deadline) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        loop {
            let frame = self.receive_frame_resilient(deadline)?;
            match frame {
                Frame::Error => return Err(Error::Failure),
                Frame::Ack | Frame::Nack => return Err(Error::CommMalformed),
                Frame::Info { direction, data, .. } => {
                    if direction != Direction::ReaderToHost {
                        return Err(Error::CommMalformed);
                    }
                    self.send_ack(deadline)?;
                    if data.first() == Some(&status::ADDITIONAL_FRAME) {
                        body.extend_from_slice(&data[1..]);
                        self.send_frame(
                            Frame::info(Direction::HostToReader, frame::ADDITIONAL_FRAME_COMMAND, Vec::new()),
                            deadline,
                        )?;
                        self.await_ack(deadline)?;
                        continue;
                    }
                    body.extend_from_slice(&data);
                    return Ok(body);
                }
            }
        }
    }

    /// Receives one frame, retrying on timeout/malformed input by sending a
    /// NACK, up to [`MAX_RETRIES`] times. If the deadline has already
    /// passed, sends an ACK to cancel the in-flight command instead of
    /// retrying.
    fn receive_frame_resilient(&mut self, deadline: Deadline) -> Result<Frame, Error> {
        let mut retries = 0;
        loop {
            match self.receive_frame(deadline) {
                Ok(frame) => return Ok(frame),
                Err(Error::CommTimeout) | Err(Error::CommMalformed) => {
                    if Instant::now() >= deadline {
                        let _ = self.send_frame(Frame::Ack, deadline);
                        return Err(Error::Canceled);
                    }
                    if retries >= MAX_RETRIES {
                        return Err(Error::CommTimeout);
                    }
                    retries += 1;
                    self.send_frame(Frame::Nack, deadline)?;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn await_ack(&mut self, deadline: Deadline) -> Result<(), Error> {
        let ack_deadline = std::cmp::min(Instant::now() + self.ack_window, deadline);
        match self.receive_frame(ack_deadline)? {
            Frame::Ack => Ok(()),
            Frame::Nack => Err(Error::Nack),
            _ => Err(Error::CommMalformed),
        }
    }

    fn send_frame(&mut self, frame: Frame, deadline: Deadline) -> Result<(), Error> {
        self.transport.on_send_begin(deadline)?;
        let result = self.transport.send(&frame.encode(), deadline);
        self.transport.on_send_end()?;
        result
    }

    /// Reads one frame byte-by-byte, since [`Transport::receive`] takes an
    /// exact byte count and a frame's length is not known up front.
    fn receive_frame(&mut self, deadline: Deadline) -> Result<Frame, Error> {
        self.transport.on_receive_begin(deadline)?;
        let result = self.receive_frame_bytes(deadline);
        self.transport.on_receive_end()?;
        result
    }

    fn receive_byte(&mut self, deadline: Deadline) -> Result<u8, Error> {
        let bytes = self.transport.receive(1, deadline)?;
        bytes.first().copied().ok_or(Error::CommMalformed)
    }

    fn receive_frame_bytes(&mut self, deadline: Deadline) -> Result<Frame, Error> {
        let mut prev = self.receive_byte(deadline)?;
        loop {
            let next = self.receive_byte(deadline)?;
            if prev == frame::SOP[0] && next == frame::SOP[1] {
                break;
            }
            prev = next;
        }

        let marker = [self.receive_byte(deadline)?, self.receive_byte(deadline)?];
        if marker == frame::ACK_BODY {
            let _ = self.receive_byte(deadline);
            return Ok(Frame::Ack);
        }
        if marker == frame::NACK_BODY {
            let _ = self.receive_byte(deadline);
            return Ok(Frame::Nack);
        }

        let length = if marker == frame::EXTENDED_SENTINEL {
            let len_hi = self.receive_byte(deadline)?;
            let len_lo = self.receive_byte(deadline)?;
            let lcs = self.receive_byte(deadline)?;
            if len_hi.wrapping_add(len_lo).wrapping_add(lcs) != 0 {
                return Err(Error::CommMalformed);
            }
            ((len_hi as usize) << 8) | len_lo as usize
        } else {
            if marker[0].wrapping_add(marker[1]) != 0 {
                return Err(Error::CommMalformed);
            }
            marker[0] as usize
        };

        let payload = self.transport.receive(length, deadline)?;
        let dcs = self.receive_byte(deadline)?;
        if frame::data_checksum(&payload) != dcs {
            return Err(Error::CommMalformed);
        }
        let _ = self.receive_byte(deadline);

        if length == 1 && payload[0] == frame::ERROR_PAYLOAD {
            return Ok(Frame::Error);
        }
        if length < 2 {
            return Err(Error::CommMalformed);
        }
        let direction = Direction::from_byte(payload[0]).ok_or(Error::CommMalformed)?;
        let command = payload[1];
        let data = payload[2..].to_vec();
        Ok(Frame::Info {
            direction,
            command,
            data,
        })
    }
}

fn chunk_data(data: &[u8]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return vec![Vec::new()];
    }
    data.chunks(CHUNK_SIZE).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::MockTransport;

    fn far_deadline() -> Deadline {
        Instant::now() + Duration::from_secs(10)
    }

    fn frame_bytes(frame: Frame) -> Vec<u8> {
        frame.encode()
    }

    #[test]
    fn simple_command_round_trip() {
        let mut transport = MockTransport::new();
        transport.queue_receive(frame_bytes(Frame::Ack));
        transport.queue_receive(frame_bytes(Frame::info(Direction::ReaderToHost, 0x4B, vec![0x00, 0x01, 0x02])));
        let mut channel = Channel::new(transport);
        let body = channel.command(0x4A, &[0x01], far_deadline()).unwrap();
        assert_eq!(body, vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn nack_after_send_aborts() {
        let mut transport = MockTransport::new();
        transport.queue_receive(frame_bytes(Frame::Nack));
        let mut channel = Channel::new(transport);
        let result = channel.command(0x4A, &[], far_deadline());
        assert_eq!(result, Err(Error::Nack));
    }

    #[test]
    fn error_frame_reported_as_failure() {
        let mut transport = MockTransport::new();
        transport.queue_receive(frame_bytes(Frame::Ack));
        transport.queue_receive(frame_bytes(Frame::Error));
        let mut channel = Channel::new(transport);
        let result = channel.command(0x4A, &[], far_deadline());
        assert_eq!(result, Err(Error::Failure));
    }

    #[test]
    fn multi_frame_response_is_concatenated() {
        let mut transport = MockTransport::new();
        transport.queue_receive(frame_bytes(Frame::Ack));
        transport.queue_receive(frame_bytes(Frame::info(
            Direction::ReaderToHost,
            0x4B,
            vec![status::ADDITIONAL_FRAME, 0x01, 0x02],
        )));
        transport.queue_receive(frame_bytes(Frame::Ack));
        transport.queue_receive(frame_bytes(Frame::info(Direction::ReaderToHost, 0x4B, vec![0x00, 0x03, 0x04])));
        let mut channel = Channel::new(transport);
        let body = channel.command(0x4A, &[], far_deadline()).unwrap();
        assert_eq!(body, vec![0x01, 0x02, 0x00, 0x03, 0x04]);
    }

    #[test]
    fn oversized_request_is_chunked_with_continuation_command() {
        let mut transport = MockTransport::new();
        for _ in 0..2 {
            transport.queue_receive(frame_bytes(Frame::Ack));
        }
        transport.queue_receive(frame_bytes(Frame::info(Direction::ReaderToHost, 0x4B, vec![0x00])));
        let mut channel = Channel::new(transport);
        let data = vec![0x7Au8; CHUNK_SIZE + 10];
        channel.command(0x40, &data, far_deadline()).unwrap();
        let sent = &channel.transport_mut().sent;
        // Two outbound chunks, then the final ACK for the single-frame response.
        assert_eq!(sent.len(), 3);
        let (first_frame, _) = Frame::decode(&sent[0]).unwrap();
        let (second_frame, _) = Frame::decode(&sent[1]).unwrap();
        match first_frame {
            Frame::Info { command, .. } => assert_eq!(command, 0x40),
            _ => panic!("expected info frame"),
        }
        match second_frame {
            Frame::Info { command, .. } => assert_eq!(command, frame::ADDITIONAL_FRAME_COMMAND),
            _ => panic!("expected info frame"),
        }
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn reentrant_command_panics() {
        struct ReentrantTransport;
        impl Transport for ReentrantTransport {
            fn send(&mut self, _bytes: &[u8], _deadline: Deadline) -> Result<(), Error> {
                Ok(())
            }
            fn receive(&mut self, _n_bytes: usize, _deadline: Deadline) -> Result<Vec<u8>, Error> {
                Err(Error::CommTimeout)
            }
        }
        let mut channel = Channel::new(ReentrantTransport);
        channel.busy = true;
        let _ = channel.command(0x00, &[], far_deadline());
    }
}
