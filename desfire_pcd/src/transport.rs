//! The one thing a concrete driver (UART, I²C, SPI) must implement.
//! Everything above this layer — framing, channel, reader and card command
//! surfaces — is transport-agnostic; this crate never touches a serial
//! port, a GPIO line, or an interrupt directly.

use crate::Error;
use std::time::Instant;

/// A caller-supplied point in time past which a [`Transport`] call must give
/// up and report [`Error::CommTimeout`]. The core has no sleep/thread
/// primitive of its own; all suspension happens inside the transport's
/// `send`/`receive`.
pub type Deadline = Instant;

/// Capability a driver must implement to move bytes to/from the reader.
///
/// Implementations are synchronous and blocking: a call returns only once
/// it has succeeded, hit `deadline`, or hit a transport-level fault. The
/// core drives exactly one `Transport` per `Channel` and never calls it
/// concurrently.
pub trait Transport {
    /// Writes `bytes` to the reader, completing or failing before
    /// `deadline`.
    fn send(&mut self, bytes: &[u8], deadline: Deadline) -> Result<(), Error>;

    /// Reads exactly `n_bytes` from the reader, completing or failing
    /// before `deadline`.
    fn receive(&mut self, n_bytes: usize, deadline: Deadline) -> Result<Vec<u8>, Error>;

    /// Wakes a sleeping reader (e.g. a dummy byte on UART, a GPIO pulse on
    /// two-wire). Transports that need no wake step may no-op.
    fn wake(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called immediately before a logical receive operation starts,
    /// letting two-wire/four-wire drivers poll a ready line or send a
    /// status-read preamble.
    fn on_receive_begin(&mut self, _deadline: Deadline) -> Result<(), Error> {
        Ok(())
    }

    /// Called immediately after a logical receive operation completes
    /// (successfully or not).
    fn on_receive_end(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called immediately before a logical send operation starts.
    fn on_send_begin(&mut self, _deadline: Deadline) -> Result<(), Error> {
        Ok(())
    }

    /// Called immediately after a logical send operation completes.
    fn on_send_end(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Whether several `receive` calls may share one `on_receive_begin`/
    /// `on_receive_end` bracket. Asynchronous serial (no ready line to
    /// poll) can say `true`; a two-wire bus that must poll readiness before
    /// every single read should say `false`.
    fn supports_multi_receive(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory [`Transport`] used by unit tests across this crate: it
    /// answers `receive` from a queue of pre-seeded response bytes and
    /// records every `send` for inspection.
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Vec<Vec<u8>>,
        pub to_receive: VecDeque<Vec<u8>>,
        pub fail_next_send: bool,
        pub timeout_next_receive: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_receive(&mut self, bytes: Vec<u8>) {
            self.to_receive.push_back(bytes);
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, bytes: &[u8], _deadline: Deadline) -> Result<(), Error> {
            if self.fail_next_send {
                self.fail_next_send = false;
                return Err(Error::CommError);
            }
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        fn receive(&mut self, n_bytes: usize, _deadline: Deadline) -> Result<Vec<u8>, Error> {
            if self.timeout_next_receive {
                self.timeout_next_receive = false;
                return Err(Error::CommTimeout);
            }
            let mut queued = self.to_receive.pop_front().ok_or(Error::CommTimeout)?;
            if queued.len() < n_bytes {
                return Err(Error::CommMalformed);
            }
            let rest = queued.split_off(n_bytes);
            if !rest.is_empty() {
                self.to_receive.push_front(rest);
            }
            Ok(queued)
        }
    }
}
