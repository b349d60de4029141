use thiserror::Error;

/// Errors surfaced by the transmission interface.
///
/// All variants are fatal to the in-flight invocation; the pipeline never
/// retries a transport failure on its own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel to the device is closed")]
    Closed,
    /// The command may already have executed on the device. A timeout means
    /// "outcome unknown", never "not executed".
    #[error("timed out waiting for the device response")]
    Timeout,
    #[error("device returned an empty response")]
    Empty,
    #[error("transport i/o failure: {0}")]
    Io(String),
}

/// Byte-level exchange with the security coprocessor (or a simulator).
///
/// One call corresponds to exactly one command/response round trip. The trait
/// imposes no framing beyond what the wire codec already embeds in the
/// buffer. Implementations may block.
///
/// The device executes commands strictly serially; `send` takes `&mut self`
/// so a single transport value is also the mutual-exclusion boundary for one
/// device connection. Callers that need concurrent submission must use
/// independent connections.
pub trait Transport {
    /// Deliver `request` to the device and return its raw response bytes.
    ///
    /// # Errors
    /// * `TransportError::Closed` if the channel is gone.
    /// * `TransportError::Timeout` if no response arrived in time; the
    ///   command's effect on the device is unknown in that case.
    /// * `TransportError::Empty` must be returned for a zero-length response.
    fn send(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).send(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Loopback transport echoing a fixed response; exercises the trait flow.
    struct FixedTransport {
        response: Vec<u8>,
        calls: usize,
    }

    impl Transport for FixedTransport {
        fn send(&mut self, _request: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.calls += 1;
            if self.response.is_empty() {
                return Err(TransportError::Empty);
            }
            Ok(self.response.clone())
        }
    }

    #[test]
    fn send_returns_response_and_counts_calls() {
        let mut t = FixedTransport {
            response: vec![0x80, 0x01],
            calls: 0,
        };
        let out = t.send(b"cmd").unwrap();
        assert_eq!(out, vec![0x80, 0x01]);
        assert_eq!(t.calls, 1);
    }

    #[test]
    fn empty_response_is_a_transport_error() {
        let mut t = FixedTransport {
            response: Vec::new(),
            calls: 0,
        };
        let err = t.send(b"cmd").unwrap_err();
        assert_eq!(err, TransportError::Empty);
    }
}
