//! Length-prefixed frame codec
//!
//! Format:
//! [4 bytes] body length N (BE u32)
//! [N bytes] bincode-encoded `Frame`
//!
//! A length above the configured maximum is fatal for the stream. A body that
//! does not decode is skipped and the stream continues with the next frame.

use super::types::Frame;
use bincode::Options;
use thiserror::Error;
use tracing::debug;

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Read buffer is compacted once this many consumed bytes accumulate
const COMPACT_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl CodecError {
    /// Whether the stream this error came from can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::FrameTooLarge { .. })
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Serialize a frame body without the length prefix
pub fn encode_body(frame: &Frame, frame_size_max: usize) -> Result<Vec<u8>, CodecError> {
    let body = options().serialize(frame)?;
    if body.len() > frame_size_max {
        return Err(CodecError::FrameTooLarge {
            len: body.len(),
            max: frame_size_max,
        });
    }
    Ok(body)
}

/// Serialize a frame with its length prefix
pub fn encode_frame(frame: &Frame, frame_size_max: usize) -> Result<Vec<u8>, CodecError> {
    let body = encode_body(frame, frame_size_max)?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Deserialize a frame body (no length prefix)
pub fn decode_body(body: &[u8], frame_size_max: usize) -> Result<Frame, CodecError> {
    Ok(options()
        .with_limit(frame_size_max as u64)
        .deserialize(body)?)
}

/// Incremental decoder fed with arbitrary chunks of a byte stream
///
/// Bytes of an incomplete frame stay buffered until the rest arrives, so the
/// chunk boundaries of the underlying reads never affect the frames produced.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
    frame_size_max: usize,
}

impl FrameDecoder {
    pub fn new(frame_size_max: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            frame_size_max,
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        if self.pos >= COMPACT_THRESHOLD || self.pos == self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pop the next complete frame
    ///
    /// Returns `Ok(None)` when more input is needed. Malformed bodies are
    /// consumed and skipped. An oversized length is returned as
    /// [`CodecError::FrameTooLarge`] without consuming or allocating anything.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            let available = &self.buf[self.pos..];
            if available.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            prefix.copy_from_slice(&available[..LENGTH_PREFIX_SIZE]);
            let len = u32::from_be_bytes(prefix) as usize;
            if len > self.frame_size_max {
                return Err(CodecError::FrameTooLarge {
                    len,
                    max: self.frame_size_max,
                });
            }

            if available.len() < LENGTH_PREFIX_SIZE + len {
                return Ok(None);
            }

            let body = &available[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len];
            let decoded = decode_body(body, self.frame_size_max);
            self.pos += LENGTH_PREFIX_SIZE + len;

            match decoded {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    debug!("Skipping malformed frame of {} bytes: {}", len, e);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::{
        BtAddress, ConnectedFrame, DisconnectedFrame, HelloFrame, Peer, PortsFrame,
    };
    use crate::identity::NodeId;
    use proptest::prelude::*;

    const MAX: usize = 50 * 1024 * 1024;

    fn sample_frames() -> Vec<Frame> {
        let peer = Peer::new(BtAddress::new([1, 2, 3, 4, 5, 6]), true, vec![0, 3]);
        vec![
            Frame::Hello(HelloFrame {
                node_id: NodeId::new(99).unwrap(),
                peer: Some(peer.clone()),
            }),
            Frame::payload(b"hello mesh".to_vec()),
            Frame::Heartbeat,
            Frame::Ports(PortsFrame {
                address: peer.address,
                ports: vec![1, 2],
            }),
            Frame::Connected(ConnectedFrame { peer }),
            Frame::Disconnected(DisconnectedFrame {
                address: BtAddress::new([9; 6]),
            }),
        ]
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for frame in sample_frames() {
            let bytes = encode_frame(&frame, MAX).unwrap();
            let mut decoder = FrameDecoder::new(MAX);
            decoder.extend(&bytes);
            assert_eq!(decoder.next_frame().unwrap(), Some(frame));
            assert_eq!(decoder.buffered_len(), 0);
        }
    }

    #[test]
    fn test_prefix_is_big_endian_body_length() {
        let bytes = encode_frame(&Frame::Heartbeat, MAX).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_partial_input_is_not_consumed() {
        let bytes = encode_frame(&Frame::payload(vec![7; 100]), MAX).unwrap();
        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&bytes[..2]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&bytes[2..50]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered_len(), 50);
        decoder.extend(&bytes[50..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::payload(vec![7; 100])));
    }

    #[test]
    fn test_oversized_length_fails_closed() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&(u32::MAX).to_be_bytes());
        let err = decoder.next_frame().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, CodecError::FrameTooLarge { len, max: 1024 } if len == u32::MAX as usize));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let err = encode_frame(&Frame::payload(vec![0; 2048]), 1024).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 1024, .. }));
    }

    #[test]
    fn test_malformed_body_is_skipped() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&4u32.to_be_bytes());
        stream.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        stream.extend_from_slice(&0u32.to_be_bytes());
        stream.extend_from_slice(&encode_frame(&Frame::payload(vec![1, 2, 3]), MAX).unwrap());

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&stream);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::payload(vec![1, 2, 3])));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_hello_with_invalid_node_id_is_malformed() {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.extend_from_slice(&0u64.to_le_bytes());
        body.push(0);
        assert!(decode_body(&body, MAX).is_err());
    }

    proptest! {
        #[test]
        fn prop_fragmentation_does_not_change_output(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..8),
            chunk in 1usize..64,
        ) {
            let frames: Vec<Frame> = payloads.into_iter().map(Frame::payload).collect();
            let mut stream = Vec::new();
            for frame in &frames {
                stream.extend_from_slice(&encode_frame(frame, MAX).unwrap());
            }

            let mut whole = FrameDecoder::new(MAX);
            whole.extend(&stream);
            let mut expected = Vec::new();
            while let Some(frame) = whole.next_frame().unwrap() {
                expected.push(frame);
            }

            let mut pieces = FrameDecoder::new(MAX);
            let mut actual = Vec::new();
            for piece in stream.chunks(chunk) {
                pieces.extend(piece);
                while let Some(frame) = pieces.next_frame().unwrap() {
                    actual.push(frame);
                }
            }

            prop_assert_eq!(&expected, &frames);
            prop_assert_eq!(actual, expected);
        }
    }
}
