//! Wire framing shared by every stream-based link
//!
//! - **types**: the `Frame` tagged union and the Bluetooth peer snapshot types
//! - **codec**: length-prefixed encoding and a restartable stream decoder

pub mod codec;
pub mod types;

pub use codec::{decode_body, encode_body, encode_frame, CodecError, FrameDecoder, LENGTH_PREFIX_SIZE};
pub use types::{
    BtAddress, BtAddressError, ConnectedFrame, DisconnectedFrame, Frame, FrameKind, HelloFrame,
    PayloadFrame, Peer, PortsFrame,
};
