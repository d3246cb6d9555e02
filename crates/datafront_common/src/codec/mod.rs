//! Framing for the datafront wire protocol.

mod framed;

pub use framed::{FramedJsonCodec, LENGTH_PREFIX, encode_batch, split_frames};
