//! Types shared by every datafront peer: the JSON wire messages, entity
//! addressing, the error taxonomy and the length-prefixed framing codec.

pub mod codec;
pub mod entity;
pub mod error;
pub mod messages;

pub use entity::{EntityId, EntityKind, Fields, KindInfo};
pub use error::{CodecError, ErrorInfo, ErrorKind};
pub use messages::*;
