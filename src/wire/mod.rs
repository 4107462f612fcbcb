//! Wire protocol between the operator tool and the host.
//!
//! ```text
//! +----------------------+-----------+-------------------------+
//! | Length (u32, BE)     | Kind (u8) | Payload (bincode)       |
//! +----------------------+-----------+-------------------------+
//! ```
//!
//! - `codec`: length-delimited framing with handshake / full size limits.
//! - `messages`: frame kinds and their typed payloads.
//! - `serial`: the single binary payload format.
//! - `handshake`: `Hello` verification.

pub mod codec;
pub mod handshake;
pub mod messages;
pub mod serial;

pub use codec::FrameCodec;
pub use messages::{FrameKind, Message, PROTOCOL_VERSION};
