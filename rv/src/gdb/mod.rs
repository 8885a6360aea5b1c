//! The GDB Remote Serial Protocol surface: packet framing (`codec`), payload
//! assembly (`bytebuffer`), and the server/session loop (`server`).

pub mod bytebuffer;
pub mod codec;
pub mod error;
pub mod server;
