//! DAP wire protocol: framing, message records, request validation.

pub mod codec;
pub mod messages;
pub mod schema;

/// Maximum size of the header section of a framed message.
pub const MAX_DAP_HEADER_BYTES: usize = 8 * 1024;

/// Maximum accepted `Content-Length`. Large enough for any source body we
/// would ever ship in a `source` response, small enough that a corrupt
/// header cannot make us balloon.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
