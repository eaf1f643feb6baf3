//! Wire-protocol codec
//!
//! Bidirectional mapping between raw message bytes and the typed operation
//! model. The fixed 16-byte header identifies and frames each message; the
//! body is decoded per opcode into one of the [`Op`] variants, or kept
//! opaque when the opcode is unrecognized.

pub mod command;
pub mod compressed;
pub mod delete;
pub mod get_more;
pub mod header;
pub mod insert;
pub mod kill_cursors;
pub mod msg;
pub mod op;
pub mod query;
pub mod reply;
pub mod update;
pub mod wire;

pub use command::{CommandGetMoreOp, CommandOp, CommandReplyOp};
pub use delete::DeleteOp;
pub use get_more::GetMoreOp;
pub use header::{MsgHeader, OpCode, HEADER_LEN, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};
pub use insert::InsertOp;
pub use kill_cursors::KillCursorsOp;
pub use msg::{MessageOp, UnknownOp};
pub use op::{CursorBearing, Op, OpMetadata, Replyable};
pub use query::QueryOp;
pub use reply::ReplyOp;
pub use update::UpdateOp;
