//! Secure File Transfer — shared server library
//!
//! Implements the wire codec, crypto primitives, file store, persistent
//! client/file state, and request dispatcher for the file-transfer
//! protocol. The binary entry point lives in `transfer-server`.

pub mod codec;
pub mod crypto;
pub mod database;
pub mod dispatcher;
pub mod store;

pub use codec::{Opcode, RequestHeader, RequestPayload, Response, ResponseHeader};
pub use database::{Client, PersistentState, TransferredFile};
pub use store::FileStore;

/// Common result type for transfer-server operations
pub type Result<T> = anyhow::Result<T>;

/// Protocol version echoed in every response header.
pub const PROTOCOL_VERSION: u8 = 3;
