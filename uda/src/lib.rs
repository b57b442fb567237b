//! Pure Rust client and server for the UDA (Universal Data Access)
//! dispatch and transport engine: a record-framed binary protocol over one
//! long-lived TCP connection, a request grammar turning free-form
//! `(signal, source)` strings into structured requests, plugin dispatch,
//! and handle-based result management.

mod block;
mod client;
mod environment;
mod errors;
mod handles;
mod io;
mod metadata;
mod parser;
mod protocol;
mod record;
mod request;
mod server;
mod session;
mod structured;

pub mod plugins;

#[cfg(feature = "auth")]
pub mod auth;
#[cfg(feature = "cache")]
pub mod cache;

pub use block::{AtomicType, DataBlock, Dim, OpaqueBlock};
pub use client::Client;
pub use environment::Environment;
pub use errors::{ErrorKind, ErrorRecord, ErrorStack, RequestError, Result, UdaError};
pub use handles::{Handle, HandleTable};
pub use metadata::{DataSource, DataSystem, MetadataBlocks, SignalDesc, SignalRec, SystemConfig};
pub use parser::make_request_block;
pub use protocol::{
    ClientBlock, ClientProperties, NextProtocol, OpaqueType, ProtocolId, ServerBlock,
    CLIENTFLAG_ALTDATA, CLIENTFLAG_CACHE, CLIENTFLAG_CLOSEDOWN, CLIENTFLAG_FREEREUSELASTHANDLE,
    CLIENTFLAG_REUSELASTHANDLE, CLIENTFLAG_XDRFILE, CLIENT_VERSION, DEFAULT_PORT,
    MIN_PROTOCOL_VERSION,
};
pub use request::{
    DataSubset, NameValue, NameValueList, PutDataBlock, PutDataBlockList, RequestBlock,
    RequestKind,
};
pub use server::Server;
pub use session::{SessionEvent, SessionState};
pub use structured::{
    AllocEntry, AllocLog, CompoundField, FieldValue, GeneralBlock, StructNode, UserDefinedType,
    UserDefinedTypeList,
};
