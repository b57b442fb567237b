use thiserror::Error;

use crate::io::{UdaRead, UdaWrite};

/// Upper bound on the error stack. Overflow drops the oldest non-fatal entry.
pub const MAX_ERROR_STACK: usize = 25;

pub type Result<T> = std::result::Result<T, UdaError>;

/// Parser failures reported synchronously to the caller. No connection is
/// involved in producing one of these.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("neither data object nor source specified")]
    EmptyRequest,
    #[error("source syntax: path with parenthesis () is incorrect")]
    PathWithParens,
    #[error("no file format identified: please specify")]
    UnknownFormat,
    #[error("function syntax error")]
    FunctionSyntax,
    #[error("name value pair syntax is incorrect")]
    NameValueSyntax,
    #[error("the archive name is too long")]
    ArchiveNameTooLong,
    #[error("too many chained device name to server protocol substitutions")]
    RequestDepthExceeded,
    #[error("subset operation is incorrect")]
    BadSubset,
    #[error("the data source does not comply with the server/tree/number naming model")]
    NoServerSpecified,
}

#[derive(Error, Debug)]
pub enum UdaError {
    #[error("i/o error: {0}")]
    System(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request error: {0}")]
    Request(#[from] RequestError),
    #[error("plugin error {code}: {message}")]
    Plugin { code: i32, message: String },
    #[error("data error {code}: {message}")]
    Data { code: i32, message: String },
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("server-side failure: {}", .0.top_message())]
    ServerSide(ErrorStack),
    #[error("a request with the same fingerprint is already being materialised")]
    CacheBusy,
    #[error("no data block is held for handle {0}")]
    MissingHandle(i32),
}

impl UdaError {
    /// The code carried into `DataBlock::errcode` when a handle is still issued.
    pub fn code(&self) -> i32 {
        match self {
            UdaError::System(_) => 1,
            UdaError::Protocol(_) => 2,
            UdaError::Request(_) => 3,
            UdaError::Plugin { code, .. } => *code,
            UdaError::Data { code, .. } => *code,
            UdaError::Auth(_) => 6,
            UdaError::ServerSide(stack) => stack.top_code(),
            UdaError::CacheBusy => 7,
            UdaError::MissingHandle(_) => 8,
        }
    }
}

/// Origin of an error stack record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    System = 1,
    Code = 2,
    Plugin = 3,
}

impl ErrorKind {
    pub fn from_u32(i: u32) -> Result<Self> {
        Ok(match i {
            1 => ErrorKind::System,
            2 => ErrorKind::Code,
            3 => ErrorKind::Plugin,
            x => return Err(UdaError::Protocol(format!("invalid error kind: {x}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// Routine or component that raised the error.
    pub location: String,
    pub code: i32,
    pub message: String,
}

/// Append-only within a request; serialised in SERVER_BLOCK and reset at the
/// request boundary. The most recent entry is the most significant and sits
/// at the front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStack {
    records: Vec<ErrorRecord>,
}

impl ErrorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: ErrorKind, location: &str, code: i32, message: &str) {
        if self.records.len() >= MAX_ERROR_STACK {
            // Drop the oldest non-fatal entry; system errors are kept.
            if let Some(pos) = self.records.iter().rposition(|r| r.kind != ErrorKind::System) {
                self.records.remove(pos);
            } else {
                self.records.pop();
            }
        }
        self.records.insert(
            0,
            ErrorRecord {
                kind,
                location: location.to_string(),
                code,
                message: message.to_string(),
            },
        );
    }

    /// Appends every record of `other` after this stack's own records.
    pub fn concat(&mut self, other: &ErrorStack) {
        for record in &other.records {
            if self.records.len() >= MAX_ERROR_STACK {
                break;
            }
            self.records.push(record.clone());
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    /// Code of the most significant (top) record; 0 when empty.
    pub fn top_code(&self) -> i32 {
        self.records.first().map(|r| r.code).unwrap_or(0)
    }

    pub fn top_message(&self) -> String {
        self.records
            .first()
            .map(|r| r.message.clone())
            .unwrap_or_default()
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32_be(self.records.len() as u32).await?;
        for record in &self.records {
            writer.write_u32_be(record.kind as u32).await?;
            writer.write_str(&record.location).await?;
            writer.write_i32_be(record.code).await?;
            writer.write_str(&record.message).await?;
        }
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        let count = reader.read_u32_be().await? as usize;
        if count > MAX_ERROR_STACK {
            return Err(UdaError::Protocol(format!(
                "error stack too deep: {count} > {MAX_ERROR_STACK}"
            )));
        }
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = ErrorKind::from_u32(reader.read_u32_be().await?)?;
            let location = reader.read_str().await?;
            let code = reader.read_i32_be().await?;
            let message = reader.read_str().await?;
            if code == 0 {
                // A populated stack must carry a non-zero code in every record.
                return Err(UdaError::Protocol(
                    "error stack record with code 0".to_string(),
                ));
            }
            records.push(ErrorRecord {
                kind,
                location,
                code,
                message,
            });
        }
        Ok(ErrorStack { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_bounded_and_drops_oldest_non_fatal() {
        let mut stack = ErrorStack::new();
        stack.push(ErrorKind::System, "socket", 5, "read failed");
        for i in 0..(MAX_ERROR_STACK as i32 + 10) {
            stack.push(ErrorKind::Plugin, "reader", 100 + i, "bad signal");
        }
        assert_eq!(stack.len(), MAX_ERROR_STACK);
        // The system record survives the overflow purge.
        assert!(stack.records().iter().any(|r| r.kind == ErrorKind::System));
        // Most recent record is most significant.
        assert_eq!(stack.top_code(), 100 + MAX_ERROR_STACK as i32 + 9);
    }

    #[tokio::test]
    async fn stack_round_trips() {
        let mut stack = ErrorStack::new();
        stack.push(ErrorKind::Code, "parser", 3, "bad subset");
        stack.push(ErrorKind::Plugin, "netcdf", 42, "no such group");

        let mut buf = Vec::new();
        stack.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = ErrorStack::read(&mut cursor).await.unwrap();
        assert_eq!(decoded, stack);
    }

    #[tokio::test]
    async fn zero_code_record_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&(ErrorKind::Code as u32).to_be_bytes());
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"here");
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(ErrorStack::read(&mut cursor).await.is_err());
    }
}
