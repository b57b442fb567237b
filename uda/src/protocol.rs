use crate::errors::{ErrorStack, Result, UdaError};
use crate::io::{UdaRead, UdaWrite};

/// Version spoken by this build. The negotiated version of a session is the
/// minimum of the client and server versions and gates optional fields.
pub const CLIENT_VERSION: u32 = 9;

/// Oldest peer this build will talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 7;

pub const MIN_VERSION_WITH_DOI: u32 = 7;
pub const MIN_VERSION_WITH_OS_NAME: u32 = 7;
pub const MIN_VERSION_WITH_SECURITY_BLOCK: u32 = 8;
pub const MIN_VERSION_WITH_CACHE_PERMISSION: u32 = 8;
pub const MIN_VERSION_WITH_TOTAL_BLOCK_SIZE: u32 = 9;

pub const MAX_STRING_SIZE: usize = 1 << 30;
pub const MAX_DATA_SIZE: usize = 1 << 30;
pub const MAX_RANK: usize = 8;
pub const MAX_REQUEST_DEPTH: usize = 4;

pub const DEFAULT_PORT: u16 = 56565;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Status floor: a block at MIN_STATUS is flagged unusable unless the client
/// has opted in to bad data.
pub const MIN_STATUS: i32 = -1;
pub const DATA_STATUS_BAD: i32 = -17000;

// Client flag bits carried in ClientBlock.flags.
pub const CLIENTFLAG_ALTDATA: u32 = 1;
pub const CLIENTFLAG_XDRFILE: u32 = 1 << 1;
pub const CLIENTFLAG_CACHE: u32 = 1 << 2;
pub const CLIENTFLAG_CLOSEDOWN: u32 = 1 << 3;
pub const CLIENTFLAG_XDROBJECT: u32 = 1 << 4;
pub const CLIENTFLAG_REUSELASTHANDLE: u32 = 1 << 5;
pub const CLIENTFLAG_FREEREUSELASTHANDLE: u32 = 1 << 6;
pub const CLIENTFLAG_FILECACHE: u32 = 1 << 7;

/// Stable wire contract: one id per message schema.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolId {
    RequestBlock = 1,
    DataBlock = 2,
    NextProtocol = 3,
    DataSystem = 4,
    SystemConfig = 5,
    DataSource = 6,
    Signal = 7,
    SignalDesc = 8,
    ClientBlock = 9,
    ServerBlock = 10,
    PutdataBlockList = 11,
    Meta = 12,
    Structures = 13,
    Efit = 14,
}

impl ProtocolId {
    pub fn from_u32(i: u32) -> Result<Self> {
        Ok(match i {
            1 => ProtocolId::RequestBlock,
            2 => ProtocolId::DataBlock,
            3 => ProtocolId::NextProtocol,
            4 => ProtocolId::DataSystem,
            5 => ProtocolId::SystemConfig,
            6 => ProtocolId::DataSource,
            7 => ProtocolId::Signal,
            8 => ProtocolId::SignalDesc,
            9 => ProtocolId::ClientBlock,
            10 => ProtocolId::ServerBlock,
            11 => ProtocolId::PutdataBlockList,
            12 => ProtocolId::Meta,
            13 => ProtocolId::Structures,
            14 => ProtocolId::Efit,
            x => return Err(UdaError::Protocol(format!("invalid protocol id: {x}"))),
        })
    }
}

/// Writes the `{protocol_id, version}` header every message begins with.
pub async fn write_header<W: UdaWrite>(writer: &mut W, id: ProtocolId, version: u32) -> Result<()> {
    writer.write_u32_be(id as u32).await?;
    writer.write_u32_be(version).await?;
    Ok(())
}

/// Reads and validates a message header, returning the id and the sender's
/// negotiated version.
pub async fn read_header<R: UdaRead>(reader: &mut R) -> Result<(ProtocolId, u32)> {
    let id = ProtocolId::from_u32(reader.read_u32_be().await?)?;
    let version = reader.read_u32_be().await?;
    Ok((id, version))
}

/// Reads a header and insists on a specific message.
pub async fn expect_header<R: UdaRead>(reader: &mut R, want: ProtocolId) -> Result<u32> {
    let (id, version) = read_header(reader).await?;
    if id != want {
        return Err(UdaError::Protocol(format!(
            "unexpected message {id:?}, expected {want:?}"
        )));
    }
    Ok(version)
}

/// The two terminal messages of a request cycle.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextProtocol {
    /// Keep the connection; the server waits for the next request.
    Sleep = 1,
    /// Tear the connection down; the server exits.
    Closedown = 2,
}

impl NextProtocol {
    pub fn from_u32(i: u32) -> Result<Self> {
        Ok(match i {
            1 => NextProtocol::Sleep,
            2 => NextProtocol::Closedown,
            x => return Err(UdaError::Protocol(format!("invalid next-protocol: {x}"))),
        })
    }
}

/// Tag over the closed set of compound payloads a DataBlock may carry.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpaqueType {
    #[default]
    Unknown = 0,
    XmlDocument = 1,
    Structures = 2,
    XdrFile = 3,
    XdrObject = 4,
    Efit = 5,
}

impl OpaqueType {
    pub fn from_u32(i: u32) -> Result<Self> {
        Ok(match i {
            0 => OpaqueType::Unknown,
            1 => OpaqueType::XmlDocument,
            2 => OpaqueType::Structures,
            3 => OpaqueType::XdrFile,
            4 => OpaqueType::XdrObject,
            5 => OpaqueType::Efit,
            x => return Err(UdaError::Protocol(format!("invalid opaque type: {x}"))),
        })
    }
}

/// Per-request client properties, echoed into every issued DataBlock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientProperties {
    pub get_datadble: bool,
    pub get_dimdble: bool,
    pub get_timedble: bool,
    pub get_scalar: bool,
    pub get_bytes: bool,
    pub get_bad: bool,
    pub get_meta: bool,
    pub get_asis: bool,
    pub get_uncal: bool,
    pub get_notoff: bool,
    pub get_nodimdata: bool,
}

impl ClientProperties {
    pub fn to_bits(self) -> u32 {
        let flags = [
            self.get_datadble,
            self.get_dimdble,
            self.get_timedble,
            self.get_scalar,
            self.get_bytes,
            self.get_bad,
            self.get_meta,
            self.get_asis,
            self.get_uncal,
            self.get_notoff,
            self.get_nodimdata,
        ];
        flags
            .iter()
            .enumerate()
            .fold(0, |acc, (i, &set)| if set { acc | (1 << i) } else { acc })
    }

    pub fn from_bits(bits: u32) -> Self {
        ClientProperties {
            get_datadble: bits & (1 << 0) != 0,
            get_dimdble: bits & (1 << 1) != 0,
            get_timedble: bits & (1 << 2) != 0,
            get_scalar: bits & (1 << 3) != 0,
            get_bytes: bits & (1 << 4) != 0,
            get_bad: bits & (1 << 5) != 0,
            get_meta: bits & (1 << 6) != 0,
            get_asis: bits & (1 << 7) != 0,
            get_uncal: bits & (1 << 8) != 0,
            get_notoff: bits & (1 << 9) != 0,
            get_nodimdata: bits & (1 << 10) != 0,
        }
    }
}

/// Client identity and per-session settings, sent ahead of every request and
/// once at startup as the negotiation carrier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientBlock {
    pub version: u32,
    pub flags: u32,
    pub private_flags: u32,
    pub properties: ClientProperties,
    pub alt_rank: i32,
    pub timeout_secs: u32,
    pub username: String,
    pub os_name: String,
    pub doi: String,
    /// Opaque identity-claim token; carrier slot for authentication step 6.
    pub security_token: Vec<u8>,
}

impl ClientBlock {
    pub fn new(version: u32, username: &str) -> Self {
        ClientBlock {
            version,
            timeout_secs: DEFAULT_TIMEOUT_SECS as u32,
            username: username.to_string(),
            ..Default::default()
        }
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::ClientBlock, negotiated).await?;
        writer.write_u32_be(self.version).await?;
        writer.write_u32_be(self.flags).await?;
        writer.write_u32_be(self.private_flags).await?;
        writer.write_u32_be(self.properties.to_bits()).await?;
        writer.write_i32_be(self.alt_rank).await?;
        writer.write_u32_be(self.timeout_secs).await?;
        writer.write_str(&self.username).await?;
        if negotiated >= MIN_VERSION_WITH_OS_NAME {
            writer.write_str(&self.os_name).await?;
        }
        if negotiated >= MIN_VERSION_WITH_DOI {
            writer.write_str(&self.doi).await?;
        }
        if negotiated >= MIN_VERSION_WITH_SECURITY_BLOCK {
            writer.write_bytes(&self.security_token).await?;
        }
        Ok(())
    }

    /// Decodes the body after the header has been consumed.
    pub async fn read<R: UdaRead>(reader: &mut R, negotiated: u32) -> Result<Self> {
        let version = reader.read_u32_be().await?;
        let flags = reader.read_u32_be().await?;
        let private_flags = reader.read_u32_be().await?;
        let properties = ClientProperties::from_bits(reader.read_u32_be().await?);
        let alt_rank = reader.read_i32_be().await?;
        let timeout_secs = reader.read_u32_be().await?;
        let username = reader.read_str().await?;
        let os_name = if negotiated >= MIN_VERSION_WITH_OS_NAME {
            reader.read_str().await?
        } else {
            String::new()
        };
        let doi = if negotiated >= MIN_VERSION_WITH_DOI {
            reader.read_str().await?
        } else {
            String::new()
        };
        let security_token = if negotiated >= MIN_VERSION_WITH_SECURITY_BLOCK {
            reader.read_bytes().await?
        } else {
            Vec::new()
        };
        Ok(ClientBlock {
            version,
            flags,
            private_flags,
            properties,
            alt_rank,
            timeout_secs,
            username,
            os_name,
            doi,
            security_token,
        })
    }
}

/// Server identity and acknowledgement; carries the error stack of the
/// request just served. The carrier slot for authentication step 8.
#[derive(Debug, Clone, Default)]
pub struct ServerBlock {
    pub version: u32,
    pub error_stack: ErrorStack,
    pub doi: String,
    pub os_name: String,
    pub security_token: Vec<u8>,
}

impl ServerBlock {
    pub fn new(version: u32) -> Self {
        ServerBlock {
            version,
            ..Default::default()
        }
    }

    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::ServerBlock, negotiated).await?;
        writer.write_u32_be(self.version).await?;
        self.error_stack.write(writer).await?;
        if negotiated >= MIN_VERSION_WITH_OS_NAME {
            writer.write_str(&self.os_name).await?;
        }
        if negotiated >= MIN_VERSION_WITH_DOI {
            writer.write_str(&self.doi).await?;
        }
        if negotiated >= MIN_VERSION_WITH_SECURITY_BLOCK {
            writer.write_bytes(&self.security_token).await?;
        }
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R, negotiated: u32) -> Result<Self> {
        let version = reader.read_u32_be().await?;
        let error_stack = ErrorStack::read(reader).await?;
        let os_name = if negotiated >= MIN_VERSION_WITH_OS_NAME {
            reader.read_str().await?
        } else {
            String::new()
        };
        let doi = if negotiated >= MIN_VERSION_WITH_DOI {
            reader.read_str().await?
        } else {
            String::new()
        };
        let security_token = if negotiated >= MIN_VERSION_WITH_SECURITY_BLOCK {
            reader.read_bytes().await?
        } else {
            Vec::new()
        };
        Ok(ServerBlock {
            version,
            error_stack,
            doi,
            os_name,
            security_token,
        })
    }
}

/// `min(client, server)`: the field-gating version both sides agree on.
pub fn negotiate(client_version: u32, server_version: u32) -> Result<u32> {
    let negotiated = client_version.min(server_version);
    if negotiated < MIN_PROTOCOL_VERSION {
        return Err(UdaError::Protocol(format!(
            "peer protocol version {negotiated} is older than the supported minimum \
             {MIN_PROTOCOL_VERSION}"
        )));
    }
    Ok(negotiated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_block_round_trips_at_every_version() {
        let mut block = ClientBlock::new(CLIENT_VERSION, "jetto");
        block.flags = CLIENTFLAG_CACHE | CLIENTFLAG_REUSELASTHANDLE;
        block.properties.get_meta = true;
        block.doi = "10.5286/example".to_string();
        block.os_name = "linux".to_string();
        block.security_token = vec![0xAA, 0xBB];

        for negotiated in MIN_PROTOCOL_VERSION..=CLIENT_VERSION {
            let mut buf = Vec::new();
            block.write(&mut buf, negotiated).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let version = expect_header(&mut cursor, ProtocolId::ClientBlock)
                .await
                .unwrap();
            assert_eq!(version, negotiated);
            let decoded = ClientBlock::read(&mut cursor, negotiated).await.unwrap();
            assert_eq!(decoded.username, "jetto");
            assert_eq!(decoded.properties, block.properties);
            if negotiated >= MIN_VERSION_WITH_SECURITY_BLOCK {
                assert_eq!(decoded.security_token, block.security_token);
            } else {
                assert!(decoded.security_token.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn server_block_carries_the_error_stack() {
        use crate::errors::ErrorKind;

        let mut block = ServerBlock::new(CLIENT_VERSION);
        block.doi = "10.5286/server".to_string();
        block
            .error_stack
            .push(ErrorKind::Plugin, "netcdf", 42, "no such group");

        let mut buf = Vec::new();
        block.write(&mut buf, CLIENT_VERSION).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        expect_header(&mut cursor, ProtocolId::ServerBlock)
            .await
            .unwrap();
        let decoded = ServerBlock::read(&mut cursor, CLIENT_VERSION).await.unwrap();
        assert_eq!(decoded.doi, block.doi);
        assert_eq!(decoded.error_stack, block.error_stack);
        assert_eq!(decoded.error_stack.top_code(), 42);
    }

    #[test]
    fn negotiation_takes_the_minimum() {
        assert_eq!(negotiate(9, 7).unwrap(), 7);
        assert_eq!(negotiate(7, 9).unwrap(), 7);
        assert!(negotiate(9, 6).is_err());
    }

    #[test]
    fn property_bits_round_trip() {
        let mut props = ClientProperties::default();
        props.get_scalar = true;
        props.get_nodimdata = true;
        assert_eq!(ClientProperties::from_bits(props.to_bits()), props);
    }
}
