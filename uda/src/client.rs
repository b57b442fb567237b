use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::block::{DataBlock, OpaqueBlock};
use crate::environment::Environment;
use crate::errors::{ErrorKind, ErrorStack, Result, UdaError};
use crate::handles::{Handle, HandleTable};
use crate::io::{UdaRead, UdaWrite};
use crate::metadata::{DataSource, DataSystem, MetadataBlocks, SignalDesc, SignalRec, SystemConfig};
use crate::parser::make_request_block;
use crate::plugins::PluginRegistry;
use crate::protocol::{
    expect_header, negotiate, read_header, write_header, ClientBlock, ClientProperties,
    NextProtocol, OpaqueType, ProtocolId, ServerBlock, CLIENTFLAG_CACHE, CLIENTFLAG_CLOSEDOWN,
    CLIENT_VERSION, DATA_STATUS_BAD, MIN_PROTOCOL_VERSION, MIN_STATUS,
};
use crate::record::{RecordReader, RecordWriter};
use crate::request::{PutDataBlockList, RequestBlock};
use crate::session::{SessionEvent, SessionState};
use crate::structured::GeneralBlock;

type ClientReader = RecordReader<BufReader<OwnedReadHalf>>;
type ClientWriter = RecordWriter<BufWriter<OwnedWriteHalf>>;

/// One open server connection with its negotiated version and age clock.
pub(crate) struct Connection {
    pub(crate) input: ClientReader,
    pub(crate) output: ClientWriter,
    pub(crate) negotiated: u32,
    pub(crate) state: SessionState,
    last_activity: Instant,
    timeout: Duration,
}

impl Connection {
    /// Opens the socket and performs the startup exchange. The first
    /// CLIENT_BLOCK/SERVER_BLOCK pair is encoded at the floor version every
    /// peer understands; everything after uses the negotiated version.
    async fn open(host: &str, port: u16, client_block: &ClientBlock) -> Result<Connection> {
        let timeout = Duration::from_secs(client_block.timeout_secs as u64);
        let stream = with_timeout(timeout, TcpStream::connect((host, port))).await??;
        let (read, write) = stream.into_split();
        let mut conn = Connection {
            input: RecordReader::new(BufReader::new(read)),
            output: RecordWriter::new(BufWriter::new(write)),
            negotiated: MIN_PROTOCOL_VERSION,
            state: SessionState::Closed.step(SessionEvent::Connect)?,
            last_activity: Instant::now(),
            timeout,
        };

        client_block
            .write(&mut conn.output, MIN_PROTOCOL_VERSION)
            .await?;
        conn.output.end_of_record().await?;

        let server_block = with_timeout(timeout, async {
            expect_header(&mut conn.input, ProtocolId::ServerBlock).await?;
            let block = ServerBlock::read(&mut conn.input, MIN_PROTOCOL_VERSION).await?;
            conn.input.skip_record().await?;
            Ok::<_, UdaError>(block)
        })
        .await??;

        conn.negotiated = negotiate(client_block.version, server_block.version)?;
        debug!(
            "connected to {host}:{port}, negotiated version {}",
            conn.negotiated
        );
        if !server_block.error_stack.is_empty() {
            return Err(UdaError::ServerSide(server_block.error_stack));
        }
        Ok(conn)
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True once the server is assumed to have self-destructed: its age
    /// clock runs out two seconds ahead of the shared timeout.
    fn expired(&self) -> bool {
        self.last_activity.elapsed() + Duration::from_secs(2) >= self.timeout
    }
}

async fn with_timeout<F: std::future::Future>(limit: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        UdaError::System(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "the peer did not respond within the shared timeout",
        ))
    })
}

/// The result of one request exchange: the data block, any metadata, and the
/// server's error stack for the request.
struct Outcome {
    block: DataBlock,
    metadata: Option<MetadataBlocks>,
    stack: ErrorStack,
}

fn login_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Handle-based client for one or more UDA servers. Requests are strictly
/// sequential; results are held in the process-local handle table until
/// freed.
pub struct Client {
    environment: Environment,
    registry: PluginRegistry,
    handles: HandleTable,
    client_block: ClientBlock,
    host: String,
    port: u16,
    connection: Option<Connection>,
    /// Idle connections to other servers, keyed by (host, port).
    saved: HashMap<(String, u16), Connection>,
    error_stack: ErrorStack,
    #[cfg(feature = "cache")]
    cache: crate::cache::ResultCache,
    #[cfg(feature = "auth")]
    authenticator: Option<Box<dyn crate::auth::Authenticator>>,
}

impl Client {
    /// A client configured from the process environment.
    pub fn new() -> Self {
        Self::with_environment(Environment::capture())
    }

    pub fn with_environment(environment: Environment) -> Self {
        let mut client_block = ClientBlock::new(CLIENT_VERSION, &login_name());
        client_block.flags = environment.client_flags;
        client_block.private_flags = environment.private_flags;
        client_block.timeout_secs = environment.timeout_secs as u32;
        client_block.doi = environment.client_doi.clone();
        client_block.os_name = environment.os_name.clone();
        if environment.enable_cache {
            client_block.flags |= CLIENTFLAG_CACHE;
        }
        Client {
            host: environment.host.clone(),
            port: environment.port,
            environment,
            registry: PluginRegistry::with_builtins(),
            handles: HandleTable::new(),
            client_block,
            connection: None,
            saved: HashMap::new(),
            error_stack: ErrorStack::new(),
            #[cfg(feature = "cache")]
            cache: crate::cache::ResultCache::new(),
            #[cfg(feature = "auth")]
            authenticator: None,
        }
    }

    /// The format/device registry consulted by the request parser.
    pub fn registry_mut(&mut self) -> &mut PluginRegistry {
        &mut self.registry
    }

    #[cfg(feature = "auth")]
    pub fn set_authenticator(&mut self, authenticator: Box<dyn crate::auth::Authenticator>) {
        self.authenticator = Some(authenticator);
    }

    /// Issues a read request and returns the handle of the result block.
    /// The handle is always inspectable, including after a server-side
    /// failure.
    pub async fn get(&mut self, signal: &str, source: &str) -> Result<Handle> {
        let request = make_request_block(signal, source, &self.registry, &self.environment)?;
        self.fetch(request).await
    }

    /// Sends payload data to a server-side plugin named by the instruction.
    pub async fn put(&mut self, instruction: &str, data: PutDataBlockList) -> Result<Handle> {
        let mut request = make_request_block(instruction, "", &self.registry, &self.environment)?;
        request.put = true;
        request.put_data = data;
        self.fetch(request).await
    }

    async fn fetch(&mut self, request: RequestBlock) -> Result<Handle> {
        self.error_stack.clear();

        #[cfg(feature = "cache")]
        {
            match self.cache_lookup(&request).await? {
                CacheState::Hit(block) => return self.issue(block, None, ErrorStack::new()),
                claim => {
                    let result = self.exchange(&request).await;
                    let result = self.cache_settle(claim, result).await;
                    return self.settle(result);
                }
            }
        }

        #[cfg(not(feature = "cache"))]
        {
            let result = self.exchange(&request).await;
            self.settle(result)
        }
    }

    fn settle(&mut self, result: Result<Outcome>) -> Result<Handle> {
        match result {
            Ok(outcome) => self.issue(outcome.block, outcome.metadata, outcome.stack),
            Err(UdaError::ServerSide(stack)) => {
                // Benign: the server sleeps and the socket survives. A handle
                // is still issued so the failure is inspectable.
                self.issue(DataBlock::new(), None, stack)
            }
            Err(e) => {
                // Protocol and system failures are fatal for the connection.
                error!("request failed: {e}");
                self.drop_connection();
                Err(e)
            }
        }
    }

    /// Materialises a completed (or failed) result as a fresh handle.
    fn issue(
        &mut self,
        mut block: DataBlock,
        metadata: Option<MetadataBlocks>,
        stack: ErrorStack,
    ) -> Result<Handle> {
        block.properties = self.client_block.properties;
        block.metadata = metadata.map(Box::new);

        self.error_stack.concat(&stack);

        // The stack wins: its top entry is copied into the block so code
        // paths that only inspect the block still see the failure.
        if block.errcode == 0 && !stack.is_empty() {
            block.errcode = stack.top_code();
            block.error_msg = stack.top_message();
        }

        if block.errcode == 0
            && block.status() == MIN_STATUS
            && !self.client_block.properties.get_bad
        {
            self.error_stack.push(
                ErrorKind::Code,
                "client",
                DATA_STATUS_BAD,
                "data status is bad: data are not usable",
            );
            block.errcode = DATA_STATUS_BAD;
            block.error_msg = "data status is bad: data are not usable".to_string();
        }

        let handle = self.handles.acquire(self.client_block.flags);
        self.handles.store(handle, block)?;
        Ok(handle)
    }

    async fn exchange(&mut self, request: &RequestBlock) -> Result<Outcome> {
        self.ensure_connection().await?;
        let client_block = self.client_block.clone();
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| UdaError::Protocol("no open connection".to_string()))?;

        conn.state = conn.state.step(SessionEvent::BeginRequest)?;
        client_block.write(&mut conn.output, conn.negotiated).await?;
        request.write(&mut conn.output, conn.negotiated).await?;
        if request.put {
            request
                .put_data
                .write(&mut conn.output, conn.negotiated)
                .await?;
        }
        conn.output.end_of_record().await?;
        conn.state = conn.state.step(SessionEvent::AwaitReply)?;
        trace!("request flushed, waiting for the server");

        let want_meta = client_block.properties.get_meta && !request.put;
        let timeout = conn.timeout;
        let outcome = with_timeout(timeout, Self::receive(conn, want_meta)).await??;

        // The cycle completed: let the server sleep and restart its age
        // clock.
        write_header(&mut conn.output, ProtocolId::NextProtocol, conn.negotiated).await?;
        conn.output.write_u32_be(NextProtocol::Sleep as u32).await?;
        conn.output.end_of_record().await?;
        conn.state = conn.state.step(SessionEvent::Sleep)?;
        conn.touch();

        if !outcome.stack.is_empty() {
            // Server-side failure: report through the issued handle but keep
            // the expensive socket alive.
            debug!("server-side failure: {}", outcome.stack.top_message());
        }
        Ok(outcome)
    }

    async fn receive(conn: &mut Connection, want_meta: bool) -> Result<Outcome> {
        let negotiated = conn.negotiated;

        expect_header(&mut conn.input, ProtocolId::ServerBlock).await?;
        let server_block = ServerBlock::read(&mut conn.input, negotiated).await?;
        let failed = !server_block.error_stack.is_empty();

        let mut metadata = None;
        if want_meta && !failed {
            conn.state = conn.state.step(SessionEvent::Metadata)?;
            expect_header(&mut conn.input, ProtocolId::DataSystem).await?;
            let data_system = DataSystem::read(&mut conn.input).await?;
            expect_header(&mut conn.input, ProtocolId::SystemConfig).await?;
            let system_config = SystemConfig::read(&mut conn.input).await?;
            expect_header(&mut conn.input, ProtocolId::DataSource).await?;
            let data_source = DataSource::read(&mut conn.input).await?;
            expect_header(&mut conn.input, ProtocolId::Signal).await?;
            let signal_rec = SignalRec::read(&mut conn.input).await?;
            expect_header(&mut conn.input, ProtocolId::SignalDesc).await?;
            let signal_desc = SignalDesc::read(&mut conn.input).await?;
            metadata = Some(MetadataBlocks {
                data_system,
                system_config,
                data_source,
                signal_rec,
                signal_desc,
            });
        }

        expect_header(&mut conn.input, ProtocolId::DataBlock).await?;
        let (mut block, opaque_type) = DataBlock::read(&mut conn.input, negotiated).await?;
        conn.state = conn.state.step(SessionEvent::Data)?;

        if block.data_type == crate::block::AtomicType::Compound
            && opaque_type != OpaqueType::Unknown
        {
            conn.state = conn.state.step(SessionEvent::Structures)?;
            let (id, _version) = read_header(&mut conn.input).await?;
            block.opaque = match (opaque_type, id) {
                (OpaqueType::XmlDocument, ProtocolId::Meta) => {
                    OpaqueBlock::XmlDocument(conn.input.read_str().await?)
                }
                (OpaqueType::Structures, ProtocolId::Structures) => {
                    OpaqueBlock::Structures(GeneralBlock::read(&mut conn.input).await?)
                }
                (OpaqueType::XdrFile, ProtocolId::Structures) => {
                    OpaqueBlock::XdrFile(conn.input.read_bytes().await?)
                }
                (OpaqueType::XdrObject, ProtocolId::Structures) => {
                    OpaqueBlock::XdrObject(conn.input.read_bytes().await?)
                }
                (OpaqueType::Efit, ProtocolId::Efit) => {
                    OpaqueBlock::Efit(GeneralBlock::read(&mut conn.input).await?)
                }
                (opaque, id) => {
                    return Err(UdaError::Protocol(format!(
                        "opaque payload {id:?} does not match announced type {opaque:?}"
                    )))
                }
            };
        }

        conn.state = conn.state.step(SessionEvent::Finish)?;
        conn.input.skip_record().await?;

        Ok(Outcome {
            block,
            metadata,
            stack: server_block.error_stack,
        })
    }

    async fn ensure_connection(&mut self) -> Result<()> {
        if let Some(conn) = &self.connection {
            if conn.expired() {
                debug!("server age limit reached, reconnecting");
                self.connection = None;
            }
        }
        if self.connection.is_none() {
            #[allow(unused_mut)]
            let mut conn = Connection::open(&self.host, self.port, &self.client_block).await?;
            #[cfg(feature = "auth")]
            if let Some(authenticator) = &self.authenticator {
                conn.state = conn.state.step(SessionEvent::BeginAuth)?;
                crate::auth::client_authenticate(
                    &mut conn.input,
                    &mut conn.output,
                    conn.negotiated,
                    &self.client_block,
                    authenticator.as_ref(),
                )
                .await?;
            }
            conn.state = conn.state.step(SessionEvent::Establish)?;
            self.connection = Some(conn);
        }
        Ok(())
    }

    /// Switches to a different server. The current connection is parked in
    /// the socket registry and restored on a later switch back.
    pub fn set_server(&mut self, host: &str, port: u16) {
        if host == self.host && port == self.port {
            return;
        }
        if let Some(conn) = self.connection.take() {
            self.saved.insert((self.host.clone(), self.port), conn);
        }
        self.connection = self.saved.remove(&(host.to_string(), port));
        self.host = host.to_string();
        self.port = port;
        debug!("switched to server {host}:{port}");
    }

    fn drop_connection(&mut self) {
        self.connection = None;
    }

    /// Sends an orderly closedown on every open connection and drops them.
    pub async fn disconnect(&mut self) {
        let mut client_block = self.client_block.clone();
        client_block.flags |= CLIENTFLAG_CLOSEDOWN;
        let saved = std::mem::take(&mut self.saved);
        for (_, mut conn) in self
            .connection
            .take()
            .map(|c| ((self.host.clone(), self.port), c))
            .into_iter()
            .chain(saved)
        {
            if client_block.write(&mut conn.output, conn.negotiated).await.is_ok() {
                let _ = conn.output.end_of_record().await;
            }
        }
    }

    pub fn free(&mut self, handle: Handle) {
        self.handles.free(handle);
    }

    /// Frees every handle and closes every connection.
    pub async fn free_all(&mut self) {
        self.handles.free_all();
        self.disconnect().await;
    }

    pub fn block(&self, handle: Handle) -> Result<&DataBlock> {
        self.handles.get(handle)
    }

    pub fn status_of(&self, handle: Handle) -> Result<i32> {
        Ok(self.handles.get(handle)?.status())
    }

    pub fn error_of(&self, handle: Handle) -> Result<(i32, String)> {
        let block = self.handles.get(handle)?;
        Ok((block.errcode, block.error_msg.clone()))
    }

    pub fn rank_of(&self, handle: Handle) -> Result<u32> {
        Ok(self.handles.get(handle)?.rank)
    }

    pub fn label_of(&self, handle: Handle) -> Result<String> {
        Ok(self.handles.get(handle)?.data_label.clone())
    }

    pub fn units_of(&self, handle: Handle) -> Result<String> {
        Ok(self.handles.get(handle)?.data_units.clone())
    }

    /// The client-side error stack accumulated over the last request.
    pub fn error_stack(&self) -> &ErrorStack {
        &self.error_stack
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.client_block.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.client_block.flags &= !flag;
    }

    pub fn flags(&self) -> u32 {
        self.client_block.flags
    }

    /// Sets a named client property carried to the server with each request.
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        let props = &mut self.client_block.properties;
        let on = matches!(value, "1" | "true" | "yes" | "on");
        match key {
            "get_datadble" => props.get_datadble = on,
            "get_dimdble" => props.get_dimdble = on,
            "get_timedble" => props.get_timedble = on,
            "get_scalar" => props.get_scalar = on,
            "get_bytes" => props.get_bytes = on,
            "get_bad" => props.get_bad = on,
            "get_meta" => props.get_meta = on,
            "get_asis" => props.get_asis = on,
            "get_uncal" => props.get_uncal = on,
            "get_notoff" => props.get_notoff = on,
            "get_nodimdata" => props.get_nodimdata = on,
            "alt_rank" => {
                self.client_block.alt_rank = value.parse().map_err(|_| {
                    UdaError::Protocol(format!("alt_rank wants an integer, got '{value}'"))
                })?
            }
            "timeout" => {
                self.client_block.timeout_secs = value.parse().map_err(|_| {
                    UdaError::Protocol(format!("timeout wants seconds, got '{value}'"))
                })?
            }
            other => {
                return Err(UdaError::Protocol(format!("unknown property '{other}'")));
            }
        }
        Ok(())
    }

    pub fn properties(&self) -> &ClientProperties {
        &self.client_block.properties
    }

    #[cfg(feature = "cache")]
    async fn cache_lookup(&mut self, request: &RequestBlock) -> Result<CacheState> {
        use crate::cache::ResultCache;
        if self.client_block.flags & CLIENTFLAG_CACHE == 0 || request.put {
            return Ok(CacheState::Bypass);
        }
        let fingerprint = ResultCache::fingerprint(request);
        if let Some(block) = self.cache.lookup(fingerprint).await? {
            return Ok(CacheState::Hit(block));
        }
        match self.cache.begin(fingerprint) {
            Ok(()) => Ok(CacheState::Claimed(fingerprint)),
            // Someone is already materialising this fingerprint: fall
            // through to the server without caching.
            Err(UdaError::CacheBusy) => Ok(CacheState::Bypass),
            Err(e) => Err(e),
        }
    }

    #[cfg(feature = "cache")]
    async fn cache_settle(
        &mut self,
        claim: CacheState,
        result: Result<Outcome>,
    ) -> Result<Outcome> {
        if let CacheState::Claimed(fingerprint) = claim {
            if let Ok(outcome) = &result {
                if outcome.stack.is_empty() && outcome.block.errcode == 0 {
                    self.cache.store(fingerprint, &outcome.block).await?;
                }
            }
            self.cache.end(fingerprint);
        }
        result
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cache")]
enum CacheState {
    Bypass,
    Claimed(u128),
    Hit(DataBlock),
}
