use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace};
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::block::{AtomicType, DataBlock, OpaqueBlock};
use crate::environment::Environment;
use crate::errors::{ErrorKind, ErrorStack, Result, UdaError};
use crate::io::{UdaRead, UdaWrite};
use crate::metadata::{DataSource, DataSystem, SignalDesc, SignalRec, SystemConfig};
use crate::plugins::{PluginInterface, PluginRegistry};
use crate::protocol::{
    expect_header, negotiate, write_header, ClientBlock, NextProtocol, ProtocolId, ServerBlock,
    CLIENTFLAG_CLOSEDOWN, CLIENT_VERSION, MIN_PROTOCOL_VERSION,
};
use crate::record::{RecordReader, RecordWriter};
use crate::request::{PutDataBlockList, RequestBlock};
use crate::session::{SessionEvent, SessionState};
use crate::structured::UserDefinedTypeList;

type ServerReader = RecordReader<BufReader<OwnedReadHalf>>;
type ServerWriter = RecordWriter<BufWriter<OwnedWriteHalf>>;

/// One-connection-per-worker server. Each accepted connection runs its own
/// session to completion; no state is shared across connections beyond the
/// registry and environment.
pub struct Server {
    context: ConnectionContext,
}

/// Everything a connection worker shares with the accept loop.
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<PluginRegistry>,
    environment: Arc<Environment>,
    #[cfg(feature = "auth")]
    authenticator: Option<Arc<dyn crate::auth::ServerAuthenticator>>,
}

impl Server {
    pub fn new(registry: PluginRegistry, environment: Environment) -> Self {
        Server {
            context: ConnectionContext {
                registry: Arc::new(registry),
                environment: Arc::new(environment),
                #[cfg(feature = "auth")]
                authenticator: None,
            },
        }
    }

    #[cfg(feature = "auth")]
    pub fn set_authenticator(
        &mut self,
        authenticator: Arc<dyn crate::auth::ServerAuthenticator>,
    ) {
        self.context.authenticator = Some(authenticator);
    }

    /// Binds and serves forever.
    pub async fn listen<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept loop over an existing listener. Each connection gets its own
    /// task; a worker failure never takes the accept loop down.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("serving on {:?}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let context = self.context.clone();
            tokio::spawn(async move {
                debug!("connection accepted from {peer}");
                match handle_connection(stream, context).await {
                    Ok(()) => debug!("connection {peer} closed"),
                    Err(e) if is_disconnect(&e) => debug!("connection {peer} dropped: {e}"),
                    Err(e) => error!("connection {peer} failed: {e}"),
                }
            });
        }
    }
}

fn is_disconnect(error: &UdaError) -> bool {
    matches!(
        error,
        UdaError::System(e) if matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        )
    )
}

async fn handle_connection(stream: TcpStream, context: ConnectionContext) -> Result<()> {
    #[cfg(feature = "auth")]
    let authenticator = context.authenticator.clone();
    let registry = context.registry;
    let environment = context.environment;
    let (read, write) = stream.into_split();
    let mut input: ServerReader = RecordReader::new(BufReader::new(read));
    let mut output: ServerWriter = RecordWriter::new(BufWriter::new(write));
    let mut state = SessionState::Closed.step(SessionEvent::Connect)?;
    let timeout = Duration::from_secs(environment.timeout_secs);

    // Startup exchange at the floor version: learn the peer, answer with our
    // own identity, and agree on the gating version.
    expect_header(&mut input, ProtocolId::ClientBlock).await?;
    let hello = ClientBlock::read(&mut input, MIN_PROTOCOL_VERSION).await?;
    input.skip_record().await?;

    let negotiated = match negotiate(hello.version, CLIENT_VERSION) {
        Ok(v) => v,
        Err(e) => {
            let mut server_block = ServerBlock::new(CLIENT_VERSION);
            server_block
                .error_stack
                .push(ErrorKind::Code, "handshake", 999, &e.to_string());
            server_block.write(&mut output, MIN_PROTOCOL_VERSION).await?;
            output.end_of_record().await?;
            return Ok(());
        }
    };
    let mut server_block = ServerBlock::new(CLIENT_VERSION);
    server_block.os_name = std::env::consts::OS.to_string();
    server_block.write(&mut output, MIN_PROTOCOL_VERSION).await?;
    output.end_of_record().await?;
    debug!(
        "startup exchange with '{}' complete, negotiated version {negotiated}",
        hello.username
    );

    #[cfg(feature = "auth")]
    if let Some(authenticator) = &authenticator {
        state = state.step(SessionEvent::BeginAuth)?;
        crate::auth::server_authenticate(&mut input, &mut output, negotiated, authenticator.as_ref())
            .await?;
    }
    state = state.step(SessionEvent::Establish)?;

    loop {
        // Wait for the next request. An idle client past the shared timeout
        // means this worker self-destructs; the client knows to reconnect.
        let client_block = match tokio::time::timeout(timeout, async {
            expect_header(&mut input, ProtocolId::ClientBlock).await?;
            ClientBlock::read(&mut input, negotiated).await
        })
        .await
        {
            Ok(block) => block?,
            Err(_) => {
                debug!("idle past the shared timeout, closing down");
                break;
            }
        };

        if client_block.flags & CLIENTFLAG_CLOSEDOWN != 0 {
            debug!("closedown instruction received");
            break;
        }

        state = state.step(SessionEvent::BeginRequest)?;
        expect_header(&mut input, ProtocolId::RequestBlock).await?;
        let mut request = RequestBlock::read(&mut input).await?;
        if request.put {
            expect_header(&mut input, ProtocolId::PutdataBlockList).await?;
            request.put_data = PutDataBlockList::read(&mut input).await?;
        }
        input.skip_record().await?;
        state = state.step(SessionEvent::AwaitReply)?;
        trace!("request received: {:?} '{}'", request.kind, request.signal);

        let (block, stack, data_source, signal_desc) =
            serve_request(&registry, &environment, &request);

        // The stack is serialised into SERVER_BLOCK and reset at the request
        // boundary; the connection survives a server-side failure.
        let mut server_block = ServerBlock::new(CLIENT_VERSION);
        server_block.error_stack = stack;
        server_block.write(&mut output, negotiated).await?;
        let failed = !server_block.error_stack.is_empty();

        if client_block.properties.get_meta && !request.put && !failed {
            state = state.step(SessionEvent::Metadata)?;
            let data_system = DataSystem {
                device_name: request.device.clone(),
                system_name: environment.default_device.clone(),
                ..Default::default()
            };
            let system_config = SystemConfig::default();
            let signal_rec = SignalRec {
                status: block.signal_status,
                ..Default::default()
            };
            data_system.write(&mut output, negotiated).await?;
            system_config.write(&mut output, negotiated).await?;
            data_source.write(&mut output, negotiated).await?;
            signal_rec.write(&mut output, negotiated).await?;
            signal_desc.write(&mut output, negotiated).await?;
        }

        block.write(&mut output, negotiated).await?;
        state = state.step(SessionEvent::Data)?;
        match &block.opaque {
            OpaqueBlock::None => {}
            OpaqueBlock::XmlDocument(xml) => {
                state = state.step(SessionEvent::Structures)?;
                write_header(&mut output, ProtocolId::Meta, negotiated).await?;
                output.write_str(xml).await?;
            }
            OpaqueBlock::Structures(tree) => {
                state = state.step(SessionEvent::Structures)?;
                tree.write(&mut output, negotiated, ProtocolId::Structures)
                    .await?;
            }
            OpaqueBlock::XdrFile(bytes) | OpaqueBlock::XdrObject(bytes) => {
                state = state.step(SessionEvent::Structures)?;
                write_header(&mut output, ProtocolId::Structures, negotiated).await?;
                output.write_bytes(bytes).await?;
            }
            OpaqueBlock::Efit(tree) => {
                state = state.step(SessionEvent::Structures)?;
                tree.write(&mut output, negotiated, ProtocolId::Efit).await?;
            }
        }
        output.end_of_record().await?;
        state = state.step(SessionEvent::Finish)?;
        // The server-side result is released here, at the end of the
        // request: `block` and the type registry drop with this scope.

        let next = tokio::time::timeout(timeout, async {
            expect_header(&mut input, ProtocolId::NextProtocol).await?;
            NextProtocol::from_u32(input.read_u32_be().await?)
        })
        .await;
        let next = match next {
            Ok(next) => next?,
            Err(_) => {
                debug!("no next-protocol instruction within the timeout");
                break;
            }
        };
        input.skip_record().await?;
        match next {
            NextProtocol::Sleep => {
                state = state.step(SessionEvent::Sleep)?;
                trace!("sleeping until the next request");
            }
            NextProtocol::Closedown => break,
        }
    }
    Ok(())
}

/// Dispatches one request and folds any failure into the error stack. A
/// failed request still yields a drainable DataBlock carrying the stack top.
fn serve_request(
    registry: &PluginRegistry,
    environment: &Environment,
    request: &RequestBlock,
) -> (DataBlock, ErrorStack, DataSource, SignalDesc) {
    let mut stack = ErrorStack::new();
    let mut block = DataBlock::new();
    let mut types = UserDefinedTypeList::new();

    let data_source = DataSource {
        exp_number: request.exp_number,
        pass: request.pass,
        source_alias: request.device.clone(),
        format: request.format.clone(),
        filename: request.file.clone(),
        path: request.path.clone(),
        ..Default::default()
    };
    let signal_desc = SignalDesc {
        signal_name: request.signal.clone(),
        signal_alias: request.archive.clone(),
        ..Default::default()
    };

    let mut iface = PluginInterface {
        request,
        data_source: &data_source,
        signal_desc: &signal_desc,
        data_block: &mut block,
        types: &mut types,
        environment,
        plugins: registry.descriptors(),
    };

    match registry.dispatch(&mut iface) {
        Ok(()) => {
            if let Err(e) = block.validate_shape() {
                stack.push(ErrorKind::Code, "server", e.code(), &e.to_string());
            }
        }
        Err(e) => {
            let kind = match &e {
                UdaError::Plugin { .. } => ErrorKind::Plugin,
                UdaError::System(_) => ErrorKind::System,
                _ => ErrorKind::Code,
            };
            stack.push(kind, "dispatch", e.code(), &e.to_string());
        }
    }

    if !stack.is_empty() {
        block = DataBlock::new();
        block.errcode = stack.top_code();
        block.error_msg = stack.top_message();
    } else if block.opaque != OpaqueBlock::None {
        // Compound payloads are announced through the data type tag.
        block.data_type = AtomicType::Compound;
    }
    (block, stack, data_source, signal_desc)
}
