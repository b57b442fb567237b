//! Mutual-authentication step slots. The message ordering (steps 1, 5, 6
//! and 8 between Connecting and Idle) is fixed here; the token contents and
//! their cryptography are supplied by the caller and stay opaque.
//!
//! Steps 1 and 6 ride CLIENT_BLOCK messages with the security slot
//! populated; steps 5 and 8 ride the matching SERVER_BLOCK replies. The
//! security slot is version-gated, so authentication requires a negotiated
//! version of at least `MIN_VERSION_WITH_SECURITY_BLOCK`.

use log::debug;

use crate::errors::{Result, UdaError};
use crate::protocol::{
    expect_header, ClientBlock, ProtocolId, ServerBlock, CLIENT_VERSION,
    MIN_VERSION_WITH_SECURITY_BLOCK,
};
use crate::record::{RecordReader, RecordWriter};

/// Client-side token supplier: claims an identity, answers the server's
/// challenge, and checks the server's proof.
pub trait Authenticator: Send + Sync {
    /// Step 1: the encrypted identity-claim token.
    fn initial_token(&self) -> Vec<u8>;
    /// Step 6: the response to the server's step-5 challenge.
    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>>;
    /// Step 8: verification of the server's proof of identity.
    fn verify(&self, proof: &[u8]) -> Result<()>;
}

/// Server-side counterpart: challenges an identity claim and proves its own.
pub trait ServerAuthenticator: Send + Sync {
    /// Step 5: challenge derived from the client's step-1 claim.
    fn challenge(&self, claim: &[u8]) -> Result<Vec<u8>>;
    /// Step 8 payload: verify the step-6 response and produce the proof.
    fn verify_response(&self, response: &[u8]) -> Result<Vec<u8>>;
}

pub(crate) async fn client_authenticate<R, W>(
    input: &mut RecordReader<R>,
    output: &mut RecordWriter<W>,
    negotiated: u32,
    client_block: &ClientBlock,
    authenticator: &dyn Authenticator,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + Sync + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    if negotiated < MIN_VERSION_WITH_SECURITY_BLOCK {
        return Err(UdaError::Auth(format!(
            "authentication needs protocol version {MIN_VERSION_WITH_SECURITY_BLOCK}, \
             negotiated {negotiated}"
        )));
    }

    // Step 1: identity claim.
    let mut block = client_block.clone();
    block.security_token = authenticator.initial_token();
    block.write(output, negotiated).await?;
    output.end_of_record().await?;

    // Step 5: the server's challenge.
    expect_header(input, ProtocolId::ServerBlock).await?;
    let challenge = ServerBlock::read(input, negotiated).await?;
    input.skip_record().await?;
    if !challenge.error_stack.is_empty() {
        return Err(UdaError::Auth(challenge.error_stack.top_message()));
    }

    // Step 6: prove the claimed identity.
    block.security_token = authenticator.respond(&challenge.security_token)?;
    block.write(output, negotiated).await?;
    output.end_of_record().await?;

    // Step 8: the server proves itself.
    expect_header(input, ProtocolId::ServerBlock).await?;
    let proof = ServerBlock::read(input, negotiated).await?;
    input.skip_record().await?;
    authenticator.verify(&proof.security_token)?;
    debug!("mutual authentication complete");
    Ok(())
}

pub(crate) async fn server_authenticate<R, W>(
    input: &mut RecordReader<R>,
    output: &mut RecordWriter<W>,
    negotiated: u32,
    authenticator: &dyn ServerAuthenticator,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + Sync + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    if negotiated < MIN_VERSION_WITH_SECURITY_BLOCK {
        return Err(UdaError::Auth(format!(
            "authentication needs protocol version {MIN_VERSION_WITH_SECURITY_BLOCK}, \
             negotiated {negotiated}"
        )));
    }

    // Step 1: the client's claim.
    expect_header(input, ProtocolId::ClientBlock).await?;
    let claim = ClientBlock::read(input, negotiated).await?;
    input.skip_record().await?;

    // Step 5: challenge it.
    let mut reply = ServerBlock::new(CLIENT_VERSION);
    reply.security_token = authenticator.challenge(&claim.security_token)?;
    reply.write(output, negotiated).await?;
    output.end_of_record().await?;

    // Step 6: the client's response.
    expect_header(input, ProtocolId::ClientBlock).await?;
    let response = ClientBlock::read(input, negotiated).await?;
    input.skip_record().await?;

    // Step 8: verify and prove ourselves back.
    reply.security_token = authenticator.verify_response(&response.security_token)?;
    reply.write(output, negotiated).await?;
    output.end_of_record().await?;
    debug!("client '{}' authenticated", claim.username);
    Ok(())
}
