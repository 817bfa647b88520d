//! Drives the authentication state machine over a byte stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use protocol::{
    AuthState, AuthStep, Authenticator, ConnectionParams, CredentialStore, HandshakeOptions,
    PacketCodec, ProtocolError,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;

use super::write_packet;
use crate::error::{ClientError, Result};

/// Runs the Connect/Auth exchange until the daemon accepts the connection.
///
/// Stored keys are tried in order; when every key is rejected the first one
/// (or a freshly generated one) is offered and the daemon may prompt the
/// user. The whole exchange is bounded by `timeout`.
///
/// On success the decoder in `framed` is still the handshake codec; callers
/// replace it with [`PacketCodec::new`] for the negotiated parameters.
pub async fn perform_handshake<R, W>(
    framed: &mut FramedRead<R, PacketCodec>,
    writer: &mut W,
    store: Arc<dyn CredentialStore>,
    options: HandshakeOptions,
    timeout: Duration,
) -> Result<ConnectionParams>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let keys = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.keys())
            .await
            .map_err(|e| ClientError::Credentials(format!("key loading task failed: {e}")))??
    };
    tracing::debug!(keys = keys.len(), "Starting handshake");

    let mut auth = Authenticator::new(options, keys);
    let connect = auth.connect_packet()?;
    write_packet(writer, &connect).await?;

    let outcome = tokio::time::timeout(timeout, exchange(&mut auth, framed, writer, store)).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::AuthenticationRejected(format!(
            "no answer from device within {timeout:?} (state {:?})",
            auth.state()
        ))
        .into()),
    }
}

async fn exchange<R, W>(
    auth: &mut Authenticator,
    framed: &mut FramedRead<R, PacketCodec>,
    writer: &mut W,
    store: Arc<dyn CredentialStore>,
) -> Result<ConnectionParams>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let packet = match framed.next().await {
            Some(packet) => packet?,
            None => {
                let err = if auth.state() == AuthState::PublicKeyOffered {
                    ProtocolError::AuthenticationRejected(
                        "device closed the connection after the key offer".to_string(),
                    )
                } else {
                    ProtocolError::ConnectionClosed("device closed the connection during handshake".to_string())
                };
                return Err(err.into());
            }
        };

        match auth.on_packet(&packet)? {
            AuthStep::Send(reply) => write_packet(writer, &reply).await?,
            AuthStep::Wait => {}
            AuthStep::NeedKey => {
                tracing::info!("No stored key was accepted, generating a new key");
                let store = Arc::clone(&store);
                let key = tokio::task::spawn_blocking(move || store.generate_key())
                    .await
                    .map_err(|e| {
                        ClientError::Credentials(format!("key generation task failed: {e}"))
                    })??;
                let offer = auth.offer_generated_key(key)?;
                write_packet(writer, &offer).await?;
            }
            AuthStep::Authenticated(params) => return Ok(params),
        }
    }
}
