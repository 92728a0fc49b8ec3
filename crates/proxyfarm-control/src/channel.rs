//! Framed control channel over any byte stream

use futures::{SinkExt, StreamExt};
use proxyfarm_proto::{ControlCodec, ControlMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{ControlError, SessionError};
use crate::session::{ControlSession, SessionOutput};

/// Length-delimited JSON control messages over a stream
pub struct ControlChannel<T> {
    framed: Framed<T, ControlCodec>,
}

impl<T> ControlChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, ControlCodec::new()),
        }
    }

    pub async fn send(&mut self, msg: ControlMessage) -> Result<(), ControlError> {
        self.framed.send(msg).await?;
        Ok(())
    }

    /// Next message, or `None` once the peer closed the stream
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>, ControlError> {
        match self.framed.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Drive `session` from DISCONNECTED to ACTIVE.
    ///
    /// Bounded by the session's handshake timeout. On any failure the session
    /// is disconnected, dropping its nonces.
    pub async fn handshake(&mut self, session: &mut ControlSession) -> Result<(), ControlError> {
        let timeout = session.config().handshake_timeout;

        match tokio::time::timeout(timeout, self.run_handshake(session)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                session.disconnect();
                Err(e)
            }
            Err(_) => {
                warn!(
                    agent_id = %session.agent_id(),
                    "Handshake timed out after {}s",
                    timeout.as_secs_f32()
                );
                session.disconnect();
                Err(ControlError::HandshakeTimeout)
            }
        }
    }

    async fn run_handshake(&mut self, session: &mut ControlSession) -> Result<(), ControlError> {
        if let Some(init) = session.start()? {
            self.send(init).await?;
        }

        loop {
            let msg = self.recv().await?.ok_or(ControlError::ConnectionClosed)?;

            match session.handle(msg) {
                Ok(SessionOutput::Activated { reply }) => {
                    if let Some(reply) = reply {
                        self.send(reply).await?;
                    }
                    return Ok(());
                }
                Ok(_) | Err(SessionError::NotActive) => {
                    debug!(agent_id = %session.agent_id(), "Dropped message during handshake");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
