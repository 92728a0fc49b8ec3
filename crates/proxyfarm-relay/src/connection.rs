//! One client/upstream connection pair

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::activity::ByteCounters;
use crate::error::RelayError;
use crate::sniff::sniff_hostname;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const BUFFER_SIZE: usize = 8192;

/// Outcome of a finished relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes: ByteCounters,
    pub hostname_guess: Option<String>,
}

/// Dial `target` and relay bytes with `client` until either side ends or
/// `cancel` fires. Both sockets are closed on return.
pub async fn relay_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    target: &str,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> Result<RelayStats, RelayError> {
    let upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(RelayError::UpstreamConnect {
                target: target.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(RelayError::UpstreamTimeout(target.to_string())),
    };
    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);
    debug!(peer = %peer_addr, target = %target, "Upstream connected");

    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let mut stats = RelayStats::default();
    let mut down = 0u64;

    let ended = tokio::select! {
        _ = cancel.cancelled() => "cancelled",
        result = pump_client(
            &mut client_read,
            &mut upstream_write,
            &mut stats.bytes.up,
            &mut stats.hostname_guess,
        ) => match result {
            Ok(()) => "client closed",
            Err(e) => {
                debug!(peer = %peer_addr, "Client side failed: {}", e);
                "client error"
            }
        },
        result = pump(&mut upstream_read, &mut client_write, &mut down) => match result {
            Ok(()) => "upstream closed",
            Err(e) => {
                debug!(peer = %peer_addr, "Upstream side failed: {}", e);
                "upstream error"
            }
        },
    };
    stats.bytes.down = down;

    trace!(peer = %peer_addr, "Relay ended: {}", ended);
    Ok(stats)
}

/// Client to upstream. The first chunk is sniffed, then forwarded as read.
async fn pump_client<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &mut u64,
    hostname: &mut Option<String>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut first = true;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        if first {
            *hostname = sniff_hostname(&buffer[..n]);
            first = false;
        }
        writer.write_all(&buffer[..n]).await?;
        *counter += n as u64;
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        *counter += n as u64;
    }
}
