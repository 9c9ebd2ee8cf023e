// JDWP connection management
//
// Handles TCP connection, handshake, and event loop startup

use crate::eventloop::{spawn_event_loop, EventLoopHandle};
use crate::events::DebuggeeEvent;
use crate::protocol::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Handshake budget used by [`JdwpConnection::connect`]
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct JdwpConnection {
    address: String,
    event_loop: EventLoopHandle,
    next_id: Arc<AtomicU32>,
}

impl JdwpConnection {
    /// Connect to a JVM via JDWP
    pub async fn connect(host: &str, port: u16) -> JdwpResult<Self> {
        Self::connect_with_timeout(host, port, DEFAULT_HANDSHAKE_TIMEOUT).await
    }

    /// Connect, giving the debuggee `handshake_timeout` to answer the
    /// handshake once the socket is open. A refused or reset socket comes
    /// back as `JdwpError::Io`; a silent peer as `JdwpError::Timeout`.
    pub async fn connect_with_timeout(
        host: &str,
        port: u16,
        handshake_timeout: Duration,
    ) -> JdwpResult<Self> {
        info!("Connecting to JDWP at {}:{}", host, port);

        let mut stream = TcpStream::connect((host, port)).await?;

        tokio::time::timeout(handshake_timeout, Self::handshake(&mut stream))
            .await
            .map_err(|_| JdwpError::Timeout(handshake_timeout))??;

        let (reader, writer) = stream.into_split();
        let event_loop = spawn_event_loop(reader, writer);

        Ok(Self {
            address: format!("{}:{}", host, port),
            event_loop,
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }

    async fn handshake(stream: &mut TcpStream) -> JdwpResult<()> {
        debug!("Performing JDWP handshake");

        stream.write_all(JDWP_HANDSHAKE).await?;
        stream.flush().await?;

        let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != JDWP_HANDSHAKE {
            warn!("Invalid handshake response: {:?}", buf);
            return Err(JdwpError::InvalidHandshake);
        }

        info!("JDWP handshake successful");
        Ok(())
    }

    /// `host:port` this connection was opened against
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn send_command(&self, packet: CommandPacket) -> JdwpResult<ReplyPacket> {
        debug!("Sending command packet id={}", packet.id);
        self.event_loop.send_command(packet).await
    }

    /// Wait for the next debuggee event. After the socket closes this yields
    /// `DebuggeeEvent::Disconnected` once, then `None`.
    pub async fn recv_event(&self) -> Option<DebuggeeEvent> {
        self.event_loop.recv_event().await
    }

    /// Close the socket without telling the debuggee
    pub fn shutdown(&self) {
        self.event_loop.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.event_loop.is_shutdown()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}
