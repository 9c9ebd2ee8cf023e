// JDWP Event Loop
//
// Owns both halves of the socket: writes commands, routes replies back to
// their callers, and forwards debuggee events plus a final `Disconnected`.
// Packets are read by a separate task so a partially read packet is never
// dropped when the loop wakes up for a command instead.

use crate::commands::{command_sets, event_commands};
use crate::events::{parse_event_packet, DebuggeeEvent};
use crate::protocol::{CommandPacket, JdwpError, JdwpResult, ReplyPacket, HEADER_SIZE, REPLY_FLAG};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on a single packet, guards against a confused peer
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

pub struct CommandRequest {
    pub packet: CommandPacket,
    pub reply_tx: oneshot::Sender<JdwpResult<ReplyPacket>>,
}

/// Handle to the event loop for sending commands and receiving events
#[derive(Clone, Debug)]
pub struct EventLoopHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    event_rx: Arc<Mutex<mpsc::Receiver<DebuggeeEvent>>>,
    shutdown: CancellationToken,
}

impl EventLoopHandle {
    pub async fn send_command(&self, packet: CommandPacket) -> JdwpResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(CommandRequest { packet, reply_tx })
            .await
            .map_err(|_| JdwpError::ConnectionClosed)?;

        reply_rx.await.map_err(|_| JdwpError::ConnectionClosed)?
    }

    /// Wait for the next event; `None` once the loop has exited and drained
    pub async fn recv_event(&self) -> Option<DebuggeeEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Stop the loop and close the socket
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub fn spawn_event_loop(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> EventLoopHandle {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(256);
    let shutdown = CancellationToken::new();

    tokio::spawn(event_loop_task(
        reader,
        writer,
        command_rx,
        event_tx,
        shutdown.clone(),
    ));

    EventLoopHandle {
        command_tx,
        event_rx: Arc::new(Mutex::new(event_rx)),
        shutdown,
    }
}

async fn event_loop_task(
    reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    event_tx: mpsc::Sender<DebuggeeEvent>,
    shutdown: CancellationToken,
) {
    info!("Event loop started");

    let mut pending_replies: HashMap<u32, oneshot::Sender<JdwpResult<ReplyPacket>>> =
        HashMap::new();

    let (packet_tx, mut packet_rx) = mpsc::channel(64);
    let read_task = tokio::spawn(read_loop(reader, packet_tx));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Event loop shutdown requested");
                break;
            }

            Some(cmd) = command_rx.recv() => {
                let packet_id = cmd.packet.id;
                debug!("Sending command id={}", packet_id);

                let encoded = cmd.packet.encode();
                let written = async {
                    writer.write_all(&encoded).await?;
                    writer.flush().await
                }
                .await;

                match written {
                    Ok(()) => {
                        pending_replies.insert(packet_id, cmd.reply_tx);
                    }
                    Err(e) => {
                        error!("Failed to write command: {}", e);
                        cmd.reply_tx.send(Err(JdwpError::Io(e))).ok();
                    }
                }
            }

            result = packet_rx.recv() => {
                match result {
                    Some(Ok(packet)) => route_packet(packet, &mut pending_replies, &event_tx),
                    Some(Err(e)) => {
                        info!("Debuggee connection ended: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    read_task.abort();

    for (_, tx) in pending_replies.drain() {
        tx.send(Err(JdwpError::ConnectionClosed)).ok();
    }

    shutdown.cancel();
    // The consumer may already be gone; nothing else to tell.
    event_tx.send(DebuggeeEvent::Disconnected).await.ok();

    info!("Event loop shutting down");
}

fn route_packet(
    packet: Vec<u8>,
    pending_replies: &mut HashMap<u32, oneshot::Sender<JdwpResult<ReplyPacket>>>,
    event_tx: &mpsc::Sender<DebuggeeEvent>,
) {
    let packet_id = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

    if packet[8] == REPLY_FLAG {
        match pending_replies.remove(&packet_id) {
            Some(tx) => {
                tx.send(ReplyPacket::decode(&packet)).ok();
            }
            None => warn!("Received reply for unknown command id={}", packet_id),
        }
        return;
    }

    if packet[9] != command_sets::EVENT || packet[10] != event_commands::COMPOSITE {
        debug!(
            "Ignoring debuggee command {}/{}",
            packet[9], packet[10]
        );
        return;
    }

    match parse_event_packet(&packet[HEADER_SIZE..]) {
        Ok(event_set) => {
            debug!("Event set with {} events", event_set.events.len());
            match event_tx.try_send(DebuggeeEvent::Events(event_set)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    error!("Event channel full, dropping event set");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Event receiver dropped");
                }
            }
        }
        Err(e) => warn!("Failed to parse event: {}", e),
    }
}

/// Forwards whole packets until the socket fails or the loop goes away
async fn read_loop(mut reader: OwnedReadHalf, packet_tx: mpsc::Sender<JdwpResult<Vec<u8>>>) {
    loop {
        let result = read_packet(&mut reader).await;
        let failed = result.is_err();
        if packet_tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// Read one whole packet (header included)
async fn read_packet(reader: &mut OwnedReadHalf) -> JdwpResult<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

    if length < HEADER_SIZE {
        return Err(JdwpError::Protocol(format!("Invalid packet length: {}", length)));
    }
    if length > MAX_PACKET_SIZE {
        return Err(JdwpError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        )));
    }

    let mut packet = vec![0u8; length];
    packet[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut packet[HEADER_SIZE..]).await?;

    Ok(packet)
}
