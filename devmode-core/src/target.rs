// Live debugger connections and the launch context that owns them
//
// A `DebugTarget` is created when an attach attempt reaches `Attached`
// and is published into the `LaunchContext`. It watches the debuggee's
// event stream; on VM death or socket loss it removes itself from the
// context and, if asked to, hands the key to a relaunch hook. Both events
// usually fire for the same session, so the teardown is guarded to run
// once.

use crate::process::SessionKey;
use jdwp_client::{DebuggeeEvent, JdwpConnection};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long an orderly detach waits for the debuggee to acknowledge Dispose
pub const DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Called with the session key after a target disconnects with relaunch set
pub type RelaunchHook = Arc<dyn Fn(&SessionKey) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    VmDeath,
    VmDisconnect,
    Terminated,
}

pub struct DebugTarget {
    key: SessionKey,
    connection_id: String,
    connection: JdwpConnection,
    disconnected: AtomicBool,
    relaunch: AtomicBool,
    launches: Weak<LaunchContext>,
    relaunch_hook: Option<RelaunchHook>,
}

impl std::fmt::Debug for DebugTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugTarget")
            .field("key", &self.key)
            .field("connection_id", &self.connection_id)
            .field("disconnected", &self.is_disconnected())
            .field("relaunch", &self.relaunch_enabled())
            .finish()
    }
}

impl DebugTarget {
    pub fn new(
        key: SessionKey,
        connection: JdwpConnection,
        launches: &Arc<LaunchContext>,
        relaunch: bool,
        relaunch_hook: Option<RelaunchHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            connection_id: connection.address().to_string(),
            connection,
            disconnected: AtomicBool::new(false),
            relaunch: AtomicBool::new(relaunch),
            launches: Arc::downgrade(launches),
            relaunch_hook,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// `host:port` of the debuggee
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connection(&self) -> &JdwpConnection {
        &self.connection
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn relaunch_enabled(&self) -> bool {
        self.relaunch.load(Ordering::SeqCst)
    }

    pub fn set_relaunch(&self, relaunch: bool) {
        self.relaunch.store(relaunch, Ordering::SeqCst);
    }

    /// Tear the target down. Only the first call does anything and returns
    /// true; later calls (the second of VM death / disconnect) are no-ops.
    pub fn handle_disconnect(&self, reason: DisconnectReason) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            debug!(
                "Ignoring {:?} for {}, already disconnected",
                reason, self.connection_id
            );
            return false;
        }

        info!("Debug target {} for {} ended: {:?}", self.connection_id, self.key, reason);
        self.connection.shutdown();

        if let Some(launches) = self.launches.upgrade() {
            launches.remove(&self.key, self);
        }

        if self.relaunch_enabled() {
            if let Some(hook) = &self.relaunch_hook {
                info!("Relaunching debugger for {}", self.key);
                hook(&self.key);
            }
        }
        true
    }

    /// Detach on purpose: no relaunch, tell the VM to drop debugger state
    pub async fn terminate(&self) {
        self.set_relaunch(false);
        if !self.is_disconnected() {
            match tokio::time::timeout(DISPOSE_TIMEOUT, self.connection.dispose()).await {
                Ok(Ok(())) => debug!("Disposed {}", self.connection_id),
                Ok(Err(e)) => warn!("Dispose of {} failed: {}", self.connection_id, e),
                Err(_) => warn!("Dispose of {} timed out", self.connection_id),
            }
        }
        self.handle_disconnect(DisconnectReason::Terminated);
    }

    /// Follow the debuggee's event stream until the connection ends
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let target = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match target.connection.recv_event().await {
                    Some(DebuggeeEvent::Events(set)) if set.has_vm_death() => {
                        target.handle_disconnect(DisconnectReason::VmDeath);
                    }
                    Some(DebuggeeEvent::Events(set)) => {
                        debug!("{} events from {}", set.events.len(), target.connection_id);
                    }
                    Some(DebuggeeEvent::Disconnected) | None => {
                        target.handle_disconnect(DisconnectReason::VmDisconnect);
                        break;
                    }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetInfo {
    pub key: SessionKey,
    pub connection_id: String,
    pub relaunch: bool,
}

/// Live debug targets, at most one per session
#[derive(Debug, Default)]
pub struct LaunchContext {
    targets: Mutex<HashMap<SessionKey, Arc<DebugTarget>>>,
}

impl LaunchContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store `target`, returning whatever it replaced
    pub fn publish(&self, target: Arc<DebugTarget>) -> Option<Arc<DebugTarget>> {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.insert(target.key.clone(), target)
    }

    /// Remove `target` if it is still the one registered for `key`
    pub fn remove(&self, key: &SessionKey, target: &DebugTarget) -> bool {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        let current = targets
            .get(key)
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), target));
        if current {
            targets.remove(key);
        }
        current
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<DebugTarget>> {
        let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.get(key).cloned()
    }

    pub fn targets(&self) -> Vec<TargetInfo> {
        let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = targets
            .values()
            .map(|t| TargetInfo {
                key: t.key.clone(),
                connection_id: t.connection_id.clone(),
                relaunch: t.relaunch_enabled(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Terminate the target for `key` without relaunching
    pub async fn detach(&self, key: &SessionKey) -> bool {
        match self.get(key) {
            Some(target) => {
                target.terminate().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jdwp_client::commands::{command_sets, event_commands, event_kinds};
    use jdwp_client::JDWP_HANDSHAKE;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Accept one debugger, answer the handshake, return the socket
    async fn debuggee() -> (u16, JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hs = [0u8; 14];
            socket.read_exact(&mut hs).await.unwrap();
            socket.write_all(JDWP_HANDSHAKE).await.unwrap();
            socket
        });
        (port, accepted)
    }

    fn vm_death_packet() -> Vec<u8> {
        let mut body = vec![0u8];
        body.extend_from_slice(&1i32.to_be_bytes());
        body.push(event_kinds::VM_DEATH);
        body.extend_from_slice(&0i32.to_be_bytes());

        let mut packet = Vec::new();
        packet.extend_from_slice(&((11 + body.len()) as u32).to_be_bytes());
        packet.extend_from_slice(&1u32.to_be_bytes());
        packet.push(0);
        packet.push(command_sets::EVENT);
        packet.push(event_commands::COMPOSITE);
        packet.extend_from_slice(&body);
        packet
    }

    fn counting_hook() -> (RelaunchHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let hook: RelaunchHook = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (hook, count)
    }

    #[tokio::test]
    async fn disconnect_runs_once() {
        let (port, accepted) = debuggee().await;
        let connection = JdwpConnection::connect("127.0.0.1", port).await.unwrap();
        let _socket = accepted.await.unwrap();

        let launches = LaunchContext::new();
        let (hook, relaunches) = counting_hook();
        let key = SessionKey::from("proj1");
        let target = DebugTarget::new(key.clone(), connection, &launches, true, Some(hook));
        launches.publish(Arc::clone(&target));

        assert!(target.handle_disconnect(DisconnectReason::VmDeath));
        assert!(!target.handle_disconnect(DisconnectReason::VmDisconnect));

        assert_eq!(relaunches.load(Ordering::SeqCst), 1);
        assert!(launches.get(&key).is_none());
        assert!(target.connection().is_closed());
    }

    #[tokio::test]
    async fn vm_death_then_socket_close_relaunches_once() {
        let (port, accepted) = debuggee().await;
        let connection = JdwpConnection::connect("127.0.0.1", port).await.unwrap();
        let mut socket = accepted.await.unwrap();

        let launches = LaunchContext::new();
        let (hook, relaunches) = counting_hook();
        let key = SessionKey::from("proj1");
        let target = DebugTarget::new(key.clone(), connection, &launches, true, Some(hook));
        launches.publish(Arc::clone(&target));
        let watcher = target.watch();

        socket.write_all(&vm_death_packet()).await.unwrap();
        drop(socket);

        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relaunches.load(Ordering::SeqCst), 1);
        assert!(launches.targets().is_empty());
    }

    #[tokio::test]
    async fn detach_does_not_relaunch() {
        let (port, accepted) = debuggee().await;
        let connection = JdwpConnection::connect("127.0.0.1", port).await.unwrap();
        let socket = accepted.await.unwrap();
        // The peer never answers Dispose; closing it fails the pending reply
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(socket);
        });

        let launches = LaunchContext::new();
        let (hook, relaunches) = counting_hook();
        let key = SessionKey::from("proj1");
        let target = DebugTarget::new(key.clone(), connection, &launches, true, Some(hook));
        launches.publish(Arc::clone(&target));

        assert!(launches.detach(&key).await);
        assert!(!launches.detach(&key).await);
        assert_eq!(relaunches.load(Ordering::SeqCst), 0);
        assert!(target.is_disconnected());
    }

    #[tokio::test]
    async fn stale_target_does_not_remove_successor() {
        let launches = LaunchContext::new();
        let key = SessionKey::from("proj1");

        let (port, accepted) = debuggee().await;
        let first = DebugTarget::new(
            key.clone(),
            JdwpConnection::connect("127.0.0.1", port).await.unwrap(),
            &launches,
            false,
            None,
        );
        let _a = accepted.await.unwrap();

        let (port, accepted) = debuggee().await;
        let second = DebugTarget::new(
            key.clone(),
            JdwpConnection::connect("127.0.0.1", port).await.unwrap(),
            &launches,
            false,
            None,
        );
        let _b = accepted.await.unwrap();

        launches.publish(Arc::clone(&first));
        let replaced = launches.publish(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));

        first.handle_disconnect(DisconnectReason::Terminated);
        let current = launches.get(&key).unwrap();
        assert_eq!(current.connection_id(), second.connection_id());
    }
}
