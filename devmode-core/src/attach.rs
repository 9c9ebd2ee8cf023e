// Debugger attach state machine
//
// AwaitingPort --port known--> ProbingSocket --listening--> Connecting --handshake--> Attached
//      |                           |    ^                        |
//      |                           |    '--port re-read, moved   |
//      '-------------------------- +--------> Failed <-----------'
//      '-------------------------- '--------> Cancelled
//
// Each attempt runs as its own task and reports through an `AttachHandle`:
// the current phase, every phase it went through, and a single final
// `AttachOutcome`. Cancellation is cooperative. It is checked at the top
// of every discovery poll and probe attempt and comes from the handle, from
// the session's close listeners, or from the session's closed flag, which
// has no push notification and is therefore polled.

use crate::config::{AttachPolicy, ProbePolicy};
use crate::error::{AttachError, DevModeError, ProbeError};
use crate::listeners::ListenerId;
use crate::port::PortLookup;
use crate::probe::{probe, ProbeStatus};
use crate::process::{SessionController, SessionKey};
use crate::target::{DebugTarget, LaunchContext, RelaunchHook};
use jdwp_client::{JdwpConnection, JdwpError, JDWP_HANDSHAKE};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Budget for the diagnostic VirtualMachine.Version call after attaching
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPhase {
    AwaitingPort,
    ProbingSocket,
    Connecting,
    Attached,
    Failed,
    Cancelled,
}

impl AttachPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttachPhase::Attached | AttachPhase::Failed | AttachPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The target now lives in the launch context
    Attached { connection_id: String },
    Failed(AttachError),
    /// Stopped on request; nothing to report to the user
    Cancelled,
}

impl AttachOutcome {
    pub fn phase(&self) -> AttachPhase {
        match self {
            AttachOutcome::Attached { .. } => AttachPhase::Attached,
            AttachOutcome::Failed(_) => AttachPhase::Failed,
            AttachOutcome::Cancelled => AttachPhase::Cancelled,
        }
    }
}

pub struct AttachRequest {
    pub key: SessionKey,
    pub host: String,
    /// Skip discovery when the port is already known
    pub port: Option<u16>,
    /// Where to (re)read the port the debuggee actually published
    pub lookup: Arc<dyn PortLookup>,
    pub relaunch_on_disconnect: bool,
}

/// Caller's view of one attach attempt
#[derive(Debug, Clone)]
pub struct AttachHandle {
    key: SessionKey,
    phase: watch::Receiver<AttachPhase>,
    history: Arc<Mutex<Vec<AttachPhase>>>,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<AttachOutcome>>,
}

impl AttachHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn phase(&self) -> AttachPhase {
        *self.phase.borrow()
    }

    /// Every phase entered so far, in order
    pub fn phases(&self) -> Vec<AttachPhase> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AttachPhase> {
        self.phase.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait for the attempt to end
    pub async fn outcome(&self) -> AttachOutcome {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone().unwrap_or(AttachOutcome::Cancelled),
            // task went away without reporting
            Err(_) => AttachOutcome::Cancelled,
        };
        result
    }

    /// The outcome if the attempt has already ended
    pub fn finished_outcome(&self) -> Option<AttachOutcome> {
        self.outcome.borrow().clone()
    }
}

/// State shared by the phases of one running attempt
struct Attempt {
    key: SessionKey,
    host: String,
    lookup: Arc<dyn PortLookup>,
    relaunch: bool,
    controller: Arc<SessionController>,
    closed_check_every: u32,
    ticks: AtomicU32,
    cancel: CancellationToken,
    phase_tx: watch::Sender<AttachPhase>,
    history: Arc<Mutex<Vec<AttachPhase>>>,
}

impl Attempt {
    fn enter(&self, phase: AttachPhase) {
        debug!("Attach for {} -> {:?}", self.key, phase);
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(phase);
        self.phase_tx.send_replace(phase);
    }

    /// Lookups read files, so they run off the async workers
    async fn reread(&self) -> crate::error::Result<u16> {
        let lookup = Arc::clone(&self.lookup);
        tokio::task::spawn_blocking(move || lookup.reread())
            .await
            .map_err(DevModeError::LookupTask)?
    }

    /// The closed flag is only consulted every `closed_check_every` ticks
    fn should_cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % self.closed_check_every.max(1) == 0 && self.controller.is_closed(&self.key) {
            info!("Session {} was closed, abandoning attach", self.key);
            self.cancel.cancel();
            return true;
        }
        false
    }
}

/// Why an attempt stopped early
enum Halt {
    Cancelled,
    Failed(AttachError),
}

/// Runs attach attempts and relaunches them when targets disconnect
pub struct Attacher {
    controller: Arc<SessionController>,
    launches: Arc<LaunchContext>,
    policy: AttachPolicy,
    attempts: Mutex<HashMap<SessionKey, AttachHandle>>,
}

impl Attacher {
    pub fn new(
        controller: Arc<SessionController>,
        launches: Arc<LaunchContext>,
        policy: AttachPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            launches,
            policy,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn launches(&self) -> &Arc<LaunchContext> {
        &self.launches
    }

    pub fn policy(&self) -> &AttachPolicy {
        &self.policy
    }

    /// Most recent attempt for `key`, finished or not
    pub fn latest(&self, key: &SessionKey) -> Option<AttachHandle> {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.get(key).cloned()
    }

    /// Cancel the running attempt for `key`, if any
    pub fn cancel(&self, key: &SessionKey) -> bool {
        match self.latest(key) {
            Some(handle) if !handle.is_finished() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Start an attempt in the background. An unfinished earlier attempt for
    /// the same key is cancelled.
    pub fn attach(self: &Arc<Self>, request: AttachRequest) -> AttachHandle {
        let AttachRequest {
            key,
            host,
            port,
            lookup,
            relaunch_on_disconnect,
        } = request;

        let (phase_tx, phase_rx) = watch::channel(AttachPhase::AwaitingPort);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let history = Arc::new(Mutex::new(vec![AttachPhase::AwaitingPort]));
        let cancel = CancellationToken::new();

        let handle = AttachHandle {
            key: key.clone(),
            phase: phase_rx,
            history: Arc::clone(&history),
            cancel: cancel.clone(),
            outcome: outcome_rx,
        };

        let previous = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            attempts.insert(key.clone(), handle.clone())
        };
        if let Some(previous) = previous.filter(|p| !p.is_finished()) {
            info!("Superseding running attach for {}", key);
            previous.cancel();
        }

        let token = cancel.clone();
        let listener = self.controller.listeners().register_on_close(&key, move |key| {
            debug!("Session {} cleaned up, cancelling attach", key);
            token.cancel();
        });

        let attempt = Attempt {
            key,
            host,
            lookup,
            relaunch: relaunch_on_disconnect,
            controller: Arc::clone(&self.controller),
            closed_check_every: self.policy.closed_check_every,
            ticks: AtomicU32::new(0),
            cancel,
            phase_tx,
            history,
        };

        info!(
            "Attaching debugger to {} at {}:{}",
            attempt.key,
            attempt.host,
            port.map_or_else(|| "?".to_string(), |p| p.to_string())
        );

        let attacher = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = attacher.run(&attempt, port).await;
            attacher.finish(&attempt, listener, &outcome);
            outcome_tx.send_replace(Some(outcome));
        });

        handle
    }

    async fn run(self: &Arc<Self>, attempt: &Attempt, port: Option<u16>) -> AttachOutcome {
        let result: Result<String, Halt> = async {
            let port = match port {
                Some(port) => port,
                None => self.await_port(attempt).await?,
            };
            attempt.enter(AttachPhase::ProbingSocket);
            let port = self.probe_socket(attempt, port).await?;
            attempt.enter(AttachPhase::Connecting);
            let connection = self.connect(attempt, port).await?;
            Ok(self.attached(attempt, connection))
        }
        .await;

        match result {
            Ok(connection_id) => AttachOutcome::Attached { connection_id },
            Err(Halt::Cancelled) => AttachOutcome::Cancelled,
            Err(Halt::Failed(e)) => AttachOutcome::Failed(e),
        }
    }

    fn finish(&self, attempt: &Attempt, listener: ListenerId, outcome: &AttachOutcome) {
        self.controller
            .listeners()
            .unregister_on_close(&attempt.key, listener);
        attempt.enter(outcome.phase());

        match outcome {
            AttachOutcome::Attached { connection_id } => {
                info!("Debugger attached to {} at {}", attempt.key, connection_id)
            }
            AttachOutcome::Failed(e) => warn!("Attach for {} failed: {}", attempt.key, e),
            AttachOutcome::Cancelled => info!("Attach for {} cancelled", attempt.key),
        }
    }

    /// Poll for the published port
    async fn await_port(&self, attempt: &Attempt) -> Result<u16, Halt> {
        let max = self.policy.discovery_max_attempts;
        for n in 1..=max {
            if attempt.should_cancel() {
                return Err(Halt::Cancelled);
            }
            match attempt.reread().await {
                Ok(port) => {
                    info!("Debug port for {} is {}", attempt.key, port);
                    return Ok(port);
                }
                Err(e) => debug!(
                    "Debug port for {} not available ({}/{}): {}",
                    attempt.key, n, max, e
                ),
            }
            if n < max {
                tokio::time::sleep(self.policy.discovery_interval()).await;
            }
        }
        Err(Halt::Failed(AttachError::DiscoveryExhausted {
            key: attempt.key.clone(),
            attempts: max,
        }))
    }

    /// Probe in windows of `port_recheck_every` attempts, re-reading the
    /// published port between windows in case the debuggee moved.
    async fn probe_socket(&self, attempt: &Attempt, mut port: u16) -> Result<u16, Halt> {
        let total = self.policy.probe_max_attempts;
        let window = self.policy.port_recheck_every.max(1);
        let mut used = 0;

        while used < total {
            let attempts = window.min(total - used);
            let policy = ProbePolicy::new(self.policy.probe_interval(), attempts);

            match probe(&attempt.host, port, JDWP_HANDSHAKE, &policy, || {
                attempt.should_cancel()
            })
            .await
            {
                Ok(ProbeStatus::Ready) => return Ok(port),
                Ok(ProbeStatus::Cancelled) => return Err(Halt::Cancelled),
                Err(ProbeError::Timeout { .. }) => {
                    used += attempts;
                    if used >= total {
                        break;
                    }
                    match attempt.reread().await {
                        Ok(fresh) if fresh != port => {
                            info!(
                                "Debug port for {} moved from {} to {}",
                                attempt.key, port, fresh
                            );
                            port = fresh;
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Could not re-read debug port for {}: {}", attempt.key, e),
                    }
                    tokio::time::sleep(self.policy.probe_interval()).await;
                }
                Err(ProbeError::Transport { source, .. }) => {
                    return Err(Halt::Failed(AttachError::Transport {
                        host: attempt.host.clone(),
                        port,
                        message: source.to_string(),
                    }))
                }
            }
        }

        Err(Halt::Failed(AttachError::ProbeTimeout {
            host: attempt.host.clone(),
            port,
            attempts: total,
        }))
    }

    /// A live socket does not mean the debug agent is ready for us yet, so
    /// transport failures are retried briefly. A handshake timeout is not.
    async fn connect(&self, attempt: &Attempt, port: u16) -> Result<JdwpConnection, Halt> {
        let host = &attempt.host;
        let interval = self.policy.connect_retry_interval();
        let deadline = Instant::now() + self.policy.connect_retry_budget();

        loop {
            if attempt.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }

            match JdwpConnection::connect_with_timeout(host, port, self.policy.handshake_timeout())
                .await
            {
                Ok(connection) => {
                    if attempt.cancel.is_cancelled() {
                        debug!("Attach to {} cancelled mid-connect, closing", connection.address());
                        connection.shutdown();
                        return Err(Halt::Cancelled);
                    }
                    return Ok(connection);
                }
                Err(JdwpError::Timeout(_)) => {
                    return Err(Halt::Failed(AttachError::ProtocolTimeout {
                        host: host.clone(),
                        port,
                    }))
                }
                Err(e) if e.is_transport() && Instant::now() + interval < deadline => {
                    debug!("Connect to {}:{} failed, retrying: {}", host, port, e);
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    return Err(Halt::Failed(AttachError::Transport {
                        host: host.clone(),
                        port,
                        message: e.to_string(),
                    }))
                }
            }
        }
    }

    /// Hand the connection to the launch context and start watching it
    fn attached(self: &Arc<Self>, attempt: &Attempt, connection: JdwpConnection) -> String {
        let target = DebugTarget::new(
            attempt.key.clone(),
            connection,
            &self.launches,
            attempt.relaunch,
            Some(self.relaunch_hook(attempt)),
        );
        let connection_id = target.connection_id().to_string();

        if let Some(previous) = self.launches.publish(Arc::clone(&target)) {
            info!(
                "Replacing debug target {} for {}",
                previous.connection_id(),
                attempt.key
            );
            tokio::spawn(async move { previous.terminate().await });
        }
        target.watch();

        let diagnostics = Arc::clone(&target);
        tokio::spawn(async move {
            match tokio::time::timeout(VERSION_TIMEOUT, diagnostics.connection().get_version()).await
            {
                Ok(Ok(version)) => info!(
                    "{} runs {} {}",
                    diagnostics.connection_id(),
                    version.vm_name,
                    version.vm_version
                ),
                Ok(Err(e)) => debug!("No VM version from {}: {}", diagnostics.connection_id(), e),
                Err(_) => debug!("VM version from {} timed out", diagnostics.connection_id()),
            }
        });

        connection_id
    }

    /// New attempt with the port unknown, since a restarted debuggee may
    /// have moved. Skipped once the session is gone.
    fn relaunch_hook(self: &Arc<Self>, attempt: &Attempt) -> RelaunchHook {
        let attacher = Arc::downgrade(self);
        let host = attempt.host.clone();
        let lookup = Arc::clone(&attempt.lookup);

        Arc::new(move |key: &SessionKey| {
            let Some(attacher) = attacher.upgrade() else {
                return;
            };
            if !attacher.controller.is_started(key) || attacher.controller.is_closed(key) {
                info!("Session {} is no longer running, not relaunching debugger", key);
                return;
            }
            attacher.attach(AttachRequest {
                key: key.clone(),
                host: host.clone(),
                port: None,
                lookup: Arc::clone(&lookup),
                relaunch_on_disconnect: true,
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use tokio::net::{TcpListener, TcpStream};

    struct NoPort;

    impl PortLookup for NoPort {
        fn reread(&self) -> Result<u16> {
            Err(DevModeError::InvalidPort("unpublished".to_string()))
        }
    }

    fn fast_policy() -> AttachPolicy {
        AttachPolicy {
            discovery_interval_ms: 5,
            discovery_max_attempts: 3,
            probe_interval_ms: 5,
            probe_max_attempts: 4,
            port_recheck_every: 2,
            closed_check_every: 2,
            connect_retry_interval_ms: 10,
            connect_retry_budget_ms: 200,
            handshake_timeout_ms: 50,
        }
    }

    fn attacher() -> Arc<Attacher> {
        Attacher::new(
            Arc::new(SessionController::default()),
            LaunchContext::new(),
            fast_policy(),
        )
    }

    fn request(port: Option<u16>) -> AttachRequest {
        AttachRequest {
            key: SessionKey::from("proj1"),
            host: "127.0.0.1".to_string(),
            port,
            lookup: Arc::new(NoPort),
            relaunch_on_disconnect: false,
        }
    }

    #[tokio::test]
    async fn discovery_gives_up() {
        let attacher = attacher();
        let handle = attacher.attach(request(None));

        let outcome = handle.outcome().await;
        assert_eq!(
            outcome,
            AttachOutcome::Failed(AttachError::DiscoveryExhausted {
                key: SessionKey::from("proj1"),
                attempts: 3,
            })
        );
        assert_eq!(handle.phases(), vec![AttachPhase::AwaitingPort, AttachPhase::Failed]);
        assert_eq!(attacher.controller.listeners().registered(handle.key()), 0);
    }

    /// Stands in for a lookup stuck on a slow filesystem
    struct SlowPort(u16);

    impl PortLookup for SlowPort {
        fn reread(&self) -> Result<u16> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(self.0)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn slow_lookup_does_not_stall_runtime() {
        let ticks = Arc::new(AtomicU32::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let attacher = Attacher::new(
            Arc::new(SessionController::default()),
            LaunchContext::new(),
            AttachPolicy {
                probe_max_attempts: 1,
                ..fast_policy()
            },
        );
        // port 1 is never listening, so the attempt fails right after discovery
        let handle = attacher.attach(AttachRequest {
            lookup: Arc::new(SlowPort(1)),
            ..request(None)
        });
        let outcome = handle.outcome().await;
        ticker.abort();

        assert!(matches!(outcome, AttachOutcome::Failed(_)));
        assert!(
            ticks.load(Ordering::Relaxed) >= 5,
            "runtime stalled while the port was looked up"
        );
    }

    #[tokio::test]
    async fn silent_debug_agent_is_a_protocol_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held: Vec<TcpStream> = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let handle = attacher().attach(request(Some(port)));
        assert_eq!(
            handle.outcome().await,
            AttachOutcome::Failed(AttachError::ProtocolTimeout {
                host: "127.0.0.1".to_string(),
                port,
            })
        );
        assert_eq!(
            handle.phases(),
            vec![
                AttachPhase::AwaitingPort,
                AttachPhase::ProbingSocket,
                AttachPhase::Connecting,
                AttachPhase::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn new_attempt_supersedes_running_one() {
        let attacher = Attacher::new(
            Arc::new(SessionController::default()),
            LaunchContext::new(),
            AttachPolicy {
                discovery_max_attempts: 1_000,
                ..fast_policy()
            },
        );

        let first = attacher.attach(request(None));
        let second = attacher.attach(request(None));

        assert_eq!(first.outcome().await, AttachOutcome::Cancelled);
        assert!(!second.is_finished());
        assert!(attacher.cancel(second.key()));
        assert_eq!(second.outcome().await, AttachOutcome::Cancelled);
        assert_eq!(second.phase(), AttachPhase::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closed_session_cancels_attempt() {
        let controller = Arc::new(SessionController::default());
        let key = SessionKey::from("proj1");
        controller
            .start(&key, "exit 1", &std::env::temp_dir(), &[])
            .await
            .unwrap();
        for _ in 0..200 {
            if controller.is_closed(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(controller.is_closed(&key));

        let attacher = Attacher::new(
            Arc::clone(&controller),
            LaunchContext::new(),
            AttachPolicy {
                discovery_max_attempts: 1_000,
                ..fast_policy()
            },
        );
        let handle = attacher.attach(request(None));

        assert_eq!(handle.outcome().await, AttachOutcome::Cancelled);
        // second tick is the first one that looks at the flag
        assert_eq!(handle.phases(), vec![AttachPhase::AwaitingPort, AttachPhase::Cancelled]);
    }
}
