// Dev-mode process sessions
//
// `SessionController` owns at most one external process per `SessionKey`.
// The map of sessions is only locked for inserts and removals; everything
// that touches a session's stdin (start, write, cleanup) goes through that
// session's own async lock, so a write can never interleave with teardown.
//
// Lifecycle of one session:
//
// NotStarted --spawn--> Running --stop--> Stopping --exit--> Stopped
//                          \---------------exit (closed)---> Stopped
//
// A process that exits while still `Running` did not go through `stop`, so
// the session is also flagged closed. A closed or stopped session may be
// replaced by a new `start`, which first cleans up the old one.

use crate::error::{DevModeError, Result};
use crate::listeners::CloseListeners;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ends dev mode
pub const EXIT_COMMAND: &str = "exit\n";
/// Runs the test suite on demand
pub const RUN_TESTS_COMMAND: &str = "\n";
/// Restarts the server inside the same dev-mode process
pub const RESTART_COMMAND: &str = "r";

/// Identifies one dev-mode session; one per project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::NotStarted,
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            _ => SessionState::Stopped,
        }
    }
}

/// Point-in-time view of a session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub state: SessionState,
    pub closed: bool,
    pub pid: Option<u32>,
}

#[derive(Debug)]
struct OutputBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl OutputBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::new(),
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail(&self, count: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(start).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct SessionIo {
    stdin: Option<ChildStdin>,
}

/// One external dev-mode process
#[derive(Debug)]
struct ProcessSession {
    key: SessionKey,
    state: AtomicU8,
    closed: AtomicBool,
    pid: Mutex<Option<u32>>,
    io: Arc<tokio::sync::Mutex<SessionIo>>,
    kill: CancellationToken,
    output: Mutex<OutputBuffer>,
}

impl ProcessSession {
    fn new(key: SessionKey, output_lines: usize) -> Self {
        Self {
            key,
            state: AtomicU8::new(SessionState::NotStarted as u8),
            closed: AtomicBool::new(false),
            pid: Mutex::new(None),
            io: Arc::new(tokio::sync::Mutex::new(SessionIo::default())),
            kill: CancellationToken::new(),
            output: Mutex::new(OutputBuffer::new(output_lines)),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) -> SessionState {
        SessionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Holds the key against a concurrent `start`
    fn occupies_key(&self) -> bool {
        !self.is_closed() && self.state() != SessionState::Stopped
    }

    fn process_alive(&self) -> bool {
        matches!(self.state(), SessionState::Running | SessionState::Stopping)
    }

    fn record_output(&self, line: String) {
        debug!(session = %self.key, "{}", line);
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        output.push(line);
    }

    fn on_exit(&self, status: std::io::Result<ExitStatus>) {
        let previous = self.set_state(SessionState::Stopped);
        match previous {
            SessionState::Running => {
                self.closed.store(true, Ordering::SeqCst);
                warn!("Dev mode for {} exited unexpectedly: {:?}", self.key, status);
            }
            SessionState::Stopped => {
                debug!("Dev mode for {} reaped after cleanup: {:?}", self.key, status);
            }
            _ => info!("Dev mode for {} stopped: {:?}", self.key, status),
        }
    }
}

pub struct SessionController {
    sessions: Mutex<HashMap<SessionKey, Arc<ProcessSession>>>,
    listeners: CloseListeners,
    output_lines: usize,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl SessionController {
    pub fn new(output_lines: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            listeners: CloseListeners::new(),
            output_lines,
        }
    }

    pub fn listeners(&self) -> &CloseListeners {
        &self.listeners
    }

    fn get(&self, key: &SessionKey) -> Option<Arc<ProcessSession>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(key).cloned()
    }

    /// Spawn `command` through the platform shell in `working_dir`.
    ///
    /// Returns as soon as the process is running; it is reaped in the
    /// background. A stopped or closed session under the same key is cleaned
    /// up first.
    pub async fn start(
        &self,
        key: &SessionKey,
        command: &str,
        working_dir: &Path,
        env: &[String],
    ) -> Result<()> {
        let vars = parse_env(env)?;

        if let Some(existing) = self.get(key) {
            if existing.occupies_key() {
                return Err(DevModeError::AlreadyRunning(key.clone()));
            }
            info!("Replacing finished dev mode session for {}", key);
            self.cleanup(key).await;
        }

        let session = Arc::new(ProcessSession::new(key.clone(), self.output_lines));
        let mut io = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = sessions.get(key) {
                if existing.occupies_key() {
                    return Err(DevModeError::AlreadyRunning(key.clone()));
                }
            }
            // Fresh mutex that nobody else has seen yet
            let io = session
                .io
                .clone()
                .try_lock_owned()
                .map_err(|_| DevModeError::AlreadyRunning(key.clone()))?;
            sessions.insert(key.clone(), Arc::clone(&session));
            io
        };

        let mut child = match shell_command(command)
            .current_dir(working_dir)
            .envs(vars)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                self.remove_if_same(key, &session);
                return Err(DevModeError::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        *session.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
        io.stdin = child.stdin.take();

        if let Some(stdout) = child.stdout.take() {
            forward_output(Arc::clone(&session), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(Arc::clone(&session), stderr);
        }

        session.set_state(SessionState::Running);
        drop(io);

        tokio::spawn(reap(Arc::clone(&session), child));

        info!("Started dev mode for {} (pid {:?}): {}", key, pid, command);
        Ok(())
    }

    fn remove_if_same(&self, key: &SessionKey, session: &Arc<ProcessSession>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.get(key).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(key);
        }
    }

    /// Send raw text to the process's stdin
    pub async fn write(&self, key: &SessionKey, text: &str) -> Result<()> {
        self.send(key, text, false).await
    }

    /// Ask dev mode to exit; the session becomes `Stopped` once it does
    pub async fn stop(&self, key: &SessionKey) -> Result<()> {
        self.send(key, EXIT_COMMAND, true).await
    }

    pub async fn run_tests(&self, key: &SessionKey) -> Result<()> {
        self.send(key, RUN_TESTS_COMMAND, false).await
    }

    /// Restart the server; the OS process and session bookkeeping stay as is
    pub async fn restart(&self, key: &SessionKey) -> Result<()> {
        self.send(key, RESTART_COMMAND, false).await
    }

    async fn send(&self, key: &SessionKey, text: &str, stopping: bool) -> Result<()> {
        let session = self
            .get(key)
            .ok_or_else(|| DevModeError::NotStarted(key.clone()))?;

        let mut io = session.io.lock().await;
        if !session.process_alive() {
            return Err(DevModeError::NotStarted(key.clone()));
        }
        let stdin = io
            .stdin
            .as_mut()
            .ok_or_else(|| DevModeError::NotStarted(key.clone()))?;

        // Before the write, so the exit it triggers is seen as orderly
        let previous = stopping.then(|| session.set_state(SessionState::Stopping));

        let written = async {
            stdin.write_all(text.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(source) = written {
            if let Some(previous) = previous {
                session
                    .state
                    .compare_exchange(
                        SessionState::Stopping as u8,
                        previous as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .ok();
            }
            return Err(DevModeError::Write {
                key: key.clone(),
                source,
            });
        }

        debug!("Wrote {:?} to {}", text, key);
        Ok(())
    }

    /// Kill the process outright. The session stays registered as `Stopped`
    /// until `cleanup`.
    pub fn terminate(&self, key: &SessionKey) -> Result<()> {
        let session = self
            .get(key)
            .filter(|s| s.process_alive())
            .ok_or_else(|| DevModeError::NotStarted(key.clone()))?;

        session.set_state(SessionState::Stopping);
        session.kill.cancel();
        info!("Terminating dev mode for {}", key);
        Ok(())
    }

    /// True while the process is alive (running or stopping)
    pub fn is_started(&self, key: &SessionKey) -> bool {
        self.get(key).is_some_and(|s| s.process_alive())
    }

    pub fn is_closed(&self, key: &SessionKey) -> bool {
        self.get(key).is_some_and(|s| s.is_closed())
    }

    /// Record that the surface showing this session went away
    pub fn mark_closed(&self, key: &SessionKey) -> bool {
        match self.get(key) {
            Some(session) => {
                session.closed.store(true, Ordering::SeqCst);
                info!("Session {} marked closed", key);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, key: &SessionKey) -> Option<SessionState> {
        self.get(key).map(|s| s.state())
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = sessions
            .values()
            .map(|s| SessionSnapshot {
                key: s.key.clone(),
                state: s.state(),
                closed: s.is_closed(),
                pid: *s.pid.lock().unwrap_or_else(|e| e.into_inner()),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Most recent `lines` of combined stdout/stderr
    pub fn output_tail(&self, key: &SessionKey, lines: usize) -> Option<Vec<String>> {
        self.get(key).map(|s| {
            let output = s.output.lock().unwrap_or_else(|e| e.into_inner());
            output.tail(lines)
        })
    }

    /// Release the session for `key` and run its close listeners.
    ///
    /// Waits for an in-flight write, closes stdin, kills the process if it is
    /// still alive and forgets the session. Returns whether a session was
    /// released; a second call is a no-op.
    pub async fn cleanup(&self, key: &SessionKey) -> bool {
        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(key)
        };

        if let Some(session) = &session {
            let mut io = session.io.lock().await;
            io.stdin = None;
            let previous = session.set_state(SessionState::Stopped);
            if matches!(previous, SessionState::Running | SessionState::Stopping) {
                info!("Killing dev mode process for {} during cleanup", key);
            }
            session.kill.cancel();
        }

        let fired = self.listeners.fire(key);
        if session.is_some() || fired > 0 {
            info!("Cleaned up {} ({} close listeners)", key, fired);
        }
        session.is_some()
    }
}

fn parse_env(env: &[String]) -> Result<Vec<(String, String)>> {
    env.iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(DevModeError::InvalidEnv(entry.clone())),
        })
        .collect()
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

fn forward_output<R>(session: Arc<ProcessSession>, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            session.record_output(line);
        }
    });
}

async fn reap(session: Arc<ProcessSession>, mut child: Child) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = session.kill.cancelled() => {
            child.start_kill().ok();
            child.wait().await
        }
    };
    session.on_exit(status);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    fn cwd() -> std::path::PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let controller = SessionController::default();
        let key = SessionKey::from("proj1");

        controller.start(&key, "sleep 30", &cwd(), &[]).await.unwrap();
        assert!(controller.is_started(&key));

        let err = controller.start(&key, "sleep 30", &cwd(), &[]).await.unwrap_err();
        assert!(matches!(err, DevModeError::AlreadyRunning(_)));
        assert_eq!(controller.state(&key), Some(SessionState::Running));
        assert_eq!(controller.snapshot().len(), 1);

        assert!(controller.cleanup(&key).await);
    }

    #[tokio::test]
    async fn stop_is_orderly() {
        let controller = SessionController::default();
        let key = SessionKey::from("proj1");

        controller
            .start(&key, "read line; echo got $line", &cwd(), &[])
            .await
            .unwrap();
        controller.stop(&key).await.unwrap();

        wait_until(|| controller.state(&key) == Some(SessionState::Stopped)).await;
        assert!(!controller.is_closed(&key));
        assert!(!controller.is_started(&key));
        wait_until(|| {
            controller
                .output_tail(&key, 10)
                .is_some_and(|lines| lines.contains(&"got exit".to_string()))
        })
        .await;

        let err = controller.write(&key, "late\n").await.unwrap_err();
        assert!(matches!(err, DevModeError::NotStarted(_)));
    }

    #[tokio::test]
    async fn unexpected_exit_marks_closed_and_allows_restart() {
        let controller = SessionController::default();
        let key = SessionKey::from("proj1");

        controller.start(&key, "exit 3", &cwd(), &[]).await.unwrap();
        wait_until(|| controller.is_closed(&key)).await;
        assert_eq!(controller.state(&key), Some(SessionState::Stopped));

        controller.start(&key, "sleep 30", &cwd(), &[]).await.unwrap();
        assert!(controller.is_started(&key));
        assert!(!controller.is_closed(&key));
        controller.cleanup(&key).await;
    }

    #[tokio::test]
    async fn env_and_working_dir_reach_the_process() {
        let controller = SessionController::default();
        let key = SessionKey::from("proj1");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();

        controller
            .start(
                &key,
                "ls; echo home=$JAVA_HOME",
                dir.path(),
                &["JAVA_HOME=/opt/jdk".to_string()],
            )
            .await
            .unwrap();

        wait_until(|| {
            controller.output_tail(&key, 10).is_some_and(|lines| {
                lines.contains(&"marker.txt".to_string())
                    && lines.contains(&"home=/opt/jdk".to_string())
            })
        })
        .await;
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let controller = SessionController::default();
        let key = SessionKey::from("proj1");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        controller.listeners().register_on_close(&key, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        controller.start(&key, "sleep 30", &cwd(), &[]).await.unwrap();

        assert!(controller.cleanup(&key).await);
        assert!(!controller.cleanup(&key).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!controller.is_started(&key));
        assert!(controller.snapshot().is_empty());

        let err = controller.restart(&key).await.unwrap_err();
        assert!(matches!(err, DevModeError::NotStarted(_)));
    }

    #[tokio::test]
    async fn terminate_kills_without_closing() {
        let controller = SessionController::default();
        let key = SessionKey::from("proj1");

        controller.start(&key, "sleep 30", &cwd(), &[]).await.unwrap();
        controller.terminate(&key).unwrap();

        wait_until(|| controller.state(&key) == Some(SessionState::Stopped)).await;
        assert!(!controller.is_closed(&key));
        assert!(matches!(
            controller.terminate(&key),
            Err(DevModeError::NotStarted(_))
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_env() {
        let controller = SessionController::default();
        let key = SessionKey::from("proj1");
        let err = controller
            .start(&key, "true", &cwd(), &["JAVA_HOME".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DevModeError::InvalidEnv(_)));
        assert!(controller.state(&key).is_none());
    }
}
