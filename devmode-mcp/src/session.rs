// Dev-mode context
//
// Owns the session controller, launch context and attacher for the lifetime
// of the server and wires tool calls through them. Projects are keyed by
// their canonical path.

use anyhow::{anyhow, bail, Context, Result};
use devmode_core::port::{self, NegotiatedPort, PortOrigin};
use devmode_core::{
    AttachHandle, AttachOutcome, AttachPhase, AttachRequest, Attacher, BuildToolCommandResolver,
    CommandResolver, DevModeConfig, LaunchContext, LibertyProject, Project, ServerEnvLookup,
    SessionController, SessionKey, SessionState, StartMode, TestReportKind,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub key: SessionKey,
    pub command: String,
    pub debug_port: Option<NegotiatedPort>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub key: SessionKey,
    pub state: SessionState,
    pub closed: bool,
    pub pid: Option<u32>,
    pub attach_phase: Option<AttachPhase>,
    /// Why the latest attach attempt failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_error: Option<String>,
    pub debug_target: Option<String>,
}

pub struct DevModeContext {
    config: DevModeConfig,
    controller: Arc<SessionController>,
    launches: Arc<LaunchContext>,
    attacher: Arc<Attacher>,
    resolver: Box<dyn CommandResolver>,
    projects: Mutex<HashMap<SessionKey, Arc<LibertyProject>>>,
}

impl DevModeContext {
    pub fn new(config: DevModeConfig) -> Self {
        Self::with_resolver(config, Box::new(BuildToolCommandResolver))
    }

    pub fn with_resolver(config: DevModeConfig, resolver: Box<dyn CommandResolver>) -> Self {
        let controller = Arc::new(SessionController::new(config.output_buffer_lines));
        let launches = LaunchContext::new();
        let attacher = Attacher::new(
            Arc::clone(&controller),
            Arc::clone(&launches),
            config.attach.clone(),
        );
        Self {
            config,
            controller,
            launches,
            attacher,
            resolver,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DevModeConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// Describe the project at `path` and remember it under its key
    pub fn open_project(&self, path: &str) -> Result<(SessionKey, Arc<LibertyProject>)> {
        let path = canonical(path)?;
        let key = SessionKey::new(path.display().to_string());

        let mut projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(project) = projects.get(&key) {
            return Ok((key, Arc::clone(project)));
        }
        let project = Arc::new(LibertyProject::discover(&path)?);
        projects.insert(key.clone(), Arc::clone(&project));
        Ok((key, project))
    }

    pub async fn start(
        &self,
        path: &str,
        params: &str,
        debug: bool,
        mode: StartMode,
    ) -> Result<StartReport> {
        let (key, project) = self.open_project(path)?;
        let build_type = project.build_type();

        let mut params = params.to_string();
        let mut debug_port = None;
        if debug {
            let negotiated = port::negotiate(project.as_ref(), &params)?;
            params = build_type.with_debug_port(&params, negotiated.port);
            debug_port = Some(negotiated);
        }

        let command = self.resolver.resolve(project.as_ref(), mode, &params)?;
        self.controller
            .start(&key, &command, project.path(), &self.config.process_env())
            .await?;

        if let Some(negotiated) = debug_port {
            // An unusable user-supplied flag stays in the command line, so
            // only the published address can say where the debuggee went.
            let known = negotiated.origin == PortOrigin::UserSupplied
                || build_type.find_debug_port(&params) == Some(negotiated.port.to_string().as_str());
            self.attach_project(&key, project, known.then_some(negotiated.port));
        }

        Ok(StartReport {
            key,
            command,
            debug_port,
        })
    }

    /// Start an attach attempt for an opened project
    pub fn attach(&self, path: &str, port: Option<u16>) -> Result<AttachHandle> {
        let (key, project) = self.open_project(path)?;
        Ok(self.attach_project(&key, project, port))
    }

    fn attach_project(
        &self,
        key: &SessionKey,
        project: Arc<LibertyProject>,
        port: Option<u16>,
    ) -> AttachHandle {
        self.attacher.attach(AttachRequest {
            key: key.clone(),
            host: self.config.debug_host.clone(),
            port,
            lookup: Arc::new(ServerEnvLookup::new(project)),
            relaunch_on_disconnect: true,
        })
    }

    /// Terminate the debug target without relaunching it
    pub async fn detach(&self, path: &str) -> Result<()> {
        let (key, _) = self.open_project(path)?;
        let cancelled = self.attacher.cancel(&key);
        if !self.launches.detach(&key).await && !cancelled {
            bail!("no debugger attached to {}", key);
        }
        Ok(())
    }

    pub async fn cleanup(&self, path: &str) -> Result<bool> {
        let (key, _) = self.open_project(path)?;
        let released = self.controller.cleanup(&key).await;
        self.launches.detach(&key).await;
        info!("Released {}", key);
        Ok(released)
    }

    pub fn status(&self, path: Option<&str>) -> Result<Vec<SessionStatus>> {
        let only = path.map(|p| self.open_project(p)).transpose()?.map(|(key, _)| key);

        Ok(self
            .controller
            .snapshot()
            .into_iter()
            .filter(|s| only.as_ref().map_or(true, |key| key == &s.key))
            .map(|s| {
                let attempt = self.attacher.latest(&s.key);
                let attach_error = match attempt.as_ref().and_then(AttachHandle::finished_outcome) {
                    Some(AttachOutcome::Failed(e)) => Some(e.to_string()),
                    _ => None,
                };
                SessionStatus {
                    attach_phase: attempt.map(|h| h.phase()),
                    attach_error,
                    debug_target: self
                        .launches
                        .get(&s.key)
                        .map(|t| t.connection_id().to_string()),
                    key: s.key,
                    state: s.state,
                    closed: s.closed,
                    pid: s.pid,
                }
            })
            .collect())
    }

    /// First report of `kind` that exists on disk
    pub fn test_report(&self, path: &str, kind: TestReportKind) -> Result<PathBuf> {
        let (_, project) = self.open_project(path)?;
        project
            .build_type()
            .test_report_paths(kind)
            .iter()
            .map(|relative| project.path().join(relative))
            .find(|report| report.is_file())
            .ok_or_else(|| anyhow!("no {:?} test report found for {}", kind, project.name()))
    }

    pub fn session_key(&self, path: &str) -> Result<SessionKey> {
        self.open_project(path).map(|(key, _)| key)
    }
}

fn canonical(path: &str) -> Result<PathBuf> {
    Path::new(path)
        .canonicalize()
        .with_context(|| format!("project directory {} not found", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmode_core::{AttachPolicy, DevModeError};

    /// Runs a shell line instead of a build tool
    struct ScriptResolver(&'static str);

    impl CommandResolver for ScriptResolver {
        fn resolve(
            &self,
            _project: &dyn Project,
            _mode: StartMode,
            params: &str,
        ) -> devmode_core::Result<String> {
            Ok(format!("{} {}", self.0, params))
        }
    }

    fn maven_project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        dir
    }

    #[test]
    fn project_key_is_canonical_path() {
        let dir = maven_project();
        let context = DevModeContext::new(DevModeConfig::default());

        let nested = dir.path().join(".");
        let key = context.session_key(&nested.display().to_string()).unwrap();
        assert_eq!(
            key.as_str(),
            dir.path().canonicalize().unwrap().display().to_string()
        );
        assert!(context.session_key("/definitely/not/here").is_err());
    }

    #[test]
    fn finds_existing_test_report() {
        let dir = maven_project();
        let context = DevModeContext::new(DevModeConfig::default());
        let path = dir.path().display().to_string();

        assert!(context.test_report(&path, TestReportKind::Unit).is_err());

        let reports = dir.path().join("target/reports");
        std::fs::create_dir_all(&reports).unwrap();
        std::fs::write(reports.join("surefire.html"), "").unwrap();
        let found = context.test_report(&path, TestReportKind::Unit).unwrap();
        assert!(found.ends_with("target/reports/surefire.html"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_passes_debug_port_and_java_home() {
        let dir = maven_project();
        let config = DevModeConfig {
            java_home: Some(PathBuf::from("/opt/jdk")),
            ..DevModeConfig::default()
        };
        let context = DevModeContext::with_resolver(
            config,
            Box::new(ScriptResolver("echo $JAVA_HOME; sleep 30 #")),
        );
        let path = dir.path().display().to_string();

        let report = context
            .start(&path, "-DdebugPort=5005", true, StartMode::Run)
            .await
            .unwrap();
        assert_eq!(report.debug_port.map(|p| p.port), Some(5005));
        assert!(report.command.ends_with("-DdebugPort=5005"));

        let err = context
            .start(&path, "", false, StartMode::Run)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DevModeError>(),
            Some(DevModeError::AlreadyRunning(_))
        ));

        let status = context.status(Some(&path)).unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, SessionState::Running);
        assert!(status[0].attach_phase.is_some());
        assert_eq!(status[0].attach_error, None);

        assert!(context.cleanup(&path).await.unwrap());
        assert!(context.status(None).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn status_reports_why_attach_failed() {
        let dir = maven_project();
        let config = DevModeConfig {
            debug_host: "127.0.0.1".to_string(),
            attach: AttachPolicy {
                probe_interval_ms: 10,
                probe_max_attempts: 2,
                ..AttachPolicy::default()
            },
            ..DevModeConfig::default()
        };
        let context = DevModeContext::with_resolver(config, Box::new(ScriptResolver("sleep 30 #")));
        let path = dir.path().display().to_string();
        context.start(&path, "", false, StartMode::Run).await.unwrap();

        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let handle = context.attach(&path, Some(port)).unwrap();
        assert!(matches!(handle.outcome().await, AttachOutcome::Failed(_)));

        let status = context.status(Some(&path)).unwrap();
        assert_eq!(status[0].attach_phase, Some(AttachPhase::Failed));
        let error = status[0].attach_error.as_deref().unwrap();
        assert!(error.contains("not listening"), "{}", error);

        assert!(context.cleanup(&path).await.unwrap());
    }
}
