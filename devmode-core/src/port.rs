// Debug port negotiation
//
// Before dev mode starts we pick the port the debuggee should listen on:
// whatever the user pinned with the build tool's debug-port flag, or a
// free ephemeral port. The debuggee may still end up elsewhere if that
// port is taken, so `reread` recovers the address it actually published
// in the server's generated `server.env`.

use crate::error::{DevModeError, Result};
use crate::project::Project;
use serde::Serialize;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key in `server.env` holding `port` or `host:port`
pub const DEBUG_ADDRESS_KEY: &str = "WLP_DEBUG_ADDRESS";

pub const SERVER_ENV_FILE: &str = "server.env";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortOrigin {
    /// Taken from the caller's dev-mode parameters
    UserSupplied,
    /// Picked by the OS from a momentary bind
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NegotiatedPort {
    pub port: u16,
    pub origin: PortOrigin,
}

/// Decide which port the debuggee should be asked to use
pub fn negotiate(project: &dyn Project, params: &str) -> Result<NegotiatedPort> {
    let build_type = project.build_type();

    if let Some(raw) = build_type.find_debug_port(params) {
        match parse_port(raw) {
            Ok(port) => {
                debug!("Using debug port {} from {} parameters", port, build_type);
                return Ok(NegotiatedPort {
                    port,
                    origin: PortOrigin::UserSupplied,
                });
            }
            Err(_) => warn!(
                "Ignoring unparseable {}{} for {}",
                build_type.debug_port_flag(),
                raw,
                project.name()
            ),
        }
    }

    let port = allocate_ephemeral_port()?;
    info!("Allocated debug port {} for {}", port, project.name());
    Ok(NegotiatedPort {
        port,
        origin: PortOrigin::Ephemeral,
    })
}

/// Bind port 0, read what the OS assigned, release it
pub fn allocate_ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(DevModeError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(DevModeError::PortAllocation)?
        .port();
    drop(listener);
    Ok(port)
}

/// Port the debuggee most recently published for `project`
pub fn reread(project: &dyn Project) -> Result<u16> {
    let path = project.server_dir()?.join(SERVER_ENV_FILE);
    read_debug_port(&path)
}

pub fn read_debug_port(path: &Path) -> Result<u16> {
    let contents = std::fs::read_to_string(path).map_err(|source| DevModeError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let value = last_debug_address(&contents).ok_or_else(|| DevModeError::DebugAddressMissing {
        path: path.to_path_buf(),
        key: DEBUG_ADDRESS_KEY,
    })?;
    parse_port(value)
}

/// Value of the last `WLP_DEBUG_ADDRESS=` line. The debuggee appends a new
/// entry when it has to move, so later lines supersede earlier ones.
pub fn last_debug_address(contents: &str) -> Option<&str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| key.trim() == DEBUG_ADDRESS_KEY)
        .map(|(_, value)| value.trim())
        .last()
}

/// Accepts `port` or `host:port`
pub fn parse_port(value: &str) -> Result<u16> {
    let port = value.rsplit(':').next().unwrap_or(value).trim();
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(DevModeError::InvalidPort(value.to_string())),
    }
}

/// Where an attach attempt goes to (re)discover the debug port
pub trait PortLookup: Send + Sync {
    fn reread(&self) -> Result<u16>;
}

/// Reads the published port from a project's `server.env`
#[derive(Debug, Clone)]
pub struct ServerEnvLookup {
    project: Arc<dyn Project>,
}

impl ServerEnvLookup {
    pub fn new(project: Arc<dyn Project>) -> Self {
        Self { project }
    }
}

impl PortLookup for ServerEnvLookup {
    fn reread(&self) -> Result<u16> {
        reread(self.project.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_type::BuildType;
    use crate::project::LibertyProject;

    #[test]
    fn last_matching_line_wins() {
        let env = "\
WLP_DEBUG_ADDRESS=7777
# WLP_DEBUG_ADDRESS=1111
JAVA_OPTS=-Xmx1g
WLP_DEBUG_ADDRESS = localhost:7778
";
        assert_eq!(last_debug_address(env), Some("localhost:7778"));
        assert_eq!(parse_port(last_debug_address(env).unwrap()).unwrap(), 7778);
        assert_eq!(last_debug_address("JAVA_OPTS=x"), None);
    }

    #[test]
    fn rejects_bad_ports() {
        assert!(parse_port("0").is_err());
        assert!(parse_port("70000").is_err());
        assert!(parse_port("host:").is_err());
        assert_eq!(parse_port("*:5005").unwrap(), 5005);
    }

    #[test]
    fn unparseable_user_port_falls_back_to_ephemeral() {
        let project = LibertyProject::new("/nonexistent/app", BuildType::Gradle);
        let negotiated = negotiate(&project, "--libertyDebugPort=abc").unwrap();
        assert_eq!(negotiated.origin, PortOrigin::Ephemeral);
        assert_ne!(negotiated.port, 0);
    }

    #[test]
    fn flag_for_other_build_tool_is_ignored() {
        let project = LibertyProject::new("/nonexistent/app", BuildType::Gradle);
        let negotiated = negotiate(&project, "-DdebugPort=5005").unwrap();
        assert_eq!(negotiated.origin, PortOrigin::Ephemeral);
    }

    #[test]
    fn reread_uses_server_dir() {
        let dir = tempfile::tempdir().unwrap();
        let project = LibertyProject::new(dir.path(), BuildType::Maven);
        assert!(matches!(reread(&project), Err(DevModeError::ReadFile { .. })));

        let server_dir = dir.path().join(BuildType::Maven.default_server_dir());
        std::fs::create_dir_all(&server_dir).unwrap();
        std::fs::write(server_dir.join(SERVER_ENV_FILE), "keystore_password=x\n").unwrap();
        assert!(matches!(
            reread(&project),
            Err(DevModeError::DebugAddressMissing { .. })
        ));

        std::fs::write(
            server_dir.join(SERVER_ENV_FILE),
            "WLP_DEBUG_ADDRESS=6001\nWLP_DEBUG_ADDRESS=6002\n",
        )
        .unwrap();
        let lookup = ServerEnvLookup::new(Arc::new(project));
        assert_eq!(lookup.reread().unwrap(), 6002);
    }
}
