// Dev-mode session and debugger-attach orchestration
//
// - Session controller: one external dev-mode process per project key
// - Readiness prober and debug port negotiation
// - Attach state machine feeding a launch context of live debug targets
// - Close listeners tying attach attempts to session teardown

pub mod attach;
pub mod build_type;
pub mod config;
pub mod error;
pub mod listeners;
pub mod port;
pub mod probe;
pub mod process;
pub mod project;
pub mod target;

pub use attach::{AttachHandle, AttachOutcome, AttachPhase, AttachRequest, Attacher};
pub use build_type::{BuildType, StartMode, TestReportKind};
pub use config::{AttachPolicy, DevModeConfig, ProbePolicy};
pub use error::{AttachError, DevModeError, ProbeError, Result};
pub use listeners::{CloseListeners, ListenerId};
pub use port::{NegotiatedPort, PortLookup, PortOrigin, ServerEnvLookup};
pub use probe::{probe, ProbeStatus};
pub use process::{SessionController, SessionKey, SessionSnapshot, SessionState};
pub use project::{BuildToolCommandResolver, CommandResolver, LibertyProject, Project};
pub use target::{DebugTarget, DisconnectReason, LaunchContext, TargetInfo};
