// Project descriptors and command resolution
//
// Both are boundaries: the core only needs a build type, a root path and a
// way to find the server directory, plus an opaque command string to run.

use crate::build_type::{BuildType, StartMode};
use crate::error::{DevModeError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait Project: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn path(&self) -> &Path;

    fn build_type(&self) -> BuildType;

    /// Directory of the server the dev-mode process runs, which holds the
    /// generated `server.env`.
    fn server_dir(&self) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct LibertyProject {
    name: String,
    path: PathBuf,
    build_type: BuildType,
}

impl LibertyProject {
    pub fn new(path: impl Into<PathBuf>, build_type: BuildType) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            build_type,
        }
    }

    /// Describe the project rooted at `path`, detecting its build tool
    pub fn discover(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let build_type =
            BuildType::detect(&path).ok_or_else(|| DevModeError::UnsupportedProject(path.clone()))?;
        Ok(Self::new(path, build_type))
    }
}

impl Project for LibertyProject {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    fn server_dir(&self) -> Result<PathBuf> {
        let config = self
            .path
            .join(self.build_type.build_dir())
            .join(self.build_type.plugin_config_file());

        match std::fs::read_to_string(&config) {
            Ok(xml) => {
                let dir = element_text(&xml, "serverDirectory")
                    .map_err(|source| DevModeError::Xml {
                        path: config.clone(),
                        source,
                    })?;
                if let Some(dir) = dir {
                    return Ok(self.path.join(dir));
                }
                debug!("{} has no serverDirectory, using default", config.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not generated yet, using default", config.display());
            }
            Err(source) => return Err(DevModeError::ReadFile { path: config, source }),
        }

        Ok(self.path.join(self.build_type.default_server_dir()))
    }
}

/// Trimmed text of the first `element` in the document, entities decoded
pub fn element_text(
    xml: &str,
    element: &str,
) -> std::result::Result<Option<String>, roxmltree::Error> {
    let doc = roxmltree::Document::parse(xml)?;
    let text = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == element)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);
    Ok(text)
}

/// Produces the full command line that starts dev mode for a project
pub trait CommandResolver: Send + Sync {
    fn resolve(&self, project: &dyn Project, mode: StartMode, params: &str) -> Result<String>;
}

/// Prefers a wrapper script in the project root, otherwise the tool on PATH
#[derive(Debug, Clone, Default)]
pub struct BuildToolCommandResolver;

impl BuildToolCommandResolver {
    fn executable(project: &dyn Project) -> String {
        let build_type = project.build_type();
        build_type
            .wrapper_names()
            .iter()
            .map(|name| project.path().join(name))
            .find(|candidate| candidate.is_file())
            .map(|wrapper| quote(&wrapper.display().to_string()))
            .unwrap_or_else(|| build_type.launcher().to_string())
    }
}

impl CommandResolver for BuildToolCommandResolver {
    fn resolve(&self, project: &dyn Project, mode: StartMode, params: &str) -> Result<String> {
        let build_type = project.build_type();
        let mut command = format!("{} {}", Self::executable(project), build_type.dev_goal(mode));

        match build_type {
            BuildType::Maven => {
                let pom = project.path().join("pom.xml");
                command.push_str(&format!(" -f {}", quote(&pom.display().to_string())));
            }
            BuildType::Gradle => {
                command.push_str(&format!(
                    " -p {}",
                    quote(&project.path().display().to_string())
                ));
            }
        }

        let params = params.trim();
        if !params.is_empty() {
            command.push(' ');
            command.push_str(params);
        }

        debug!("Resolved dev mode command for {}: {}", project.name(), command);
        Ok(command)
    }
}

fn quote(s: &str) -> String {
    if s.contains(char::is_whitespace) {
        format!("\"{}\"", s)
    } else {
        s.to_string()
    }
}
