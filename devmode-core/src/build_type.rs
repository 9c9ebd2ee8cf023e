// Everything that differs between the supported build tools
//
// Callers ask the `BuildType` for the flag, directory or goal they need
// rather than branching on the tool themselves.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    Maven,
    Gradle,
}

/// How the dev-mode process should be run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    #[default]
    Run,
    /// Run the server inside a container
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestReportKind {
    Unit,
    Integration,
}

impl BuildType {
    /// Identify the build tool from the files in a project directory
    pub fn detect(dir: &Path) -> Option<Self> {
        if dir.join("pom.xml").is_file() {
            Some(BuildType::Maven)
        } else if dir.join("build.gradle").is_file() || dir.join("build.gradle.kts").is_file() {
            Some(BuildType::Gradle)
        } else {
            None
        }
    }

    /// Prefix of the dev-mode parameter that pins the debug port
    pub fn debug_port_flag(self) -> &'static str {
        match self {
            BuildType::Maven => "-DdebugPort=",
            BuildType::Gradle => "--libertyDebugPort=",
        }
    }

    /// Output directory, relative to the project root
    pub fn build_dir(self) -> &'static str {
        match self {
            BuildType::Maven => "target",
            BuildType::Gradle => "build",
        }
    }

    /// Plugin-generated file naming the server directory, inside `build_dir()`
    pub fn plugin_config_file(self) -> &'static str {
        "liberty-plugin-config.xml"
    }

    /// Server directory used when the plugin configuration is missing
    pub fn default_server_dir(self) -> &'static str {
        match self {
            BuildType::Maven => "target/liberty/wlp/usr/servers/defaultServer",
            BuildType::Gradle => "build/wlp/usr/servers/defaultServer",
        }
    }

    pub fn dev_goal(self, mode: StartMode) -> &'static str {
        match (self, mode) {
            (BuildType::Maven, StartMode::Run) => "io.openliberty.tools:liberty-maven-plugin:dev",
            (BuildType::Maven, StartMode::Container) => {
                "io.openliberty.tools:liberty-maven-plugin:devc"
            }
            (BuildType::Gradle, StartMode::Run) => "libertyDev",
            (BuildType::Gradle, StartMode::Container) => "libertyDevc",
        }
    }

    /// Executable looked up on PATH when the project has no wrapper
    pub fn launcher(self) -> &'static str {
        match (self, cfg!(windows)) {
            (BuildType::Maven, false) => "mvn",
            (BuildType::Maven, true) => "mvn.cmd",
            (BuildType::Gradle, false) => "gradle",
            (BuildType::Gradle, true) => "gradle.bat",
        }
    }

    /// Wrapper scripts checked in the project root, in preference order
    pub fn wrapper_names(self) -> &'static [&'static str] {
        match (self, cfg!(windows)) {
            (BuildType::Maven, false) => &["mvnw"],
            (BuildType::Maven, true) => &["mvnw.cmd"],
            (BuildType::Gradle, false) => &["gradlew"],
            (BuildType::Gradle, true) => &["gradlew.bat"],
        }
    }

    /// Candidate report locations relative to the project root
    pub fn test_report_paths(self, kind: TestReportKind) -> &'static [&'static str] {
        match (self, kind) {
            (BuildType::Maven, TestReportKind::Unit) => {
                &["target/site/surefire-report.html", "target/reports/surefire.html"]
            }
            (BuildType::Maven, TestReportKind::Integration) => {
                &["target/site/failsafe-report.html", "target/reports/failsafe.html"]
            }
            (BuildType::Gradle, TestReportKind::Unit) => &["build/reports/tests/test/index.html"],
            (BuildType::Gradle, TestReportKind::Integration) => {
                &["build/reports/tests/test/index.html"]
            }
        }
    }

    /// The value of the debug-port flag in `params`, if present. Returns the
    /// raw text so the caller can decide what an unparseable value means.
    pub fn find_debug_port<'a>(self, params: &'a str) -> Option<&'a str> {
        let flag = self.debug_port_flag();
        params
            .split_whitespace()
            .filter_map(|token| token.strip_prefix(flag))
            .last()
    }

    /// `params` with the debug-port flag appended, unless one is already there
    pub fn with_debug_port(self, params: &str, port: u16) -> String {
        if self.find_debug_port(params).is_some() {
            return params.to_string();
        }
        let flag = format!("{}{}", self.debug_port_flag(), port);
        if params.trim().is_empty() {
            flag
        } else {
            format!("{} {}", params.trim_end(), flag)
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildType::Maven => f.write_str("maven"),
            BuildType::Gradle => f.write_str("gradle"),
        }
    }
}
