// Dev-mode tool schema definitions
//
// MCP tools for running dev mode and attaching a debugger to it

use crate::protocol::Tool;
use serde_json::json;

fn project_only(name: &str, description: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "project": {
                    "type": "string",
                    "description": "Project root directory (contains pom.xml or build.gradle)"
                }
            },
            "required": ["project"]
        }),
    }
}

pub fn get_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "devmode.start".to_string(),
            description: "Start dev mode for a project, optionally attaching a debugger".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project": {
                        "type": "string",
                        "description": "Project root directory (contains pom.xml or build.gradle)"
                    },
                    "params": {
                        "type": "string",
                        "description": "Extra build tool parameters (e.g., '-DhotTests=true')",
                        "default": ""
                    },
                    "debug": {
                        "type": "boolean",
                        "description": "Negotiate a debug port and attach once the JVM listens",
                        "default": false
                    },
                    "container": {
                        "type": "boolean",
                        "description": "Run the server in a container",
                        "default": false
                    }
                },
                "required": ["project"]
            }),
        },
        project_only("devmode.stop", "Ask dev mode to exit"),
        project_only("devmode.run_tests", "Run the project's tests in the running dev mode"),
        project_only(
            "devmode.restart",
            "Restart the server inside dev mode (e.g., after a failed hot code replace)",
        ),
        Tool {
            name: "devmode.attach".to_string(),
            description: "Attach a debugger to the dev-mode JVM".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project": {
                        "type": "string",
                        "description": "Project root directory"
                    },
                    "port": {
                        "type": "integer",
                        "description": "Debug port; read from the server's server.env when omitted"
                    }
                },
                "required": ["project"]
            }),
        },
        project_only("devmode.detach", "Detach the debugger without relaunching it"),
        Tool {
            name: "devmode.status".to_string(),
            description: "Session state, attach phase and debug target per project".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project": {
                        "type": "string",
                        "description": "Limit to one project (optional)"
                    }
                }
            }),
        },
        Tool {
            name: "devmode.output".to_string(),
            description: "Recent dev-mode console output".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project": {
                        "type": "string",
                        "description": "Project root directory"
                    },
                    "lines": {
                        "type": "integer",
                        "description": "Number of trailing lines",
                        "default": 50
                    }
                },
                "required": ["project"]
            }),
        },
        project_only(
            "devmode.cleanup",
            "Release the session, killing the process if it is still running",
        ),
        Tool {
            name: "devmode.wait_reachable".to_string(),
            description: "Wait until something listens on host:port".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "host": {
                        "type": "string",
                        "description": "Host (e.g., 'localhost')",
                        "default": "localhost"
                    },
                    "port": {
                        "type": "integer",
                        "description": "TCP port (e.g., 9080)"
                    },
                    "payload": {
                        "type": "string",
                        "description": "Text written once connected",
                        "default": ""
                    }
                },
                "required": ["port"]
            }),
        },
        Tool {
            name: "devmode.test_report".to_string(),
            description: "Path of the latest unit or integration test report".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "project": {
                        "type": "string",
                        "description": "Project root directory"
                    },
                    "kind": {
                        "type": "string",
                        "enum": ["unit", "integration"],
                        "default": "unit"
                    }
                },
                "required": ["project"]
            }),
        },
    ]
}
