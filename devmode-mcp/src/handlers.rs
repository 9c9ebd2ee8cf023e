// MCP request handlers
//
// Handles initialize, list tools, and dev-mode tool execution

use crate::protocol::*;
use crate::session::DevModeContext;
use crate::tools;
use devmode_core::{probe, DevModeConfig, ProbeStatus, StartMode, TestReportKind};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_OUTPUT_LINES: usize = 50;

pub struct RequestHandler {
    context: DevModeContext,
    /// Requests still being handled, keyed by their JSON-RPC id
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl RequestHandler {
    pub fn new(config: DevModeConfig) -> Self {
        Self {
            context: DevModeContext::new(config),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.to_string();
        let cancel = self.track(&request.id);

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params),
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(request.params, &cancel).await,
            _ => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )),
        };

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(error) => JsonRpcResponse::failure(request.id, error),
        }
    }

    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                info!("Client initialized");
            }
            "notifications/cancelled" => {
                match notification.params.as_ref().and_then(|p| p.get("requestId")) {
                    Some(id) => self.cancel_request(id),
                    None => warn!("Cancellation without a requestId"),
                }
            }
            _ => {
                warn!("Unknown notification: {}", notification.method);
            }
        }
    }

    /// Cancellation token for request `id`, registered on first use so a
    /// cancel that arrives before the handler starts is not lost
    pub fn track(&self, id: &Value) -> CancellationToken {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn cancel_request(&self, id: &Value) {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match in_flight.get(&id.to_string()) {
            Some(cancel) => {
                info!("Cancelling request {}", id);
                cancel.cancel();
            }
            None => debug!("Request {} already finished", id),
        }
    }

    /// Stop everything still running, used when the client goes away
    pub fn cancel_all(&self) {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        for cancel in in_flight.values() {
            cancel.cancel();
        }
    }

    fn handle_initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("Invalid initialize params: {}", e)))?;
        if let Some(client) = params.client_info {
            info!("Client: {} {}", client.name, client.version.unwrap_or_default());
        }

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {},
            },
            server_info: ServerInfo {
                name: "devmode-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Liberty dev mode server. Start with devmode.start (set debug to attach \
                a debugger), watch progress with devmode.status and devmode.output, \
                and release the project with devmode.cleanup when done."
                    .to_string(),
            ),
        };

        to_json(&result)
    }

    fn handle_list_tools(&self) -> Result<Value, JsonRpcError> {
        to_json(&ListToolsResult {
            tools: tools::get_tools(),
        })
    }

    async fn handle_call_tool(
        &self,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, JsonRpcError> {
        let call_params: CallToolParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("Invalid tool call params: {}", e)))?;

        let args = &call_params.arguments;
        let result = match call_params.name.as_str() {
            "devmode.start" => self.handle_start(args).await,
            "devmode.stop" => self.handle_stop(args).await,
            "devmode.run_tests" => self.handle_run_tests(args).await,
            "devmode.restart" => self.handle_restart(args).await,
            "devmode.attach" => self.handle_attach(args),
            "devmode.detach" => self.handle_detach(args).await,
            "devmode.status" => self.handle_status(args),
            "devmode.output" => self.handle_output(args),
            "devmode.cleanup" => self.handle_cleanup(args).await,
            "devmode.wait_reachable" => self.handle_wait_reachable(args, cancel).await,
            "devmode.test_report" => self.handle_test_report(args),
            _ => Err(format!("Unknown tool: {}", call_params.name)),
        };

        let call_result = match result {
            Ok(text) => CallToolResult {
                content: vec![ContentBlock::Text { text }],
                is_error: None,
            },
            Err(text) => {
                warn!("{} failed: {}", call_params.name, text);
                CallToolResult {
                    content: vec![ContentBlock::Text { text }],
                    is_error: Some(true),
                }
            }
        };
        to_json(&call_result)
    }

    async fn handle_start(&self, args: &Value) -> Result<String, String> {
        let project = required_str(args, "project")?;
        let params = args.get("params").and_then(Value::as_str).unwrap_or("");
        let debug = args.get("debug").and_then(Value::as_bool).unwrap_or(false);
        let mode = if args.get("container").and_then(Value::as_bool).unwrap_or(false) {
            StartMode::Container
        } else {
            StartMode::Run
        };

        let report = self
            .context
            .start(project, params, debug, mode)
            .await
            .map_err(|e| format!("{:#}", e))?;

        let mut text = format!("Started dev mode for {}\n   Command: {}", report.key, report.command);
        if let Some(port) = report.debug_port {
            text.push_str(&format!(
                "\n   Debug port: {} ({:?}), attaching in the background",
                port.port, port.origin
            ));
        }
        Ok(text)
    }

    async fn handle_stop(&self, args: &Value) -> Result<String, String> {
        let key = self.key(args)?;
        self.context
            .controller()
            .stop(&key)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Stopping dev mode for {}", key))
    }

    async fn handle_run_tests(&self, args: &Value) -> Result<String, String> {
        let key = self.key(args)?;
        self.context
            .controller()
            .run_tests(&key)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Running tests for {}", key))
    }

    async fn handle_restart(&self, args: &Value) -> Result<String, String> {
        let key = self.key(args)?;
        self.context
            .controller()
            .restart(&key)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Restarting server for {}", key))
    }

    fn handle_attach(&self, args: &Value) -> Result<String, String> {
        let project = required_str(args, "project")?;
        let port = match args.get("port").and_then(Value::as_u64) {
            Some(port) => Some(u16::try_from(port).map_err(|_| format!("Invalid port: {}", port))?),
            None => None,
        };

        let handle = self
            .context
            .attach(project, port)
            .map_err(|e| format!("{:#}", e))?;
        Ok(format!(
            "Attaching debugger to {} ({}); devmode.status reports the outcome",
            handle.key(),
            port.map_or_else(|| "port from server.env".to_string(), |p| format!("port {}", p))
        ))
    }

    async fn handle_detach(&self, args: &Value) -> Result<String, String> {
        let project = required_str(args, "project")?;
        self.context
            .detach(project)
            .await
            .map_err(|e| format!("{:#}", e))?;
        Ok(format!("Debugger detached from {}", project))
    }

    fn handle_status(&self, args: &Value) -> Result<String, String> {
        let project = args.get("project").and_then(Value::as_str);
        let status = self
            .context
            .status(project)
            .map_err(|e| format!("{:#}", e))?;
        if status.is_empty() {
            return Ok("No dev mode sessions".to_string());
        }
        pretty(&status)
    }

    fn handle_output(&self, args: &Value) -> Result<String, String> {
        let key = self.key(args)?;
        let lines = args
            .get("lines")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_OUTPUT_LINES, |n| n as usize);

        let output = self
            .context
            .controller()
            .output_tail(&key, lines)
            .ok_or_else(|| format!("dev mode has not been started for {}", key))?;
        Ok(output.join("\n"))
    }

    async fn handle_cleanup(&self, args: &Value) -> Result<String, String> {
        let project = required_str(args, "project")?;
        let released = self
            .context
            .cleanup(project)
            .await
            .map_err(|e| format!("{:#}", e))?;
        Ok(if released {
            format!("Released dev mode session for {}", project)
        } else {
            format!("No dev mode session for {}", project)
        })
    }

    async fn handle_wait_reachable(
        &self,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let host = args.get("host").and_then(Value::as_str).unwrap_or("localhost");
        let port = args
            .get("port")
            .and_then(Value::as_u64)
            .ok_or_else(|| "Missing 'port' parameter".to_string())?;
        let port = u16::try_from(port).map_err(|_| format!("Invalid port: {}", port))?;
        let payload = args.get("payload").and_then(Value::as_str).unwrap_or("");

        let policy = &self.context.config().activation;
        match probe(host, port, payload.as_bytes(), policy, || cancel.is_cancelled()).await {
            Ok(ProbeStatus::Ready) => Ok(format!("{}:{} is reachable", host, port)),
            Ok(ProbeStatus::Cancelled) => Ok(format!("Stopped waiting for {}:{}", host, port)),
            Err(e) => Err(e.to_string()),
        }
    }

    fn handle_test_report(&self, args: &Value) -> Result<String, String> {
        let project = required_str(args, "project")?;
        let kind = match args.get("kind").and_then(Value::as_str).unwrap_or("unit") {
            "unit" => TestReportKind::Unit,
            "integration" => TestReportKind::Integration,
            other => return Err(format!("Unknown report kind: {}", other)),
        };
        let report = self
            .context
            .test_report(project, kind)
            .map_err(|e| format!("{:#}", e))?;
        Ok(report.display().to_string())
    }

    fn key(&self, args: &Value) -> Result<devmode_core::SessionKey, String> {
        let project = required_str(args, "project")?;
        self.context
            .session_key(project)
            .map_err(|e| format!("{:#}", e))
    }
}

fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, String> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("Missing '{}' parameter", name))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))
}

fn pretty<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| e.to_string())
}
