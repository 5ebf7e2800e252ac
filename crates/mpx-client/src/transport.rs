//! Transport layer: one connector, one live transport per upstream.
//!
//! The MCP wire protocol itself lives in the `rmcp` SDK; this module wraps
//! it behind a seam so the fleet can be driven by deterministic fakes in
//! tests.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rmcp::RoleClient;
use rmcp::model::CallToolRequestParams;
use rmcp::service::{RunningService, ServiceExt};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use mpx_config::{IsolationConfig, ServerConfig, TransportConfig};

use crate::envfilter::filter_env;
use crate::process::{DEFAULT_KILL_GRACE, terminate_group};

/// Identity the server reported during the MCP handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHandshake {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// A live connection to one upstream.
#[async_trait]
pub trait ConnectedTransport: Send + Sync + std::fmt::Debug {
    fn handshake(&self) -> ServerHandshake;

    async fn list_tools(&self) -> Result<Vec<crate::tools::ToolDescriptor>>;

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value>;

    /// Process group of the spawned child, when one exists.
    fn process_group(&self) -> Option<i32>;

    async fn close(self: Box<Self>);
}

/// Establishes transports from config descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn ConnectedTransport>>;
}

/// Production connector backed by the rmcp SDK.
pub struct RmcpConnector {
    /// Pass secret-looking env vars through to children unredacted.
    pub expose_secret_env: bool,
}

impl RmcpConnector {
    pub fn new(expose_secret_env: bool) -> Self {
        Self { expose_secret_env }
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn ConnectedTransport>> {
        match &config.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                working_dir,
            } => {
                let transport = spawn_stdio(
                    config,
                    command,
                    args,
                    env,
                    working_dir.as_deref(),
                    self.expose_secret_env,
                )
                .await?;
                Ok(Box::new(transport))
            }
            TransportConfig::Http { url, headers }
            | TransportConfig::Sse { url, headers }
            | TransportConfig::StreamableHttp { url, headers } => {
                let transport = connect_http(config, url, headers).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

struct StdioTransport {
    service: RunningService<RoleClient, ()>,
    child: Box<tokio::process::Child>,
    pgid: i32,
    container_name: Option<String>,
    handshake: ServerHandshake,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("pgid", &self.pgid)
            .field("container_name", &self.container_name)
            .field("handshake", &self.handshake)
            .finish()
    }
}

struct HttpTransport {
    service: RunningService<RoleClient, ()>,
    handshake: ServerHandshake,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("handshake", &self.handshake)
            .finish()
    }
}

#[async_trait]
impl ConnectedTransport for StdioTransport {
    fn handshake(&self) -> ServerHandshake {
        self.handshake.clone()
    }

    async fn list_tools(&self) -> Result<Vec<crate::tools::ToolDescriptor>> {
        list_tools_via(&self.service).await
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        call_tool_via(&self.service, name, arguments).await
    }

    fn process_group(&self) -> Option<i32> {
        Some(self.pgid)
    }

    async fn close(self: Box<Self>) {
        let Self {
            service,
            mut child,
            pgid,
            container_name,
            ..
        } = *self;

        let _ = service.cancel().await;
        terminate_group(pgid, DEFAULT_KILL_GRACE).await;
        // Reap the direct child so it does not linger as a zombie.
        let _ = child.wait().await;

        if let Some(name) = container_name {
            stop_container(&name).await;
        }
    }
}

#[async_trait]
impl ConnectedTransport for HttpTransport {
    fn handshake(&self) -> ServerHandshake {
        self.handshake.clone()
    }

    async fn list_tools(&self) -> Result<Vec<crate::tools::ToolDescriptor>> {
        list_tools_via(&self.service).await
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        call_tool_via(&self.service, name, arguments).await
    }

    fn process_group(&self) -> Option<i32> {
        None
    }

    async fn close(self: Box<Self>) {
        let _ = self.service.cancel().await;
    }
}

fn handshake_of(service: &RunningService<RoleClient, ()>) -> ServerHandshake {
    service
        .peer_info()
        .map(|info| ServerHandshake {
            name: Some(info.server_info.name.to_string()),
            version: Some(info.server_info.version.to_string()),
        })
        .unwrap_or_default()
}

async fn list_tools_via(
    service: &RunningService<RoleClient, ()>,
) -> Result<Vec<crate::tools::ToolDescriptor>> {
    let response = service
        .list_tools(None)
        .await
        .context("list_tools request failed")?;
    Ok(response
        .tools
        .into_iter()
        .map(|tool| crate::tools::ToolDescriptor {
            name: tool.name.to_string(),
            description: tool.description.map(|d| d.to_string()),
            input_schema: Value::Object((*tool.input_schema).clone()),
        })
        .collect())
}

async fn call_tool_via(
    service: &RunningService<RoleClient, ()>,
    name: &str,
    arguments: Option<Value>,
) -> Result<Value> {
    let arguments = match arguments {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(other) => {
            return Err(anyhow!("tool arguments must be a JSON object, got {other}"));
        }
    };

    let mut params = CallToolRequestParams::new(name.to_string());
    if let Some(arguments) = arguments {
        params = params.with_arguments(arguments);
    }
    let result = service
        .call_tool(params)
        .await
        .with_context(|| format!("call_tool '{name}' failed"))?;
    serde_json::to_value(result).context("failed to serialize tool result")
}

/// Spawns a stdio child in its own process group and negotiates the MCP
/// handshake over its pipes.
async fn spawn_stdio(
    config: &ServerConfig,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    working_dir: Option<&std::path::Path>,
    expose_secret_env: bool,
) -> Result<StdioTransport> {
    let (child_env, redacted) = filter_env(env, expose_secret_env);
    if !redacted.is_empty() {
        debug!(
            server = %config.name,
            redacted = ?redacted,
            passthrough = expose_secret_env,
            "secret-looking env vars detected"
        );
    }

    let container_name = config
        .isolation
        .as_ref()
        .filter(|iso| iso.enabled)
        .map(|_| container_name_for(&config.name));

    let (program, argv) = match (&config.isolation, &container_name) {
        (Some(iso), Some(name)) if iso.enabled => build_isolated_command(iso, name, command, args)?,
        _ => (command.to_string(), args.to_vec()),
    };

    let mut cmd = Command::new(&program);
    cmd.args(&argv);
    cmd.envs(&child_env);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // Isolate the child in its own process group so termination can target
    // the whole tree.
    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn MCP server '{}'", config.name))?;
    let pgid = child
        .id()
        .ok_or_else(|| anyhow!("spawned MCP server '{}' has no pid", config.name))?
        as i32;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdout for MCP server '{}'", config.name))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdin for MCP server '{}'", config.name))?;
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut stderr, &mut sink).await;
        });
    }

    let service = ()
        .serve((stdout, stdin))
        .await
        .with_context(|| format!("MCP handshake with '{}' failed", config.name))?;

    let handshake = handshake_of(&service);
    info!(
        server = %config.name,
        pgid,
        reported = ?handshake.name,
        "stdio upstream connected"
    );

    Ok(StdioTransport {
        service,
        child: Box::new(child),
        pgid,
        container_name,
        handshake,
    })
}

/// Connects to a remote upstream via the streamable HTTP client.
///
/// Config headers are installed as reqwest defaults; an `access_token` in
/// the opaque oauth block becomes a bearer `Authorization` header unless the
/// operator already set one.
async fn connect_http(
    config: &ServerConfig,
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<HttpTransport> {
    use rmcp::transport::StreamableHttpClientTransport;
    use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;

    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("invalid header name '{key}'"))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header '{key}'"))?;
        header_map.insert(name, value);
    }
    if !header_map.contains_key(reqwest::header::AUTHORIZATION) {
        if let Some(token) = config
            .oauth
            .as_ref()
            .and_then(|o| o.get("access_token"))
            .and_then(Value::as_str)
        {
            let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("oauth access_token is not a valid header value")?;
            value.set_sensitive(true);
            header_map.insert(reqwest::header::AUTHORIZATION, value);
        }
    }

    info!(server = %config.name, url = %url, "connecting to HTTP MCP server");

    let service = if header_map.is_empty() {
        ()
            .serve(StreamableHttpClientTransport::from_uri(url.to_string()))
            .await
    } else {
        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .context("failed to build HTTP client")?;
        ()
            .serve(StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(url.to_string()),
            ))
            .await
    }
    .with_context(|| format!("failed to connect to MCP server '{}' at {url}", config.name))?;

    let handshake = handshake_of(&service);
    Ok(HttpTransport { service, handshake })
}

fn container_name_for(server: &str) -> String {
    let safe: String = server
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("mcpproxy-{safe}")
}

/// Wraps a stdio command into `docker run` argv per the isolation config.
fn build_isolated_command(
    isolation: &IsolationConfig,
    container_name: &str,
    command: &str,
    args: &[String],
) -> Result<(String, Vec<String>)> {
    let image = isolation
        .image
        .as_deref()
        .ok_or_else(|| anyhow!("isolation enabled but no image configured"))?;

    let mut argv = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];
    if let Some(mode) = &isolation.network_mode {
        argv.push(format!("--network={mode}"));
    }
    argv.extend(isolation.extra_args.iter().cloned());
    argv.push(image.to_string());
    argv.push(command.to_string());
    argv.extend(args.iter().cloned());

    Ok(("docker".to_string(), argv))
}

/// Best-effort `docker stop`; the `--rm` flag removes the container after.
async fn stop_container(name: &str) {
    let result = Command::new("docker")
        .args(["stop", "--time", "2", name])
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {
            debug!(container = %name, "isolation container stopped");
        }
        Ok(output) => {
            // Already gone is the common case after the group kill.
            debug!(
                container = %name,
                status = %output.status,
                "docker stop exited nonzero"
            );
        }
        Err(e) => warn!(container = %name, error = %e, "failed to run docker stop"),
    }
}

/// Timeout applied around the whole connect + handshake sequence.
pub async fn connect_with_timeout(
    connector: &dyn Connector,
    config: &ServerConfig,
    timeout: Duration,
) -> std::result::Result<Box<dyn ConnectedTransport>, ConnectError> {
    match tokio::time::timeout(timeout, connector.connect(config)).await {
        Ok(Ok(transport)) => Ok(transport),
        Ok(Err(e)) => Err(ConnectError::Transport(e)),
        Err(_) => Err(ConnectError::Timeout(timeout)),
    }
}

#[derive(Debug)]
pub enum ConnectError {
    Transport(anyhow::Error),
    Timeout(Duration),
}
