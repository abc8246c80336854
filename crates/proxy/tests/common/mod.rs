use anyhow::Context as _;
use rmcp::model::{CallToolRequestParams, CallToolResult, RawContent};
use rmcp::service::{RoleClient, RunningService, ServiceExt as _};
use rmcp::transport::TokioChildProcess;
use std::path::Path;

pub type ProxyClient = RunningService<RoleClient, ()>;

pub fn test_server_bin() -> &'static str {
    env!("CARGO_BIN_EXE_toolscope-mcp-stdio-test-server")
}

/// Config with one stdio downstream named `srv` advertising `tools`.
pub fn single_server_config(tools: &str) -> String {
    format!(
        r#"
servers:
  srv:
    type: stdio
    command: "{bin}"
    env:
      STDIO_TEST_TOOLS: "{tools}"
"#,
        bin = test_server_bin()
    )
}

/// Spawn the proxy binary as an MCP server and connect to it over stdio.
pub async fn spawn_proxy(config: &Path, state_dir: &Path) -> anyhow::Result<ProxyClient> {
    let bin = env!("CARGO_BIN_EXE_toolscope-mcp-proxy");
    let mut cmd = tokio::process::Command::new(bin);
    cmd.arg("--config")
        .arg(config)
        .arg("--state-dir")
        .arg(state_dir)
        .arg("--log-level")
        .arg("warn");
    let transport = TokioChildProcess::new(cmd).context("spawn proxy")?;
    ().serve(transport).await.context("initialize proxy client")
}

pub async fn list_tool_names(client: &ProxyClient) -> anyhow::Result<Vec<String>> {
    let tools = client
        .peer()
        .list_all_tools()
        .await
        .context("tools/list")?;
    Ok(tools.iter().map(|t| t.name.to_string()).collect())
}

pub async fn call_tool(
    client: &ProxyClient,
    name: &str,
    arguments: serde_json::Value,
) -> Result<CallToolResult, rmcp::ServiceError> {
    client
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: arguments.as_object().cloned(),
            task: None,
        })
        .await
}

/// Concatenated text content of a tool result.
pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
