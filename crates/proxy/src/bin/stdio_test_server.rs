//! Minimal MCP stdio server used only for proxy integration tests.
//!
//! Speaks JSON-RPC over stdio directly (one JSON message per line) without
//! depending on the proxy's production code paths. The advertised tool set
//! is configurable through `STDIO_TEST_TOOLS` (comma-separated names,
//! default `echo`); every tool takes a required `msg` string and echoes it
//! back together with per-process instance info.

use serde_json::json;
use std::io::{BufRead as _, Write};
use std::time::{SystemTime, UNIX_EPOCH};

fn main() -> anyhow::Result<()> {
    let mut state = ServerState::new();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if let Some(resp) = handle_line(&mut state, &line) {
            write_json_line(&mut stdout, &resp)?;
        }
    }

    Ok(())
}

struct ServerState {
    instance_id: String,
    tools: Vec<String>,
    call_count: u64,
}

impl ServerState {
    fn new() -> Self {
        let pid = std::process::id();
        let started_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tools = std::env::var("STDIO_TEST_TOOLS")
            .unwrap_or_else(|_| "echo".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            instance_id: format!("{pid}-{started_ns}"),
            tools,
            call_count: 0,
        }
    }
}

fn handle_line(state: &mut ServerState, line: &str) -> Option<serde_json::Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let msg: serde_json::Value = serde_json::from_str(line).ok()?;
    handle_message(state, &msg)
}

fn handle_message(state: &mut ServerState, msg: &serde_json::Value) -> Option<serde_json::Value> {
    let method = msg.get("method").and_then(serde_json::Value::as_str)?;

    // Ignore notifications (no `id`).
    let id = msg.get("id")?.clone();

    match method {
        "initialize" => {
            let result = initialize_result(msg);
            Some(jsonrpc_ok(&id, &result))
        }
        "tools/list" => Some(jsonrpc_ok(&id, &tools_list_result(state))),
        "tools/call" => match tools_call_result(state, msg) {
            Ok(result) => Some(jsonrpc_ok(&id, &result)),
            Err(error) => Some(jsonrpc_err(&id, &error)),
        },
        "resources/list" => Some(jsonrpc_ok(&id, &json!({ "resources": [] }))),
        "prompts/list" => Some(jsonrpc_ok(&id, &json!({ "prompts": [] }))),
        _ => {
            let error = json!({ "code": -32601, "message": "method not found" });
            Some(jsonrpc_err(&id, &error))
        }
    }
}

fn initialize_result(msg: &serde_json::Value) -> serde_json::Value {
    let protocol_version = msg
        .get("params")
        .and_then(|p| p.get("protocolVersion"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("2024-11-05")
        .to_string();

    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "toolscope-stdio-test-server", "version": "0" }
    })
}

fn tools_list_result(state: &ServerState) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = state
        .tools
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "description": format!("Test tool '{name}'"),
                "inputSchema": {
                    "type": "object",
                    "properties": { "msg": { "type": "string" } },
                    "required": ["msg"]
                }
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn tools_call_result(
    state: &mut ServerState,
    msg: &serde_json::Value,
) -> Result<serde_json::Value, serde_json::Value> {
    let params = msg.get("params");
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");

    if !state.tools.iter().any(|t| t == name) {
        return Err(json!({ "code": -32601, "message": "unknown tool" }));
    }

    let message = params
        .and_then(|p| p.get("arguments"))
        .and_then(|a| a.get("msg"))
        .and_then(serde_json::Value::as_str);

    // `fail` is a conventional trigger for tool-level errors in tests.
    if message == Some("fail") {
        return Ok(json!({
            "content": [{ "type": "text", "text": "forced failure" }],
            "isError": true
        }));
    }

    state.call_count += 1;
    let body = json!({
        "tool": name,
        "msg": message,
        "instanceId": state.instance_id,
        "callCount": state.call_count
    });

    Ok(json!({
        "content": [{ "type": "text", "text": body.to_string() }]
    }))
}

fn jsonrpc_ok(id: &serde_json::Value, result: &serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_err(id: &serde_json::Value, error: &serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn write_json_line(stdout: &mut dyn Write, v: &serde_json::Value) -> anyhow::Result<()> {
    writeln!(stdout, "{}", serde_json::to_string(v)?)?;
    stdout.flush()?;
    Ok(())
}
