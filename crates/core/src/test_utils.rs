//! Helpers shared by unit and integration tests.

use crate::config::AppConfig;
use crate::KilnHost;
use std::path::Path;

/// Minimal MCP server over stdio that passes the sandbox policy. `__TOOL__`
/// is replaced by the tool name so several instances can coexist.
const ECHO_SERVER_TEMPLATE: &str = r#"import json
import time

TOOL = "__TOOL__"


def handle(request):
    method = request.get("method")
    if method == "initialize":
        return {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": TOOL, "version": "1.0"},
        }
    if method == "tools/list":
        return {
            "tools": [
                {
                    "name": TOOL,
                    "description": "Echo text back",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"],
                    },
                },
                {
                    "name": TOOL + "_slow",
                    "description": "Sleep, then answer",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"seconds": {"type": "number"}},
                    },
                },
            ]
        }
    if method == "tools/call":
        params = request.get("params", {})
        name = params.get("name")
        args = params.get("arguments", {})
        if name == TOOL:
            return {"content": [{"type": "text", "text": args.get("text", "")}]}
        if name == TOOL + "_slow":
            time.sleep(args.get("seconds", 1))
            return {"content": [{"type": "text", "text": "done"}]}
        return {"content": [{"type": "text", "text": "unknown tool"}], "isError": True}
    return None


while True:
    try:
        line = input()
    except EOFError:
        break
    if not line.strip():
        continue
    request = json.loads(line)
    if "id" not in request:
        continue
    result = handle(request)
    if result is None:
        response = {
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32601, "message": "Method not found"},
        }
    else:
        response = {"jsonrpc": "2.0", "id": request["id"], "result": result}
    print(json.dumps(response), flush=True)
"#;

#[must_use]
pub fn echo_server_source(tool: &str) -> String {
    ECHO_SERVER_TEMPLATE.replace("__TOOL__", tool)
}

/// Config rooted at `state_dir` with short timeouts for tests.
#[must_use]
pub fn test_config(state_dir: &Path) -> AppConfig {
    let mut config = AppConfig::with_state_dir(state_dir);
    config.tool_timeout_secs = 2;
    config.start_timeout_secs = 10;
    config.stop_grace_secs = 2;
    config.max_consecutive_timeouts = 2;
    config
}

#[must_use]
pub fn test_host(state_dir: &Path) -> KilnHost {
    KilnHost::new(test_config(state_dir))
}

/// Whether the configured interpreter can be run at all.
#[must_use]
pub fn python_available() -> bool {
    let python = AppConfig::with_state_dir(".").python;
    std::process::Command::new(python)
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}
