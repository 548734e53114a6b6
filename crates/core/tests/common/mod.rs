#![allow(dead_code, unused_imports, unused_macros)]

pub use kiln_core::test_utils::{echo_server_source, python_available, test_config, test_host};

use kiln_core::KilnHost;
use kiln_shared::ServerState;
use serde_json::{json, Value};
use std::time::Duration;

/// `mcp_server_create` arguments for an echo server exposing `tool`.
pub fn create_args(name: &str, tool: &str, auto_start: bool) -> Value {
    json!({
        "name": name,
        "code": echo_server_source(tool),
        "description": format!("echo server exposing {tool}"),
        "auto_start": auto_start,
    })
}

/// Wait until `id` reaches `state`, or give up after `limit`.
pub async fn wait_for_state(host: &KilnHost, id: &str, state: ServerState, limit: Duration) -> bool {
    let mut rx = host.servers.supervisor().subscribe(id);
    tokio::time::timeout(limit, rx.wait_for(|s| *s == state))
        .await
        .is_ok_and(|r| r.is_ok())
}

/// Skip a test that needs a Python interpreter when none is installed.
macro_rules! require_python {
    () => {
        if !common::python_available() {
            eprintln!("python3 not available, skipping");
            return;
        }
    };
}
pub(crate) use require_python;
