//! End-to-end lifecycle of AI-created servers: create, dispatch, crash,
//! restart, edit and delete, against a real Python interpreter.

mod common;

use common::{create_args, echo_server_source, require_python, test_host, wait_for_state};
use kiln_core::managers::{Redeployed, ToolTarget};
use kiln_core::validation::{CreateServerRequest, EditServerRequest};
use kiln_shared::{KilnError, ServerState};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_create_start_and_dispatch() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(dir.path());

    let out = host
        .router
        .dispatch("mcp_server_create", create_args("echoer", "echo", true))
        .await
        .unwrap();
    assert_eq!(out, "Server 'echoer' created and started. Tools: echo, echo_slow");
    assert_eq!(host.servers.supervisor().state("echoer"), ServerState::Running);
    assert_eq!(
        host.router.resolve("echo").await,
        Some(ToolTarget::AiServer("echoer".into()))
    );

    let reply = host
        .router
        .dispatch("echo", json!({ "text": "hello kiln" }))
        .await
        .unwrap();
    assert_eq!(reply, "hello kiln");

    let names: Vec<String> = host
        .router
        .function_schemas()
        .await
        .iter()
        .map(|s| s["function"]["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"echo".to_string()));
    assert!(names.contains(&"mcp_server_create".to_string()));

    // An unknown tool is an error and spawns nothing new.
    let pid = host.servers.list().await[0].pid;
    let err = host.router.dispatch("no_such_tool", json!({})).await.unwrap_err();
    assert!(matches!(err, KilnError::ToolNotFound(_)));
    assert_eq!(host.servers.list().await[0].pid, pid);

    let log = host
        .router
        .dispatch("mcp_server_logs", json!({ "name": "echoer" }))
        .await
        .unwrap();
    assert!(log.contains("running, 2 tool(s) advertised"), "{log}");

    host.shutdown().await;
    assert_eq!(host.servers.supervisor().state("echoer"), ServerState::Stopped);
}

#[tokio::test]
async fn test_concurrent_starts_spawn_one_process() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(dir.path());
    host.servers
        .create(serde_json::from_value::<CreateServerRequest>(create_args("solo", "solo_echo", false)).unwrap())
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        host.servers.start("solo"),
        host.servers.start("solo"),
        host.servers.start("solo"),
    );
    let results = [a, b, c];
    let started = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(KilnError::AlreadyRunning(_))))
        .count();
    assert_eq!((started, refused), (1, 2));

    // start/stop race: whichever wins, the final state is consistent.
    let (started, stopped) = tokio::join!(host.servers.start("solo"), host.servers.stop("solo"));
    let state = host.servers.supervisor().state("solo");
    match (started, stopped) {
        // start saw the running process, then stop ended it
        (Err(KilnError::AlreadyRunning(_)), Ok(true)) => assert_eq!(state, ServerState::Stopped),
        // stop ran first, then start brought it back
        (Ok(_), Ok(true)) => assert_eq!(state, ServerState::Running),
        other => panic!("unexpected outcome: {other:?} with state {state}"),
    }
    host.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_kill_is_detected_and_restart_recovers() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(dir.path());
    host.router
        .dispatch("mcp_server_create", create_args("fragile", "fragile_echo", true))
        .await
        .unwrap();
    let pid = host.servers.list().await[0].pid.unwrap();

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    assert!(wait_for_state(&host, "fragile", ServerState::Crashed, Duration::from_secs(5)).await);

    let err = host
        .router
        .dispatch("fragile_echo", json!({ "text": "hi" }))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, KilnError::NotRunning { state: ServerState::Crashed, .. }),
        "{err}"
    );
    let listed = &host.servers.list().await[0];
    assert!(listed.last_error.as_deref().unwrap_or_default().contains("exited unexpectedly"));

    let tools = host.servers.restart("fragile").await.unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(host.servers.supervisor().state("fragile"), ServerState::Running);
    assert_ne!(host.servers.list().await[0].pid, Some(pid));
    let reply = host
        .router
        .dispatch("fragile_echo", json!({ "text": "back" }))
        .await
        .unwrap();
    assert_eq!(reply, "back");
    host.shutdown().await;
}

#[tokio::test]
async fn test_edit_running_server_swaps_process() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(dir.path());
    host.router
        .dispatch("mcp_server_create", create_args("morph", "first_tool", true))
        .await
        .unwrap();
    let old_pid = host.servers.list().await[0].pid;

    // Rejected edit: old process keeps running unchanged.
    let err = host
        .servers
        .edit(EditServerRequest {
            name: "morph".into(),
            code: "import subprocess\n".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Validation(_)));
    assert_eq!(host.servers.list().await[0].pid, old_pid);
    assert_eq!(
        host.router.dispatch("first_tool", json!({ "text": "still" })).await.unwrap(),
        "still"
    );

    // Accepted edit: new process with the new tools.
    let outcome = host
        .servers
        .edit(EditServerRequest {
            name: "morph".into(),
            code: echo_server_source("second_tool"),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, Redeployed::Restarted(ref tools) if tools[0].name == "second_tool"));
    let status = &host.servers.list().await[0];
    assert_eq!(status.state, ServerState::Running);
    assert_ne!(status.pid, old_pid);
    assert!(matches!(
        host.router.dispatch("first_tool", json!({ "text": "x" })).await.unwrap_err(),
        KilnError::ToolNotFound(_)
    ));
    assert_eq!(
        host.router.dispatch("second_tool", json!({ "text": "new" })).await.unwrap(),
        "new"
    );
    host.shutdown().await;
}

#[tokio::test]
async fn test_slow_call_times_out_without_crashing() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config(dir.path());
    config.tool_timeout_secs = 1;
    config.max_consecutive_timeouts = 5;
    let host = kiln_core::KilnHost::new(config);
    host.router
        .dispatch("mcp_server_create", create_args("sleepy", "nap", true))
        .await
        .unwrap();

    let err = host
        .router
        .dispatch("nap_slow", json!({ "seconds": 2 }))
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::DispatchTimeout { .. }), "{err}");
    assert_eq!(host.servers.supervisor().state("sleepy"), ServerState::Running);

    // The late answer is dropped; the next call is matched to its own response.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        host.router.dispatch("nap", json!({ "text": "awake" })).await.unwrap(),
        "awake"
    );
    host.shutdown().await;
}

#[tokio::test]
async fn test_runtime_guard_blocks_import_that_bypassed_validation() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(dir.path());
    host.servers
        .create(serde_json::from_value::<CreateServerRequest>(create_args("sneaky", "sneaky_echo", false)).unwrap())
        .await
        .unwrap();

    // Tamper with the entry point behind the validator's back.
    let entry = dir.path().join("servers").join("sneaky").join("server.py");
    std::fs::write(&entry, "import json\nfrom subprocess import run\n").unwrap();
    let mut def = host
        .servers
        .manifest()
        .get("sneaky")
        .await
        .unwrap()
        .into_definition(std::fs::read_to_string(&entry).unwrap());
    def.autostart = false;

    let err = host.servers.supervisor().start(&def).await.unwrap_err();
    assert!(
        matches!(&err, KilnError::RuntimeImportBlocked { module, .. } if module == "subprocess"),
        "{err}"
    );
    assert_eq!(host.servers.supervisor().state("sneaky"), ServerState::Crashed);
    let log = std::fs::read_to_string(dir.path().join("servers").join("sneaky").join("server.log"))
        .unwrap();
    assert!(log.contains("kiln-sandbox: blocked import subprocess"), "{log}");

    // Through the management path the tampered source is caught statically.
    assert!(matches!(
        host.servers.start("sneaky").await.unwrap_err(),
        KilnError::Validation(_)
    ));
}

#[tokio::test]
async fn test_sandbox_environment_is_scrubbed() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("KILN_TEST_SECRET", "hunter2");
    let host = test_host(dir.path());
    let code = echo_server_source("env_dump").replace(
        "return {\"content\": [{\"type\": \"text\", \"text\": args.get(\"text\", \"\")}]}",
        "return {\"content\": [{\"type\": \"text\", \"text\": json.dumps(dict(os.environ))}]}",
    );
    let code = format!("import os\n{code}");
    host.router
        .dispatch(
            "mcp_server_create",
            json!({ "name": "env_dumper", "code": code, "description": "env" }),
        )
        .await
        .unwrap();

    let out = host.router.dispatch("env_dump", json!({})).await.unwrap();
    let env: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&out).unwrap();
    assert!(!env.contains_key("KILN_TEST_SECRET"));
    let storage = env["MCP_SANDBOX_DIR"].as_str().unwrap();
    assert!(storage.ends_with("sandbox"), "{storage}");
    assert_eq!(env["HOME"].as_str(), Some(storage));
    std::env::remove_var("KILN_TEST_SECRET");
    host.shutdown().await;
}

#[tokio::test]
async fn test_autostart_after_reboot_and_delete() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    {
        let host = test_host(dir.path());
        host.router
            .dispatch("mcp_server_create", create_args("keeper", "keeper_echo", true))
            .await
            .unwrap();
        host.router
            .dispatch("mcp_server_create", create_args("manual", "manual_echo", false))
            .await
            .unwrap();
        host.shutdown().await;
    }

    let host = test_host(dir.path());
    host.boot().await;
    let states: Vec<(String, ServerState)> = host
        .servers
        .list()
        .await
        .into_iter()
        .map(|s| (s.id, s.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("keeper".to_string(), ServerState::Running),
            ("manual".to_string(), ServerState::Stopped),
        ]
    );

    let out = host
        .router
        .dispatch("mcp_server_delete", json!({ "name": "keeper" }))
        .await
        .unwrap();
    assert_eq!(out, "Server 'keeper' deleted.");
    assert!(host.router.resolve("keeper_echo").await.is_none());
    assert!(!dir.path().join("servers").join("keeper").exists());
    assert_eq!(host.servers.list().await.len(), 1);
    host.shutdown().await;
}

#[tokio::test]
async fn test_repeated_timeouts_restart_the_server() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config(dir.path());
    config.tool_timeout_secs = 1;
    config.max_consecutive_timeouts = 2;
    let host = kiln_core::KilnHost::new(config);
    host.router
        .dispatch("mcp_server_create", create_args("restless", "restless", true))
        .await
        .unwrap();
    let supervisor = host.servers.supervisor().clone();
    let pid = host.servers.list().await[0].pid.unwrap();

    // A healthy server is left alone.
    assert!(supervisor.recover_unresponsive("restless").await.unwrap().is_none());
    assert_eq!(host.servers.list().await[0].pid, Some(pid));

    for _ in 0..2 {
        let err = host
            .router
            .dispatch("restless_slow", json!({ "seconds": 3 }))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::DispatchTimeout { .. }), "{err}");
    }

    let restarted = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let info = &host.servers.list().await[0];
            if info.state == ServerState::Running && info.pid.is_some_and(|p| p != pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(restarted.is_ok(), "server was not restarted");

    // The fresh process answers, and a late duplicate recovery is a no-op.
    assert_eq!(
        host.router
            .dispatch("restless", json!({ "text": "fresh" }))
            .await
            .unwrap(),
        "fresh"
    );
    let new_pid = host.servers.list().await[0].pid;
    assert!(supervisor.recover_unresponsive("restless").await.unwrap().is_none());
    assert_eq!(host.servers.list().await[0].pid, new_pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_non_json_stdout_crashes_the_server() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let host = test_host(dir.path());
    let code = echo_server_source("noisy").replace(
        "time.sleep(args.get(\"seconds\", 1))",
        "print(\"not json\", flush=True)",
    );
    assert!(code.contains("not json"));
    host.router
        .dispatch(
            "mcp_server_create",
            json!({ "name": "noisy", "code": code, "description": "noisy" }),
        )
        .await
        .unwrap();

    // The reply may or may not arrive before the process is killed.
    let _ = host.router.dispatch("noisy_slow", json!({})).await;
    assert!(wait_for_state(&host, "noisy", ServerState::Crashed, Duration::from_secs(5)).await);

    let listed = &host.servers.list().await[0];
    let last_error = listed.last_error.as_deref().unwrap_or_default();
    assert!(last_error.contains("protocol violation"), "{last_error}");
    assert!(last_error.contains("not json"), "{last_error}");

    let err = host
        .router
        .dispatch("noisy", json!({ "text": "hi" }))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, KilnError::NotRunning { state: ServerState::Crashed, .. }),
        "{err}"
    );
    host.shutdown().await;
}

#[tokio::test]
async fn test_handshake_timeout_reports_log_tail() {
    require_python!();
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config(dir.path());
    config.start_timeout_secs = 1;
    let host = kiln_core::KilnHost::new(config);
    let code = "import logging\nimport time\n\nlogging.warning(\"booting slowly\")\nwhile True:\n    time.sleep(1)\n";
    host.servers
        .create(
            serde_json::from_value::<CreateServerRequest>(json!({
                "name": "sluggish",
                "code": code,
                "description": "never answers",
                "auto_start": false,
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    let err = host.servers.start("sluggish").await.unwrap_err();
    match &err {
        KilnError::ProcessStartFailure { reason, log_tail, .. } => {
            assert!(reason.contains("handshake timed out after 1s"), "{reason}");
            assert!(
                log_tail.iter().any(|l| l.contains("booting slowly")),
                "{log_tail:?}"
            );
        }
        other => panic!("expected a start failure, got {other}"),
    }
    assert_eq!(host.servers.supervisor().state("sluggish"), ServerState::Crashed);
    host.shutdown().await;
}
