use tempfile::TempDir;

use rust_mcp_sdk::schema::{
    CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams,
    LATEST_PROTOCOL_VERSION,
};
use rust_mcp_sdk::{
    mcp_client::{client_runtime, ClientHandler, McpClientOptions},
    McpClient, StdioTransport, ToMcpClientHandler, TransportOptions,
};

use async_trait::async_trait;

struct NoopClientHandler;

#[async_trait]
impl ClientHandler for NoopClientHandler {}

fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "genie-mcp-test".into(),
            version: "0.1.0".into(),
            title: Some("Genie MCP Test".into()),
            description: Some("Integration test client".into()),
            icons: vec![],
            website_url: None,
        },
        protocol_version: LATEST_PROTOCOL_VERSION.into(),
        meta: None,
    }
}

fn arguments(value: serde_json::Value) -> Option<serde_json::Map<String, serde_json::Value>> {
    value.as_object().cloned()
}

fn tool_call(name: &str, args: serde_json::Value) -> CallToolRequestParams {
    CallToolRequestParams {
        name: name.to_string(),
        arguments: arguments(args),
        meta: None,
        task: None,
    }
}

#[tokio::test]
async fn mcp_lists_shows_and_migrates_a_legacy_store() {
    let temp = TempDir::new().expect("tempdir");
    let state_dir = temp.path().join(".genie").join("state");
    std::fs::create_dir_all(&state_dir).expect("state dir");
    let store_path = state_dir.join("tasks.json");
    std::fs::write(
        &store_path,
        serde_json::json!({
            "sessions": {
                "attempt-7": {"agent": "implementor", "status": "completed", "executor": "claude"}
            }
        })
        .to_string(),
    )
    .expect("write store");

    let server_bin = env!("CARGO_BIN_EXE_genie-mcp");
    let transport = StdioTransport::create_with_server_launch(
        server_bin,
        vec!["--root".to_string(), temp.path().display().to_string()],
        None,
        TransportOptions::default(),
    )
    .expect("transport");

    let client = client_runtime::create_client(McpClientOptions {
        client_details: client_details(),
        transport,
        handler: NoopClientHandler.to_mcp_client_handler(),
        task_store: None,
        server_task_store: None,
    });

    client.clone().start().await.expect("start client");

    let version_result = client
        .request_tool_call(tool_call("version", serde_json::json!({})))
        .await
        .expect("version");
    let version_text = version_result
        .content
        .first()
        .unwrap()
        .as_text_content()
        .unwrap()
        .text
        .clone();
    assert!(version_text.contains("\"full\""));

    let list_result = client
        .request_tool_call(tool_call("session_list", serde_json::json!({"format": "text"})))
        .await
        .expect("session list");
    let list_text = list_result
        .content
        .first()
        .unwrap()
        .as_text_content()
        .unwrap()
        .text
        .clone();
    assert!(list_text.starts_with("attempt-7 | implementor | completed | CLAUDE_CODE |"));
    assert!(list_text.contains("warning: Migrated 1 task(s) from v2 to v4."));

    let show_result = client
        .request_tool_call(tool_call(
            "session_show",
            serde_json::json!({"session_id": "attempt-7"}),
        ))
        .await
        .expect("session show");
    let show_text = show_result
        .content
        .first()
        .unwrap()
        .as_text_content()
        .unwrap()
        .text
        .clone();
    let shown: serde_json::Value = serde_json::from_str(&show_text).expect("json");
    assert_eq!(shown["displayStatus"], "completed");

    client
        .request_tool_call(tool_call("store_migrate", serde_json::json!({})))
        .await
        .expect("store migrate");
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&store_path).expect("read store"))
            .expect("parse store");
    assert_eq!(written["version"], 4);
    assert_eq!(written["sessions"]["attempt-7"]["executor"], "CLAUDE_CODE");

    client.shut_down().await.expect("shutdown");
}
