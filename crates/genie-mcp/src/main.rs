mod tools;

use std::path::PathBuf;

use clap::Parser;
use genie_core::version;
use genie_service::logging::{init_tracing, DEFAULT_LOG_LEVEL};
use rust_mcp_sdk::error::SdkResult;
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ProtocolVersion, ServerCapabilities, ServerCapabilitiesTools,
};
use rust_mcp_sdk::{
    mcp_server::{server_runtime, McpServerOptions},
    McpServer, StdioTransport, ToMcpServerHandler, TransportOptions,
};

use crate::tools::{GenieServerHandler, McpContext};

#[derive(Parser)]
#[command(name = "genie-mcp", version = version::FULL)]
struct Args {
    /// Default workspace root for MCP tool calls.
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> SdkResult<()> {
    init_tracing(DEFAULT_LOG_LEVEL);
    let args = Args::parse();

    let server_details = InitializeResult {
        server_info: Implementation {
            name: "genie".into(),
            version: version::FULL.into(),
            title: Some("Genie MCP Server".into()),
            description: Some("Inspect and migrate Genie task and session registries".into()),
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: Some("Genie registry MCP server".into()),
        protocol_version: ProtocolVersion::V2025_11_25.into(),
    };

    let transport = StdioTransport::new(TransportOptions::default())?;
    let handler = GenieServerHandler {
        context: McpContext {
            default_root: args.root,
        },
    };

    let server = server_runtime::create_server(McpServerOptions {
        server_details,
        transport,
        handler: handler.to_mcp_server_handler(),
        task_store: None,
        client_task_store: None,
    });

    server.start().await
}
