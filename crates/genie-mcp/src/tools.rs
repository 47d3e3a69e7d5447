use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rust_mcp_sdk::macros::{mcp_tool, JsonSchema};
use rust_mcp_sdk::schema::{
    schema_utils::CallToolError, CallToolRequestParams, CallToolResult, ListToolsResult,
    PaginatedRequestParams, RpcError, TextContent,
};
use rust_mcp_sdk::tool_box;
use rust_mcp_sdk::{mcp_server::ServerHandler, McpServer};
use serde::{Deserialize, Serialize};

use genie_core::config::{load_config, resolve_paths, resolve_workspace_root, GenieConfig};
use genie_core::process::SystemProbe;
use genie_core::status::{list_views, RecordView};
use genie_core::store::{self, LoadedStore, StoreKind, StoreLocation};
use genie_core::version;

#[derive(Clone)]
pub struct McpContext {
    pub default_root: Option<PathBuf>,
}

fn resolve_root(context: &McpContext, root: Option<&str>) -> PathBuf {
    let root_value = root
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);
    if let Some(root_value) = root_value {
        return root_value;
    }
    if let Some(default_root) = &context.default_root {
        return default_root.clone();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_workspace_root(&cwd)
}

fn parse_kind(value: &str) -> Result<StoreKind, CallToolError> {
    value.parse::<StoreKind>().map_err(CallToolError::from_message)
}

struct OpenStore {
    kind: StoreKind,
    location: StoreLocation,
    loaded: LoadedStore,
}

fn open_store(
    context: &McpContext,
    root: Option<&str>,
    kind: &str,
) -> Result<OpenStore, CallToolError> {
    let kind = parse_kind(kind)?;
    let root = resolve_root(context, root);
    let config = load_config(&root).map_err(|err| CallToolError::from_message(err.to_string()))?;
    let location = resolve_paths(&root, &config.paths).store_location(kind);
    let loaded = store::load(&location, kind, &config, &GenieConfig::builtin())
        .map_err(|err| CallToolError::from_message(err.to_string()))?;
    Ok(OpenStore {
        kind,
        location,
        loaded,
    })
}

fn store_exists(location: &StoreLocation) -> bool {
    location.read_path().is_some_and(Path::exists)
}

fn ok_text(content: String) -> Result<CallToolResult, CallToolError> {
    Ok(CallToolResult::text_content(vec![TextContent::from(
        content,
    )]))
}

fn ok_json(value: serde_json::Value) -> Result<CallToolResult, CallToolError> {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
    ok_text(text)
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, CallToolError> {
    serde_json::to_value(value).map_err(|err| CallToolError::from_message(err.to_string()))
}

fn with_warnings(mut body: Vec<String>, warnings: &[String]) -> String {
    body.extend(warnings.iter().map(|warning| format!("warning: {warning}")));
    body.join("\n")
}

fn default_format() -> String {
    "json".to_string()
}

fn default_kind() -> String {
    StoreKind::Task.as_str().to_string()
}

#[mcp_tool(name = "version", description = "Return Genie version information.")]
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct VersionTool {
    #[serde(default = "default_format")]
    pub format: String,
}

#[mcp_tool(
    name = "session_list",
    description = "List tasks or sessions with their reconciled status, most recently used first."
)]
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct SessionListTool {
    pub root: Option<String>,
    /// `tasks` (default) or `sessions`.
    #[serde(default = "default_kind")]
    pub kind: String,
    pub limit: Option<u32>,
    #[serde(default = "default_format")]
    pub format: String,
}

#[mcp_tool(name = "session_show", description = "Show a single task or session by id.")]
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct SessionShowTool {
    pub session_id: String,
    pub root: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_format")]
    pub format: String,
}

#[mcp_tool(
    name = "store_migrate",
    description = "Upgrade a task or session store to the current schema (writes unless dry_run)."
)]
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct StoreMigrateTool {
    pub root: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_format")]
    pub format: String,
}

tool_box!(
    GenieTools,
    [VersionTool, SessionListTool, SessionShowTool, StoreMigrateTool]
);

pub struct GenieServerHandler {
    pub context: McpContext,
}

#[async_trait]
impl ServerHandler for GenieServerHandler {
    async fn handle_list_tools_request(
        &self,
        _params: Option<PaginatedRequestParams>,
        _runtime: std::sync::Arc<dyn McpServer>,
    ) -> Result<ListToolsResult, RpcError> {
        Ok(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools: GenieTools::tools(),
        })
    }

    async fn handle_call_tool_request(
        &self,
        params: CallToolRequestParams,
        _runtime: std::sync::Arc<dyn McpServer>,
    ) -> Result<CallToolResult, CallToolError> {
        let tool = GenieTools::try_from(params).map_err(CallToolError::new)?;
        match tool {
            GenieTools::VersionTool(tool) => tool.call(&self.context),
            GenieTools::SessionListTool(tool) => tool.call(&self.context),
            GenieTools::SessionShowTool(tool) => tool.call(&self.context),
            GenieTools::StoreMigrateTool(tool) => tool.call(&self.context),
        }
    }
}

impl VersionTool {
    fn call(&self, _context: &McpContext) -> Result<CallToolResult, CallToolError> {
        if self.format == "text" {
            return ok_text(format!("genie {}", version::FULL));
        }
        ok_json(serde_json::json!({
            "name": "genie",
            "version": version::PACKAGE,
            "full": version::FULL,
        }))
    }
}

impl SessionListTool {
    fn call(&self, context: &McpContext) -> Result<CallToolResult, CallToolError> {
        let open = open_store(context, self.root.as_deref(), &self.kind)?;
        let mut views = list_views(&open.loaded.store.sessions, &SystemProbe);
        if let Some(limit) = self.limit {
            views.truncate(limit as usize);
        }

        if self.format == "text" {
            let lines = if views.is_empty() {
                vec![format!("No {} found.", open.kind)]
            } else {
                views.iter().map(RecordView::render_line).collect()
            };
            return ok_text(with_warnings(lines, &open.loaded.warnings));
        }
        ok_json(serde_json::json!({
            "kind": open.kind.as_str(),
            "count": views.len(),
            "sessions": to_json(&views)?,
            "warnings": open.loaded.warnings,
        }))
    }
}

impl SessionShowTool {
    fn call(&self, context: &McpContext) -> Result<CallToolResult, CallToolError> {
        let open = open_store(context, self.root.as_deref(), &self.kind)?;
        let Some((id, record)) = open.loaded.store.sessions.get_key_value(&self.session_id)
        else {
            return Err(CallToolError::from_message(format!(
                "Session not found: {}",
                self.session_id
            )));
        };
        let view = RecordView::new(id, record, &SystemProbe);

        if self.format == "text" {
            return ok_text(with_warnings(view.render_details(), &open.loaded.warnings));
        }
        ok_json(to_json(&view)?)
    }
}

impl StoreMigrateTool {
    fn call(&self, context: &McpContext) -> Result<CallToolResult, CallToolError> {
        let open = open_store(context, self.root.as_deref(), &self.kind)?;
        let count = open.loaded.store.sessions.len();
        let found = store_exists(&open.location);

        let written = if found && !self.dry_run {
            store::save(&open.location, &open.loaded.store)
                .map_err(|err| CallToolError::from_message(err.to_string()))?
        } else {
            None
        };

        if self.format == "text" {
            let summary = if !found {
                format!("No {} store found.", open.kind)
            } else if let Some(path) = &written {
                format!("{count} {}(s) written to {}", open.kind.noun(), path.display())
            } else {
                format!("{count} {}(s) would be written (dry run)", open.kind.noun())
            };
            return ok_text(with_warnings(vec![summary], &open.loaded.warnings));
        }
        ok_json(serde_json::json!({
            "ok": true,
            "kind": open.kind.as_str(),
            "found": found,
            "dry_run": self.dry_run,
            "count": count,
            "written": written.map(|path| path.display().to_string()),
            "warnings": open.loaded.warnings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(root: &Path) -> McpContext {
        McpContext {
            default_root: Some(root.to_path_buf()),
        }
    }

    fn result_text(result: CallToolResult) -> String {
        result
            .content
            .first()
            .expect("tool content")
            .as_text_content()
            .expect("text content")
            .text
            .clone()
    }

    fn call_error(result: Result<CallToolResult, CallToolError>) -> String {
        match result {
            Ok(_) => panic!("expected a tool error"),
            Err(err) => err.to_string(),
        }
    }

    fn write_v3_tasks(root: &Path) -> PathBuf {
        let path = root.join(".genie").join("state").join("tasks.json");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("state dir");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 3,
                "sessions": {
                    "genie-1": {"agent": "plan", "sessionId": "attempt-1", "status": "completed"},
                    "genie-2": {"agent": "implementor", "sessionId": "attempt-2", "lastUsed": "2026-01-05T00:00:00.000Z"}
                }
            })
            .to_string(),
        )
        .expect("write store");
        path
    }

    #[test]
    fn list_reports_views_and_migration_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_v3_tasks(temp.path());
        let tool = SessionListTool {
            root: None,
            kind: default_kind(),
            limit: None,
            format: default_format(),
        };
        let text = result_text(tool.call(&context(temp.path())).expect("call"));
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["count"], 2);
        assert_eq!(value["sessions"][0]["id"], "attempt-2");
        assert_eq!(value["sessions"][1]["displayStatus"], "completed");
        assert!(value["warnings"][0]
            .as_str()
            .unwrap_or_default()
            .starts_with("Migrated 2 task(s) from v3 to v4."));
    }

    #[test]
    fn list_honours_limit_and_text_format() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_v3_tasks(temp.path());
        let tool = SessionListTool {
            root: Some(temp.path().display().to_string()),
            kind: "tasks".to_string(),
            limit: Some(1),
            format: "text".to_string(),
        };
        let text = result_text(tool.call(&McpContext { default_root: None }).expect("call"));
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("attempt-2 | implementor | unknown | OPENCODE | 2026-01-05T00:00:00.000Z")
        );
        assert!(lines.next().unwrap_or_default().starts_with("warning: Migrated"));
    }

    #[test]
    fn show_unknown_session_is_a_tool_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_v3_tasks(temp.path());
        let tool = SessionShowTool {
            session_id: "nope".to_string(),
            root: None,
            kind: default_kind(),
            format: default_format(),
        };
        let message = call_error(tool.call(&context(temp.path())));
        assert!(message.contains("Session not found: nope"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tool = SessionListTool {
            root: None,
            kind: "widgets".to_string(),
            limit: None,
            format: default_format(),
        };
        let message = call_error(tool.call(&context(temp.path())));
        assert!(message.contains("unknown store kind"));
    }

    #[test]
    fn migrate_respects_dry_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_v3_tasks(temp.path());
        let before = std::fs::read_to_string(&path).expect("read");

        let dry = StoreMigrateTool {
            root: None,
            kind: default_kind(),
            dry_run: true,
            format: default_format(),
        };
        dry.call(&context(temp.path())).expect("dry run");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), before);

        let apply = StoreMigrateTool {
            dry_run: false,
            ..dry
        };
        let text = result_text(apply.call(&context(temp.path())).expect("apply"));
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["count"], 2);
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(written["version"], 4);
        assert!(written["sessions"].get("attempt-1").is_some());
    }
}
