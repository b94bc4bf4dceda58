//! HTTP template transport.
//!
//! Executes templated REST tools. There is no persistent connection and no
//! lifecycle; each call renders the tool's templates against the merged
//! request context, assembles arguments by position, and performs one
//! outbound HTTP request with a per-call timeout.

use async_trait::async_trait;
use mcpkit::{CallToolParams, CallToolResult, Tool};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::{tool_not_found, truncate_diag, Transport, TransportError};
use crate::config::{ArgPosition, HttpServer, ToolDef};
use crate::template::{
    self, fill_default_args, normalize_json_string_values, value_to_string, Context,
    RequestContext, ResponseContext,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport over templated REST tools.
pub struct HttpTransport {
    server: HttpServer,
    tools: HashMap<String, ToolDef>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(server: HttpServer, tools: HashMap<String, ToolDef>) -> Self {
        Self {
            server,
            tools,
            client: reqwest::Client::new(),
        }
    }

    async fn execute(
        &self,
        tool: &ToolDef,
        mut args: Map<String, Value>,
        req: &RequestContext,
    ) -> Result<CallToolResult, String> {
        fill_default_args(tool, &mut args);
        normalize_json_string_values(tool, &mut args);

        let mut ctx = Context {
            args: args.clone(),
            config: config_map(&self.server, tool),
            request: req.clone(),
            response: ResponseContext::default(),
        };

        let url = self.render_url(tool, &ctx)?;

        let mut request = self
            .client
            .request(parse_method(&tool.method)?, &url)
            .timeout(CALL_TIMEOUT);

        // Tool-defined headers, rendered.
        for (name, template) in &tool.headers {
            let value = template::render(template, &ctx).map_err(|e| e.to_string())?;
            request = request.header(name, value);
        }

        // Arguments by declared position. Path args are already inlined in
        // the URL template.
        let mut body_args = Map::new();
        for arg in &tool.args {
            let Some(value) = args.get(&arg.name) else {
                continue;
            };
            match arg.position {
                ArgPosition::Query => {
                    request = request.query(&[(arg.name.as_str(), value_to_string(value))]);
                }
                ArgPosition::Header => {
                    request = request.header(arg.name.as_str(), value_to_string(value));
                }
                ArgPosition::Body => {
                    body_args.insert(arg.name.clone(), value.clone());
                }
                ArgPosition::Path => {}
            }
        }

        // Body precedence: template, declared body args, then the full
        // argument object for body-carrying methods.
        let method = tool.method.to_ascii_uppercase();
        if !tool.request_body.is_empty() {
            let body = template::render(&tool.request_body, &ctx).map_err(|e| e.to_string())?;
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        } else if !body_args.is_empty() {
            request = request.json(&Value::Object(body_args));
        } else if matches!(method.as_str(), "POST" | "PUT" | "PATCH") && !args.is_empty() {
            request = request.json(&Value::Object(args.clone()));
        }

        tracing::debug!(tool = %tool.name, url = %url, method = %method, "sending tool request");

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;

        tracing::debug!(tool = %tool.name, status = %status, "received tool response");

        if !status.is_success() {
            return Err(format!("upstream returned {}: {}", status, body));
        }

        let text = if tool.response_body.is_empty() {
            body
        } else {
            ctx.response = ResponseContext {
                data: serde_json::from_str(&body).unwrap_or(Value::Null),
                body,
            };
            template::render(&tool.response_body, &ctx).map_err(|e| e.to_string())?
        };

        Ok(CallToolResult::text(text))
    }

    fn render_url(&self, tool: &ToolDef, ctx: &Context) -> Result<String, String> {
        let rendered = template::render(&tool.path, ctx).map_err(|e| e.to_string())?;
        if rendered.contains("://") {
            Ok(rendered)
        } else {
            // Path templates without {{config.url}} resolve against the
            // server's base URL.
            Ok(format!(
                "{}/{}",
                self.server.url.trim_end_matches('/'),
                rendered.trim_start_matches('/')
            ))
        }
    }
}

fn config_map(server: &HttpServer, tool: &ToolDef) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("url".to_string(), Value::String(server.url.clone()));
    map.insert("tool_name".to_string(), Value::String(tool.name.clone()));
    map.insert("method".to_string(), Value::String(tool.method.clone()));
    map.insert(
        "description".to_string(),
        Value::String(tool.description.clone()),
    );
    map
}

fn parse_method(method: &str) -> Result<reqwest::Method, String> {
    method
        .to_ascii_uppercase()
        .parse()
        .map_err(|_| format!("invalid HTTP method: {}", method))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        Ok(self.tools.values().map(ToolDef::to_tool).collect())
    }

    async fn call_tool(&self, params: CallToolParams, req: &RequestContext) -> CallToolResult {
        let Some(tool) = self.tools.get(&params.name) else {
            tracing::warn!(tool = %params.name, server = %self.server.name, "tool not found");
            return tool_not_found(&params.name, &self.server.name);
        };

        match self.execute(tool, params.args(), req).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(tool = %params.name, error = %e, "tool execution failed");
                CallToolResult::error(format!(
                    "Tool execution failed: {}",
                    truncate_diag(&e)
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport_with_tool(tool: Value) -> HttpTransport {
        let tool: ToolDef = serde_json::from_value(tool).unwrap();
        let server = HttpServer {
            name: "backend".to_string(),
            description: String::new(),
            url: "http://u".to_string(),
            tools: vec![tool.name.clone()],
        };
        let mut tools = HashMap::new();
        tools.insert(tool.name.clone(), tool);
        HttpTransport::new(server, tools)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let transport = transport_with_tool(json!({
            "name": "echo", "method": "POST", "path": "{{config.url}}/e"
        }));

        let params: CallToolParams =
            serde_json::from_value(json!({ "name": "nope", "arguments": {} })).unwrap();
        let result = transport
            .call_tool(params, &RequestContext::default())
            .await;

        assert!(result.is_error);
        assert!(result.content[0]
            .as_text()
            .unwrap()
            .contains("Tool nope not found"));
    }

    #[tokio::test]
    async fn test_list_tools_from_allowed_set() {
        let transport = transport_with_tool(json!({
            "name": "echo", "method": "POST", "path": "{{config.url}}/e"
        }));
        let tools = transport.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[test]
    fn test_render_url_joins_relative_paths() {
        let transport = transport_with_tool(json!({
            "name": "echo", "method": "GET", "path": "/things/{{args.id}}"
        }));
        let tool = transport.tools.get("echo").unwrap();
        let mut ctx = Context::default();
        ctx.args = json!({ "id": 7 }).as_object().unwrap().clone();
        ctx.config = config_map(&transport.server, tool);

        assert_eq!(
            transport.render_url(tool, &ctx).unwrap(),
            "http://u/things/7"
        );
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("post").unwrap(), reqwest::Method::POST);
        assert!(parse_method("NOT A METHOD").is_err());
    }
}
