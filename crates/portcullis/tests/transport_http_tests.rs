//! HTTP template transport tests against a fake upstream.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use portcullis::config::{HttpServer, ToolDef};
use portcullis::dispatch::{self, Gateway};
use portcullis::loader::{FileConfigStore, StateLoader};
use portcullis::session::MemoryStore;
use portcullis::template::RequestContext;
use portcullis::transport::{HttpTransport, Transport};

fn transport(upstream_url: &str, tools: Vec<Value>) -> HttpTransport {
    let tools: Vec<ToolDef> = tools
        .into_iter()
        .map(|t| serde_json::from_value(t).unwrap())
        .collect();
    let server = HttpServer {
        name: "backend".to_string(),
        description: String::new(),
        url: upstream_url.to_string(),
        tools: tools.iter().map(|t| t.name.clone()).collect(),
    };
    let tools: HashMap<String, ToolDef> =
        tools.into_iter().map(|t| (t.name.clone(), t)).collect();
    HttpTransport::new(server, tools)
}

fn call(name: &str, arguments: Value) -> mcpkit::CallToolParams {
    serde_json::from_value(json!({ "name": name, "arguments": arguments })).unwrap()
}

#[tokio::test]
async fn test_echo_posts_arguments_as_body() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/e"))
        .and(body_json(json!({ "x": 42 })))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "echo",
            "method": "POST",
            "path": "{{config.url}}/e",
            "args": [ { "name": "x", "position": "body", "type": "number" } ]
        })],
    );

    let result = transport
        .call_tool(call("echo", json!({ "x": 42 })), &RequestContext::default())
        .await;

    assert!(!result.is_error);
    assert_eq!(result.content[0].as_text(), Some("{\"ok\":true}"));
}

#[tokio::test]
async fn test_query_and_header_positions() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(header("x-api-key", "k123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("found"))
        .expect(1)
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "search",
            "method": "GET",
            "path": "{{config.url}}/search",
            "args": [
                { "name": "q", "position": "query", "type": "string" },
                { "name": "x-api-key", "position": "header", "type": "string" }
            ]
        })],
    );

    let result = transport
        .call_tool(
            call("search", json!({ "q": "rust", "x-api-key": "k123" })),
            &RequestContext::default(),
        )
        .await;

    assert!(!result.is_error);
    assert_eq!(result.content[0].as_text(), Some("found"));
}

#[tokio::test]
async fn test_path_args_inline_into_url() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/things/7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("thing 7"))
        .expect(1)
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "get_thing",
            "method": "GET",
            "path": "{{config.url}}/things/{{args.id}}",
            "args": [ { "name": "id", "position": "path", "type": "number" } ]
        })],
    );

    let result = transport
        .call_tool(call("get_thing", json!({ "id": 7 })), &RequestContext::default())
        .await;

    assert!(!result.is_error);
    assert_eq!(result.content[0].as_text(), Some("thing 7"));
}

#[tokio::test]
async fn test_request_body_template_takes_precedence() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/wrap"))
        .and(body_json(json!({ "wrapped": { "x": 1 } })))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "wrap",
            "method": "POST",
            "path": "{{config.url}}/wrap",
            "request_body": "{\"wrapped\": {{toJSON(args)}}}",
            "args": [ { "name": "x", "position": "body", "type": "number" } ]
        })],
    );

    let result = transport
        .call_tool(call("wrap", json!({ "x": 1 })), &RequestContext::default())
        .await;

    assert!(!result.is_error);
}

#[tokio::test]
async fn test_response_body_template_shapes_output() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"user\":{\"name\":\"ada\",\"id\":7}}"),
        )
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "whoami",
            "method": "GET",
            "path": "{{config.url}}/user",
            "response_body": "name={{response.data.user.name}}"
        })],
    );

    let result = transport
        .call_tool(call("whoami", json!({})), &RequestContext::default())
        .await;

    assert!(!result.is_error);
    assert_eq!(result.content[0].as_text(), Some("name=ada"));
}

#[tokio::test]
async fn test_default_args_and_json_string_normalization() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/q"))
        .and(body_json(json!({ "filter": { "kind": "x" }, "limit": 10 })))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "q",
            "method": "POST",
            "path": "{{config.url}}/q",
            "args": [
                { "name": "filter", "position": "body", "type": "object" },
                { "name": "limit", "position": "body", "type": "number", "default": 10 }
            ]
        })],
    );

    // filter arrives double-encoded and limit is omitted.
    let result = transport
        .call_tool(
            call("q", json!({ "filter": "{\"kind\":\"x\"}" })),
            &RequestContext::default(),
        )
        .await;

    assert!(!result.is_error);
}

#[tokio::test]
async fn test_session_headers_reach_templates() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "me",
            "method": "GET",
            "path": "{{config.url}}/me",
            "headers": { "Authorization": "{{request.headers.authorization}}" }
        })],
    );

    let mut ctx = RequestContext::default();
    ctx.headers
        .insert("authorization".to_string(), "Bearer tok".to_string());

    let result = transport.call_tool(call("me", json!({})), &ctx).await;
    assert!(!result.is_error);
}

#[tokio::test]
async fn test_upstream_failure_is_error_result() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend down"))
        .mount(&upstream)
        .await;

    let transport = transport(
        &upstream.uri(),
        vec![json!({
            "name": "boom",
            "method": "GET",
            "path": "{{config.url}}/boom"
        })],
    );

    let result = transport
        .call_tool(call("boom", json!({})), &RequestContext::default())
        .await;

    assert!(result.is_error);
    let text = result.content[0].as_text().unwrap();
    assert!(text.starts_with("Tool execution failed"));
    assert!(text.contains("503"));
}

#[tokio::test]
async fn test_unreachable_upstream_is_error_result() {
    // Nothing listens here.
    let transport = transport(
        "http://127.0.0.1:1",
        vec![json!({
            "name": "gone",
            "method": "GET",
            "path": "{{config.url}}/x"
        })],
    );

    let result = transport
        .call_tool(call("gone", json!({})), &RequestContext::default())
        .await;

    assert!(result.is_error);
    assert!(result.content[0]
        .as_text()
        .unwrap()
        .starts_with("Tool execution failed"));
}

/// Full gateway path: tools/call through the dispatcher reaches the
/// upstream with the session's auth header merged in.
#[tokio::test]
async fn test_tool_call_through_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/e"))
        .and(body_json(json!({ "x": 42 })))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"echoed\":42}"))
        .expect(1)
        .mount(&upstream)
        .await;

    let config = json!({
        "name": "demo",
        "tenant": "t",
        "routers": [ { "prefix": "/t/a", "server": "s1" } ],
        "http_servers": [ { "name": "s1", "url": upstream.uri(), "tools": ["echo"] } ],
        "tools": [
            {
                "name": "echo",
                "method": "POST",
                "path": "{{config.url}}/e",
                "args": [ { "name": "x", "position": "body", "type": "number" } ]
            }
        ]
    });

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("demo.json"), config.to_string()).unwrap();
    let loader = StateLoader::new(Arc::new(FileConfigStore::new(dir.path())));
    loader.reload().await;
    let app = dispatch::router(Gateway::new(Arc::new(MemoryStore::new()), loader));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/t/a/mcp")
                .header("Accept", "application/json, text/event-stream")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    json!({ "jsonrpc": "2.0", "id": "x", "method": "initialize", "params": {} })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/t/a/mcp")
                .header("Accept", "application/json, text/event-stream")
                .header("Content-Type", "application/json")
                .header("Mcp-Session-Id", &session_id)
                .body(Body::from(
                    json!({
                        "jsonrpc": "2.0",
                        "id": 2,
                        "method": "tools/call",
                        "params": { "name": "echo", "arguments": { "x": 42 } }
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["id"], 2);
    assert!(body["result"].get("isError").is_none());
    assert_eq!(body["result"]["content"][0]["type"], "text");
    assert_eq!(body["result"]["content"][0]["text"], "{\"echoed\":42}");
}
