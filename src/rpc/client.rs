//! Line-delimited JSON tool client over a child process's stdio.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{RpcError, ToolClient, ToolOutcome, ToolSchema, WireRequest, WireResponse};

/// Tool client that spawns the controlled application's endpoint as a
/// child process and exchanges one JSON object per line over its stdio.
///
/// Calls are serialized: the protocol has no request ids, so responses
/// are matched to requests by order. The channel lock enforces one
/// in-flight call at a time.
pub struct StdioToolClient {
    channel: Mutex<Channel>,
    call_timeout: Duration,
}

struct Channel {
    // Held so the process is reaped when the client drops
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl StdioToolClient {
    /// Spawn the endpoint process. The child's stderr is inherited so its
    /// own logging stays visible; only stdout carries protocol traffic.
    pub fn spawn(
        command: &str,
        args: &[String],
        call_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RpcError::Spawn(format!("{} {}: {}", command, args.join(" "), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Spawn("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Spawn("child stdout not captured".to_string()))?;

        tracing::info!(command, ?args, "tool endpoint spawned");

        Ok(Self {
            channel: Mutex::new(Channel {
                _child: child,
                stdin,
                reader: BufReader::new(stdout),
            }),
            call_timeout,
        })
    }

    async fn roundtrip(&self, request: &WireRequest<'_>) -> Result<WireResponse, RpcError> {
        let mut channel = self.channel.lock().await;

        let mut line = serde_json::to_string(request)
            .map_err(|e| RpcError::Protocol(format!("request encode failed: {}", e)))?;
        line.push('\n');
        channel.stdin.write_all(line.as_bytes()).await?;
        channel.stdin.flush().await?;

        // Non-JSON lines on stdout (stray prints from the endpoint) are
        // skipped rather than failing the call.
        loop {
            let mut response_line = String::new();
            let read = tokio::time::timeout(
                self.call_timeout,
                channel.reader.read_line(&mut response_line),
            )
            .await
            .map_err(|_| RpcError::Timeout(self.call_timeout))??;

            if read == 0 {
                return Err(RpcError::Closed);
            }
            let trimmed = response_line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<WireResponse>(trimmed) {
                Ok(response) => return Ok(response),
                Err(_) => {
                    tracing::debug!(line = trimmed, "skipping non-protocol output");
                }
            }
        }
    }
}

#[async_trait]
impl ToolClient for StdioToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, RpcError> {
        let params = serde_json::json!({});
        let response = self
            .roundtrip(&WireRequest {
                tool: "list_tools",
                params: &params,
            })
            .await?;
        if !response.success {
            let outcome = response.into_outcome();
            return Err(RpcError::Protocol(format!(
                "tool discovery failed: {}",
                outcome.result
            )));
        }
        let result = response
            .result
            .ok_or_else(|| RpcError::Protocol("tool discovery returned no result".to_string()))?;

        #[derive(serde::Deserialize)]
        struct ToolList {
            tools: Vec<ToolSchema>,
        }
        let list: ToolList = serde_json::from_value(result)
            .map_err(|e| RpcError::Protocol(format!("malformed tool list: {}", e)))?;

        tracing::info!(count = list.tools.len(), "discovered tools");
        Ok(list.tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<ToolOutcome, RpcError> {
        tracing::debug!(tool = name, "calling tool");
        let response = self
            .roundtrip(&WireRequest {
                tool: name,
                params: &params,
            })
            .await?;
        Ok(response.into_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tiny echo endpoint written in shell: answers every request line
    // with a fixed success response.
    fn echo_client(response: &str) -> StdioToolClient {
        let script = format!("while read -r _line; do echo '{}'; done", response);
        StdioToolClient::spawn(
            "sh",
            &["-c".to_string(), script],
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn call_tool_roundtrip() {
        let client = echo_client(r#"{"success": true, "result": "done"}"#);
        let outcome = client
            .call_tool("move_object", serde_json::json!({"name": "Cube"}))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, "done");
    }

    #[tokio::test]
    async fn list_tools_parses_descriptors() {
        let client = echo_client(
            r#"{"success": true, "result": {"tools": [{"name": "get_scene_info", "description": "Scene summary", "inputSchema": {"type": "object"}}]}}"#,
        );
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_scene_info");
    }

    #[tokio::test]
    async fn non_protocol_lines_are_skipped() {
        let script = r#"while read -r _line; do echo 'endpoint starting up'; echo '{"success": true, "result": "ok"}'; done"#;
        let client = StdioToolClient::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
        .unwrap();
        let outcome = client
            .call_tool("get_scene_info", serde_json::json!({}))
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let client = StdioToolClient::spawn(
            "sh",
            &["-c".to_string(), "exit 0".to_string()],
            Duration::from_secs(5),
        );
        // Spawn may succeed even though the child exits at once; the call
        // must then fail with Closed or an I/O error.
        if let Ok(client) = client {
            let err = client
                .call_tool("anything", serde_json::json!({}))
                .await
                .unwrap_err();
            match err {
                RpcError::Closed | RpcError::Io(_) => {}
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
