//! Stdio transport: child-process lifecycle and newline-delimited framing
//!
//! Owns one child process for the lifetime of its session. Frames are
//! MCP-standard newline-delimited JSON on stdout; stderr is captured into a
//! bounded ring buffer for diagnostics. stdin writes are serialized behind a
//! mutex; one writer per process.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::{demux_frame, TransportError, TransportResult, TransportShared};
use crate::mcp::types::JsonRpcRequest;

/// Lines of stderr retained for diagnostics
const STDERR_TAIL_LINES: usize = 64;

/// Longest stderr line kept; the rest of an oversized line is discarded
const STDERR_LINE_CAP: usize = 8 * 1024;

/// Grace period after `shutdown`/`exit` before the child is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Further wait after kill before giving up on reaping
const KILL_GRACE: Duration = Duration::from_secs(3);

enum FrameRead {
    /// One complete newline-terminated frame is in the buffer
    Frame,
    /// Stream ended (EOF counts even mid-frame)
    Eof,
    /// Running frame size crossed the cap; the payload carries the bytes
    /// seen so far
    TooLarge(usize),
}

/// Read one newline-delimited frame into `buf`, bounded by `cap`.
///
/// Accumulates through `fill_buf`/`consume` so a backend that floods bytes
/// without ever emitting a newline is cut off as soon as the running total
/// exceeds the cap, not after the whole line has been buffered.
async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<FrameRead> {
    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(FrameRead::Eof);
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(newline) => {
                if buf.len() + newline > cap {
                    return Ok(FrameRead::TooLarge(buf.len() + newline));
                }
                buf.extend_from_slice(&chunk[..newline]);
                reader.consume(newline + 1);
                return Ok(FrameRead::Frame);
            }
            None => {
                let len = chunk.len();
                if buf.len() + len > cap {
                    return Ok(FrameRead::TooLarge(buf.len() + len));
                }
                buf.extend_from_slice(chunk);
                reader.consume(len);
            }
        }
    }
}

/// Discard input up to and including the next newline. Returns false on EOF.
async fn skip_past_newline<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<bool> {
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(false);
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(newline) => {
                reader.consume(newline + 1);
                return Ok(true);
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}

/// One spawned MCP server reachable over stdin/stdout
pub struct StdioTransport {
    shared: Arc<TransportShared>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    server_name: String,
}

impl StdioTransport {
    /// Spawn `command` and wire up reader tasks. The child inherits the
    /// gateway's environment with the configured map layered on top.
    pub fn connect(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        max_frame_bytes: usize,
    ) -> TransportResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("Failed to spawn {}: {}", command, e)))?;

        tracing::info!(
            server = %server_name,
            command = %command,
            pid = ?child.id(),
            "Spawned stdio MCP server"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Spawn("Failed to capture stderr".to_string()))?;

        let shared = Arc::new(TransportShared::new());
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        // stderr drain task: ring buffer + tracing, never parsed
        {
            let tail = Arc::clone(&stderr_tail);
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf: Vec<u8> = Vec::new();
                loop {
                    match read_frame(&mut reader, &mut buf, STDERR_LINE_CAP).await {
                        Ok(FrameRead::Eof) => break,
                        Ok(FrameRead::Frame) => {
                            let line = String::from_utf8_lossy(&buf);
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            tracing::debug!(server = %name, stderr = %trimmed);
                            let mut tail = tail.lock().expect("stderr tail lock poisoned");
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(trimmed.to_string());
                        }
                        Ok(FrameRead::TooLarge(_)) => {
                            tracing::debug!(server = %name, "Discarding oversized stderr line");
                            match skip_past_newline(&mut reader).await {
                                Ok(true) => continue,
                                _ => break,
                            }
                        }
                        Err(e) => {
                            tracing::debug!(server = %name, error = %e, "stderr read failed");
                            break;
                        }
                    }
                }
            });
        }

        // stdout reader task: one line = one JSON-RPC frame
        {
            let shared = Arc::clone(&shared);
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf: Vec<u8> = Vec::new();
                loop {
                    match read_frame(&mut reader, &mut buf, max_frame_bytes).await {
                        Ok(FrameRead::Eof) => {
                            tracing::warn!(server = %name, "Unexpected EOF on stdout");
                            shared.mark_dead("unexpected EOF on stdout");
                            break;
                        }
                        Ok(FrameRead::TooLarge(seen)) => {
                            tracing::error!(
                                server = %name,
                                bytes = seen,
                                cap = max_frame_bytes,
                                "Oversized frame on stdout"
                            );
                            shared.mark_dead(format!(
                                "frame of at least {} bytes exceeds cap of {} bytes",
                                seen, max_frame_bytes
                            ));
                            break;
                        }
                        Ok(FrameRead::Frame) => {
                            let Ok(text) = std::str::from_utf8(&buf) else {
                                tracing::error!(server = %name, "Non-UTF-8 frame on stdout");
                                shared.mark_dead("non-UTF-8 frame on stdout");
                                break;
                            };
                            let trimmed = text.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            if let Err(e) = demux_frame(&shared, trimmed) {
                                tracing::error!(server = %name, error = %e, "Frame decode error");
                                shared.mark_dead(format!("decode error: {}", e));
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(server = %name, error = %e, "stdout read failed");
                            shared.mark_dead(format!("stdout read failed: {}", e));
                            break;
                        }
                    }
                }
            });
        }

        Ok(Self {
            shared,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            stderr_tail,
            server_name: server_name.to_string(),
        })
    }

    pub fn shared(&self) -> &TransportShared {
        &self.shared
    }

    /// Write one newline-delimited JSON-RPC frame to the child's stdin
    pub async fn send(&self, message: &JsonRpcRequest) -> TransportResult<()> {
        let mut frame = serde_json::to_string(message)?;
        frame.push('\n');

        let mut stdin = self.stdin.lock().await;
        let writer = stdin
            .as_mut()
            .ok_or_else(|| TransportError::Closed("stdin closed".to_string()))?;

        if let Err(e) = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        }
        .await
        {
            self.shared.mark_dead(format!("stdin write failed: {}", e));
            return Err(TransportError::Closed(format!("stdin write failed: {}", e)));
        }
        Ok(())
    }

    /// Last captured stderr lines, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .expect("stderr tail lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Graceful shutdown: `shutdown` + `exit` frames, close stdin, wait for
    /// the child, then kill and reap if it lingers.
    pub async fn drain(&self) {
        // Best-effort protocol goodbye; ignore failures on a dying pipe.
        let _ = self
            .send(&JsonRpcRequest::new(
                crate::mcp::types::JsonRpcId::Number(0),
                "shutdown",
                serde_json::json!({}),
            ))
            .await;
        let _ = self
            .send(&JsonRpcRequest::notification("exit", None))
            .await;

        // Closing stdin is the real signal most servers act on
        self.stdin.lock().await.take();
        self.shared.mark_dead("transport drained");

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        let status = match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::error!(server = %self.server_name, error = %e, "Failed to wait for child");
                None
            }
            Err(_) => {
                tracing::warn!(server = %self.server_name, "Child unresponsive, killing");
                let _ = child.start_kill();
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => None,
                }
            }
        };

        let tail = self.stderr_tail();
        tracing::info!(
            server = %self.server_name,
            exit_status = ?status,
            stderr_tail = ?tail.last(),
            "Stdio MCP server shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::Transport;
    use crate::mcp::types::JsonRpcId;

    const CAP: usize = 4 * 1024 * 1024;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    async fn wait_dead(shared: &TransportShared) {
        for _ in 0..100 {
            if shared.is_dead() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("transport never died");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let result = StdioTransport::connect(
            "ghost",
            "/nonexistent-mcp-server-binary",
            &[],
            &HashMap::new(),
            None,
            CAP,
        );
        assert!(matches!(result, Err(TransportError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_handshake_against_stub_server() {
        // Answers the first request (the gateway allocates it id 1) with a
        // valid initialize result, then idles.
        let script = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"stub","version":"0"}}}'; read line2; sleep 10"#;
        let transport = Transport::Stdio(
            StdioTransport::connect("stub", "sh", &sh(script), &HashMap::new(), None, CAP)
                .unwrap(),
        );

        let result = transport
            .initialize(JsonRpcId::Number(1), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.server_info.name, "stub");
        assert!(!transport.shared().is_dead());

        transport.drain().await;
    }

    #[tokio::test]
    async fn test_immediate_exit_kills_handshake() {
        let transport = Transport::Stdio(
            StdioTransport::connect("dies", "sh", &sh("exit 0"), &HashMap::new(), None, CAP)
                .unwrap(),
        );

        let result = transport
            .initialize(JsonRpcId::Number(1), Duration::from_secs(5))
            .await;
        assert!(result.is_err());
        wait_dead(transport.shared()).await;
        transport.drain().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_marks_dead() {
        // One 200-byte line against a 64-byte cap
        let script = r#"head -c 200 /dev/zero | tr '\0' 'a'; echo"#;
        let transport =
            StdioTransport::connect("big", "sh", &sh(script), &HashMap::new(), None, 64).unwrap();

        wait_dead(transport.shared()).await;
        let reason = transport.shared().death_reason().unwrap();
        assert!(reason.contains("cap"), "unexpected reason: {}", reason);
        transport.drain().await;
    }

    #[tokio::test]
    async fn test_read_frame_bounds() {
        let data: &[u8] = b"{\"ok\":true}\nrest";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        assert!(matches!(
            read_frame(&mut reader, &mut buf, 64).await.unwrap(),
            FrameRead::Frame
        ));
        assert_eq!(buf, b"{\"ok\":true}");

        // A frame bigger than the cap trips without needing a newline
        let flood = vec![b'a'; 200];
        let mut reader = BufReader::new(&flood[..]);
        assert!(matches!(
            read_frame(&mut reader, &mut buf, 64).await.unwrap(),
            FrameRead::TooLarge(seen) if seen > 64
        ));
    }

    #[tokio::test]
    async fn test_unterminated_flood_marks_dead() {
        // 200 bytes and never a newline against a 64-byte cap
        let script = r#"head -c 200 /dev/zero | tr '\0' 'a'; sleep 10"#;
        let transport =
            StdioTransport::connect("flood", "sh", &sh(script), &HashMap::new(), None, 64)
                .unwrap();

        wait_dead(transport.shared()).await;
        let reason = transport.shared().death_reason().unwrap();
        assert!(reason.contains("cap"), "unexpected reason: {}", reason);
        transport.drain().await;
    }

    #[tokio::test]
    async fn test_garbage_output_marks_dead() {
        let script = r#"echo 'this is not json'; sleep 10"#;
        let transport =
            StdioTransport::connect("noisy", "sh", &sh(script), &HashMap::new(), None, CAP)
                .unwrap();

        wait_dead(transport.shared()).await;
        transport.drain().await;
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let script = r#"echo 'warming up' >&2; read line; sleep 10"#;
        let transport =
            StdioTransport::connect("chatty", "sh", &sh(script), &HashMap::new(), None, CAP)
                .unwrap();

        for _ in 0..100 {
            if !transport.stderr_tail().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(transport.stderr_tail(), vec!["warming up".to_string()]);
        transport.drain().await;
    }

    #[tokio::test]
    async fn test_env_override_reaches_child() {
        let mut env = HashMap::new();
        env.insert("GATEWAY_TEST_MARKER".to_string(), "42".to_string());
        // Child echoes the env var back as a JSON-RPC response to id 1
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"marker":"%s"}}\n' "$GATEWAY_TEST_MARKER"; sleep 10"#;
        let transport =
            StdioTransport::connect("envy", "sh", &sh(script), &env, None, CAP).unwrap();

        let rx = transport.shared().register(JsonRpcId::Number(1)).unwrap();
        transport
            .send(&JsonRpcRequest::new(
                JsonRpcId::Number(1),
                "probe",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.result.unwrap()["marker"], "42");
        transport.drain().await;
    }
}
