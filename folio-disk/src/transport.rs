use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Serialize)]
struct JsonRpcResponse<'a> {
    jsonrpc: &'a str,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Serialize)]
struct JsonRpcErrorBody {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'a str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Newline-delimited JSON-RPC writer. Cloneable so event listeners can push
/// notifications; every message is written and flushed as one line under a
/// lock, so concurrent writers never interleave.
#[derive(Clone)]
pub struct NdjsonTransport {
    sink: Sink,
}

impl Default for NdjsonTransport {
    fn default() -> Self {
        Self::stdout()
    }
}

impl NdjsonTransport {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn write_response(&self, id: u64, result: serde_json::Value) {
        self.write_line(&JsonRpcResponse {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        });
    }

    pub fn write_error(
        &self,
        id: u64,
        code: i32,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        self.write_line(&JsonRpcResponse {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcErrorBody {
                code,
                message: message.into(),
                data,
            }),
        });
    }

    pub fn write_notification(&self, method: &str, params: serde_json::Value) {
        self.write_line(&JsonRpcNotification {
            jsonrpc: "2.0",
            method,
            params: Some(params),
        });
    }

    fn write_line(&self, value: &impl Serialize) {
        let line = match serde_json::to_vec(value) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize: {}", e);
                return;
            }
        };
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        let written = sink
            .write_all(&line)
            .and_then(|_| sink.write_all(b"\n"))
            .and_then(|_| sink.flush());
        if let Err(e) = written {
            tracing::error!("Failed to write message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shared buffer that the test can inspect after the transport wrote.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn messages_are_single_lines() {
        let out = Captured::default();
        let transport = NdjsonTransport::new(out.clone());
        transport.write_response(1, serde_json::json!({"ok": true}));
        transport.write_error(2, -32000, "boom", Some(serde_json::json!({"diskCode": "X"})));
        transport.write_notification("disk/event", serde_json::json!({"type": "create"}));

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["result"]["ok"], true);
        assert_eq!(lines[1]["error"]["data"]["diskCode"], "X");
        assert_eq!(lines[2]["method"], "disk/event");
        assert!(lines[2].get("id").is_none());
    }
}
