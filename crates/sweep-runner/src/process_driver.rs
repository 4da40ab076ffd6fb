//! [`TargetDriver`] backed by a child process that speaks line-delimited JSON
//! on stdio. Requests look like `{"id":1,"op":"observe","timeout_ms":500}`;
//! replies echo the id and carry either `result` or
//! `error: {"kind": "...", "message": "..."}`.

use crate::driver::{
    Action, DriverError, DriverErrorKind, Metrics, StateSnapshot, TargetDriver, WindowSpec,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Extra time granted so the driver can report its own timeout first.
const RESPONSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    kind: DriverErrorKind,
    #[serde(default)]
    message: String,
}

pub struct ProcessDriver {
    command: Vec<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Option<Receiver<std::io::Result<String>>>,
    next_id: u64,
}

impl ProcessDriver {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            child: None,
            stdin: None,
            lines: None,
            next_id: 1,
        }
    }

    fn spawn(&mut self) -> Result<(), DriverError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| DriverError::new(DriverErrorKind::Crashed, "driver command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                DriverError::new(
                    DriverErrorKind::Crashed,
                    format!("failed to spawn {}: {}", program, e),
                )
            })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DriverError::new(DriverErrorKind::Crashed, "driver stdout not captured")
        })?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let stop = line.is_err();
                if tx.send(line).is_err() || stop {
                    break;
                }
            }
        });
        tracing::debug!(pid = child.id(), command = ?self.command, "driver process started");
        self.stdin = child.stdin.take();
        self.child = Some(child);
        self.lines = Some(rx);
        Ok(())
    }

    /// Closed while the child still runs, crashed once it has exited.
    fn lost(&mut self, detail: String) -> DriverError {
        let exited = self
            .child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten());
        match exited {
            Some(status) => DriverError::new(
                DriverErrorKind::Crashed,
                format!("driver exited with {}: {}", status, detail),
            ),
            None => DriverError::new(DriverErrorKind::Closed, detail),
        }
    }

    fn call(&mut self, op: &str, payload: Value, timeout: Duration) -> Result<Value, DriverError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = json!({
            "id": id,
            "op": op,
            "timeout_ms": timeout.as_millis() as u64,
        });
        if let (Some(req), Value::Object(extra)) = (request.as_object_mut(), payload) {
            req.extend(extra);
        }

        let written = match self.stdin.as_mut() {
            Some(stdin) => writeln!(stdin, "{}", request).and_then(|_| stdin.flush()),
            None => {
                return Err(DriverError::new(
                    DriverErrorKind::Closed,
                    "driver not connected",
                ))
            }
        };
        if let Err(err) = written {
            return Err(self.lost(format!("write {} failed: {}", op, err)));
        }

        let deadline = Instant::now() + timeout + RESPONSE_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = match self.lines.as_ref() {
                Some(rx) => rx.recv_timeout(remaining),
                None => Err(RecvTimeoutError::Disconnected),
            };
            let line = match received {
                Ok(Ok(line)) => line,
                Ok(Err(err)) => return Err(self.lost(format!("read failed: {}", err))),
                Err(RecvTimeoutError::Timeout) => return Err(DriverError::timeout(op, timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.lost("driver closed its output".to_string()))
                }
            };
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                if !trimmed.is_empty() {
                    tracing::debug!(line = trimmed, "ignoring non-protocol driver output");
                }
                continue;
            }
            let response: Response = serde_json::from_str(trimmed).map_err(|e| {
                DriverError::new(
                    DriverErrorKind::Protocol,
                    format!("unparseable reply to {}: {}", op, e),
                )
            })?;
            if response.id != id {
                tracing::debug!(expected = id, got = response.id, "skipping stale driver reply");
                continue;
            }
            return match response.error {
                Some(err) => Err(DriverError::new(err.kind, err.message)),
                None => Ok(response.result),
            };
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(op: &str, value: Value) -> Result<T, DriverError> {
        // A missing result means nothing was reported.
        let value = if value.is_null() { json!({}) } else { value };
        serde_json::from_value(value).map_err(|e| {
            DriverError::new(
                DriverErrorKind::Protocol,
                format!("invalid {} result: {}", op, e),
            )
        })
    }
}

impl TargetDriver for ProcessDriver {
    fn connect(&mut self, timeout: Duration) -> Result<(), DriverError> {
        self.disconnect();
        self.spawn()?;
        if let Err(err) = self.call("hello", json!({}), timeout) {
            self.disconnect();
            return Err(err);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stdin = None;
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!("driver process stopped");
        }
    }

    fn navigate(&mut self, endpoint: &str, timeout: Duration) -> Result<(), DriverError> {
        self.call("navigate", json!({ "endpoint": endpoint }), timeout)
            .map(|_| ())
    }

    fn observe(&mut self, timeout: Duration) -> Result<StateSnapshot, DriverError> {
        let value = self.call("observe", json!({}), timeout)?;
        Self::decode("observe", value)
    }

    fn act(&mut self, action: &Action, timeout: Duration) -> Result<(), DriverError> {
        tracing::trace!(action = action.name(), "driver act");
        self.call("act", json!({ "action": action }), timeout)
            .map(|_| ())
    }

    fn sample_telemetry(
        &mut self,
        window: &WindowSpec,
        timeout: Duration,
    ) -> Result<Metrics, DriverError> {
        let value = self.call("sample_telemetry", json!({ "window": window }), timeout)?;
        Self::decode("sample_telemetry", value)
    }
}

impl Drop for ProcessDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}
