use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use hotplug_core::Device;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    /// Device to queue, for `trigger`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    /// How long `settle` may wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl DaemonRequest {
    pub fn command(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn connect(home: &Path) -> Result<UnixStream, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })
}

fn write_request(stream: &mut UnixStream, request: &DaemonRequest) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err("daemon socket write", e))?;
    stream
        .write_all(b"\n")
        .map_err(|e| io_err("daemon socket write", e))?;
    stream.flush().map_err(|e| io_err("daemon socket flush", e))
}

fn read_response(reader: &mut impl BufRead) -> Result<DaemonResponse, DaemonError> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err("daemon socket read", e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, request)?;
    read_response(&mut BufReader::new(stream))
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::command("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_ping(home: &Path) -> Result<(), DaemonError> {
    response_into_data(send_request(home, &DaemonRequest::command("ping"))?).map(|_| ())
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    response_into_data(send_request(home, &DaemonRequest::command("stop"))?).map(|_| ())
}

/// Pause or resume the start of new events. Returns the new paused state.
pub fn request_set_paused(home: &Path, paused: bool) -> Result<bool, DaemonError> {
    let cmd = if paused { "pause" } else { "resume" };
    let data = response_into_data(send_request(home, &DaemonRequest::command(cmd))?)?;
    Ok(data["paused"].as_bool().unwrap_or(paused))
}

/// Block until the daemon's queue is empty, or until `timeout` elapses.
pub fn request_settle(home: &Path, timeout: Option<Duration>) -> Result<(), DaemonError> {
    let request = DaemonRequest {
        timeout_ms: timeout.map(|t| t.as_millis() as u64),
        ..DaemonRequest::command("settle")
    };
    response_into_data(send_request(home, &request)?).map(|_| ())
}

/// Queue a synthetic device change.
pub fn request_trigger(home: &Path, device: Device) -> Result<(), DaemonError> {
    let request = DaemonRequest {
        device: Some(device),
        ..DaemonRequest::command("trigger")
    };
    response_into_data(send_request(home, &request)?).map(|_| ())
}

/// Stream broadcast devices to `on_device` until it returns `false` or the
/// daemon closes the connection.
pub fn monitor(home: &Path, mut on_device: impl FnMut(Device) -> bool) -> Result<(), DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, &DaemonRequest::command("monitor"))?;
    let mut reader = BufReader::new(stream);
    response_into_data(read_response(&mut reader)?)?;

    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| io_err("daemon socket read", e))?;
        if read == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let device: Device = serde_json::from_str(line.trim_end())?;
        if !on_device(device) {
            return Ok(());
        }
    }
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
