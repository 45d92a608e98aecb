//! Frame codec for the `v4.channel.k8s.io` exec subprotocol.
//!
//! Every binary frame starts with one channel byte followed by the payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{ExitStatus, TerminalSize};

pub const SUBPROTOCOL: &str = "v4.channel.k8s.io";

pub const STDIN: u8 = 0;
pub const STDOUT: u8 = 1;
pub const STDERR: u8 = 2;
pub const STATUS: u8 = 3;
pub const RESIZE: u8 = 4;

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Stdout(Bytes),
    Stderr(Bytes),
    Status(ExitStatus),
}

#[derive(Serialize)]
struct ResizePayload {
    #[serde(rename = "Width")]
    width: u16,
    #[serde(rename = "Height")]
    height: u16,
}

#[derive(Debug, Default, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    details: Option<StatusDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusCause {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

pub fn encode_stdin(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 1);
    frame.push(STDIN);
    frame.extend_from_slice(data);
    frame
}

pub fn encode_resize(size: TerminalSize) -> Vec<u8> {
    let payload = ResizePayload {
        width: size.width,
        height: size.height,
    };
    let mut frame = vec![RESIZE];
    // Serializing two integers cannot fail.
    frame.extend(serde_json::to_vec(&payload).unwrap_or_default());
    frame
}

/// Decode one server frame. Empty payloads and unknown channels yield `None`.
pub fn decode(frame: &[u8]) -> Option<Frame> {
    let (&channel, payload) = frame.split_first()?;
    match channel {
        STDOUT if !payload.is_empty() => Some(Frame::Stdout(Bytes::copy_from_slice(payload))),
        STDERR if !payload.is_empty() => Some(Frame::Stderr(Bytes::copy_from_slice(payload))),
        STATUS if !payload.is_empty() => Some(Frame::Status(parse_status(payload))),
        _ => None,
    }
}

/// Interpret the status object sent on the error channel.
pub fn parse_status(payload: &[u8]) -> ExitStatus {
    let status: StatusPayload = match serde_json::from_slice(payload) {
        Ok(status) => status,
        Err(_) => {
            return ExitStatus::failure(None, String::from_utf8_lossy(payload).into_owned());
        }
    };

    if status.status == "Success" {
        return ExitStatus::success();
    }

    let code = if status.reason == "NonZeroExitCode" {
        status
            .details
            .iter()
            .flat_map(|d| d.causes.iter())
            .find(|c| c.reason == "ExitCode")
            .and_then(|c| c.message.parse().ok())
    } else {
        None
    };
    let message = if status.message.is_empty() {
        "command failed".to_string()
    } else {
        status.message
    };
    ExitStatus::failure(code, message)
}
