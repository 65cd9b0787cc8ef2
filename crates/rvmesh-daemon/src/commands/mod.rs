//! IPC command handlers.
//!
//! Each submodule implements the commands for one area: key exchange,
//! file transfer, payments and groups.

pub mod groups;
pub mod kx;
pub mod payments;
pub mod transfer;

use std::sync::Arc;

use serde_json::Value;

use rvmesh_types::transfer::Direction;

use crate::rpc::RpcError;
use crate::DaemonState;

pub(crate) type Result = std::result::Result<Value, RpcError>;

pub(crate) fn param_str<'a>(params: &'a Value, name: &str) -> std::result::Result<&'a str, RpcError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params(&format!("{name} required")))
}

pub(crate) fn param_u64(params: &Value, name: &str) -> std::result::Result<u64, RpcError> {
    params
        .get(name)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_params(&format!("{name} must be a non-negative integer")))
}

pub(crate) fn param_u32(params: &Value, name: &str) -> std::result::Result<u32, RpcError> {
    u32::try_from(param_u64(params, name)?)
        .map_err(|_| RpcError::invalid_params(&format!("{name} out of range")))
}

/// A 32-byte identifier given as 64 hex characters.
pub(crate) fn param_id(params: &Value, name: &str) -> std::result::Result<[u8; 32], RpcError> {
    let raw = param_str(params, name)?;
    let mut out = [0u8; 32];
    hex::decode_to_slice(raw, &mut out)
        .map_err(|_| RpcError::invalid_params(&format!("{name} must be 32 bytes of hex")))?;
    Ok(out)
}

pub(crate) fn param_direction(params: &Value) -> std::result::Result<Direction, RpcError> {
    match params.get("direction").and_then(|v| v.as_str()).unwrap_or("download") {
        "download" => Ok(Direction::Download),
        "upload" => Ok(Direction::Upload),
        other => Err(RpcError::invalid_params(&format!("unknown direction {other}"))),
    }
}

pub(crate) fn to_value<T: serde::Serialize>(value: T) -> Result {
    serde_json::to_value(value).map_err(|e| RpcError::internal_error(&e.to_string()))
}

/// Buffered events with a sequence number above `after`.
pub fn events_since(state: &Arc<DaemonState>, params: &Value) -> Result {
    let after = params.get("after").and_then(|v| v.as_u64()).unwrap_or(0);
    to_value(state.event_log.since(after))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_id() {
        let params = serde_json::json!({ "peer": "ab".repeat(32), "short": "abcd" });
        assert_eq!(param_id(&params, "peer").expect("id"), [0xab; 32]);
        assert_eq!(param_id(&params, "short").map_err(|e| e.code), Err(-32602));
        assert_eq!(param_id(&params, "missing").map_err(|e| e.code), Err(-32602));
    }

    #[test]
    fn test_param_direction_defaults_to_download() {
        let none = serde_json::json!({});
        assert_eq!(param_direction(&none).expect("dir"), Direction::Download);
        let up = serde_json::json!({ "direction": "upload" });
        assert_eq!(param_direction(&up).expect("dir"), Direction::Upload);
        let bad = serde_json::json!({ "direction": "sideways" });
        assert!(param_direction(&bad).is_err());
    }
}
