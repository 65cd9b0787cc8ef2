//! Key exchange and address book command handlers.

use std::sync::Arc;

use serde_json::Value;

use rvmesh_kx::InviteMode;

use super::{param_id, param_str, to_value, Result};
use crate::rpc::RpcError;
use crate::DaemonState;

/// Create an invite. `mode` is `open` (default) or `reset`, which needs `peer`.
pub async fn create_invite(state: &Arc<DaemonState>, params: &Value) -> Result {
    let mode = match params.get("mode").and_then(|v| v.as_str()).unwrap_or("open") {
        "open" => InviteMode::Open,
        "reset" => InviteMode::ResetWith(param_id(params, "peer")?),
        other => return Err(RpcError::invalid_params(&format!("unknown invite mode {other}"))),
    };
    let created = state.kx.create_invite(mode).await?;
    state.rv_changed.notify_one();
    Ok(serde_json::json!({
        "initial_rv": hex::encode(created.initial_rv),
        "invite": created.blob,
    }))
}

pub async fn accept_invite(state: &Arc<DaemonState>, params: &Value) -> Result {
    let blob = param_str(params, "invite")?;
    let accepted = state.kx.accept_invite(blob).await?;
    state.rv_changed.notify_one();
    Ok(serde_json::json!({
        "initial_rv": hex::encode(accepted.initial_rv),
        "inviter": accepted.inviter,
        "duplicate": accepted.duplicate,
    }))
}

pub async fn request_mediated_introduction(state: &Arc<DaemonState>, params: &Value) -> Result {
    let mediator = param_id(params, "mediator")?;
    let target = param_id(params, "target")?;
    state
        .kx
        .request_mediated_introduction(&mediator, &target)
        .await?;
    Ok(serde_json::json!({ "status": "requested" }))
}

pub async fn request_transitive_reset(state: &Arc<DaemonState>, params: &Value) -> Result {
    let mediator = param_id(params, "mediator")?;
    let target = param_id(params, "target")?;
    state.kx.request_transitive_reset(&mediator, &target).await?;
    Ok(serde_json::json!({ "status": "requested" }))
}

/// Stage of a handshake, by `initial_rv` or by `peer`.
pub async fn kx_stage(state: &Arc<DaemonState>, params: &Value) -> Result {
    let stage = if params.get("initial_rv").is_some() {
        state.kx.session_stage(&param_id(params, "initial_rv")?).await?
    } else {
        state.kx.peer_stage(&param_id(params, "peer")?).await?
    };
    Ok(serde_json::json!({ "stage": stage }))
}

pub async fn list_peers(state: &Arc<DaemonState>) -> Result {
    to_value(state.kx.list_peers().await?)
}

pub async fn ignore_peer(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = param_id(params, "peer")?;
    let ignored = params
        .get("ignored")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    state.kx.set_ignored(&peer, ignored).await?;
    Ok(serde_json::json!({ "ignored": ignored }))
}

pub async fn get_my_identity(state: &Arc<DaemonState>) -> Result {
    to_value(state.kx.identity().public())
}
