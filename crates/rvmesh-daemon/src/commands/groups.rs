//! Group roster command handlers.

use std::sync::Arc;

use serde_json::Value;

use rvmesh_types::group::RosterChange;

use super::{param_id, param_str, to_value, Result};
use crate::groups::GroupError;
use crate::rpc::RpcError;
use crate::DaemonState;

pub async fn create_group(state: &Arc<DaemonState>, params: &Value) -> Result {
    let name = param_str(params, "name")?;
    if name.trim().is_empty() {
        return Err(RpcError::invalid_params("name must not be empty"));
    }
    to_value(state.groups.create_group(name).await?)
}

/// Apply a local roster change, e.g. `{"kind": "join", "member": "<hex>"}`.
pub async fn apply_group_update(state: &Arc<DaemonState>, params: &Value) -> Result {
    let group_id = param_id(params, "group_id")?;
    let change: RosterChange = params
        .get("change")
        .cloned()
        .ok_or_else(|| RpcError::invalid_params("change required"))
        .and_then(|v| {
            serde_json::from_value(v).map_err(|e| RpcError::invalid_params(&e.to_string()))
        })?;
    to_value(state.groups.apply_local(&group_id, change).await?)
}

pub async fn get_group(state: &Arc<DaemonState>, params: &Value) -> Result {
    let group_id = param_id(params, "group_id")?;
    let roster = state
        .groups
        .get(&group_id)
        .await?
        .ok_or_else(|| GroupError::UnknownGroup(hex::encode(group_id)))?;
    to_value(roster)
}

pub async fn list_groups(state: &Arc<DaemonState>) -> Result {
    to_value(state.groups.list().await?)
}
