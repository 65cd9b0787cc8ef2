//! File sharing and chunk transfer command handlers.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use rvmesh_types::transfer::{ChunkState, Direction, FileMetadata};

use super::{param_direction, param_id, param_str, param_u32, param_u64, to_value, Result};
use crate::rpc::RpcError;
use crate::DaemonState;

/// Share a local file. Returns the metadata to hand to downloaders.
pub async fn share_file(state: &Arc<DaemonState>, params: &Value) -> Result {
    let path = param_str(params, "path")?;
    let price = param_u64(params, "chunk_price")?;
    let metadata = state.transfers.share_file(Path::new(path), price).await?;
    to_value(metadata)
}

pub async fn list_shared(state: &Arc<DaemonState>) -> Result {
    to_value(state.transfers.list_shared().await?)
}

/// Start or resume downloading `metadata` from `peer`.
pub async fn begin_download(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = param_id(params, "peer")?;
    let metadata: FileMetadata = params
        .get("metadata")
        .cloned()
        .ok_or_else(|| RpcError::invalid_params("metadata required"))
        .and_then(|v| {
            serde_json::from_value(v).map_err(|e| RpcError::invalid_params(&e.to_string()))
        })?;
    to_value(state.transfers.begin_download(&peer, metadata).await?)
}

/// Pay the held invoice for one chunk, then request it.
pub async fn pay_chunk(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = param_id(params, "peer")?;
    let file_id = param_id(params, "file_id")?;
    let index = param_u32(params, "index")?;
    let cancel = state.shutdown.child_token();
    let paid = state
        .transfers
        .pay_chunk(&peer, &file_id, index, &cancel)
        .await?;
    let request = params
        .get("request")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let state_now = if request && paid == ChunkState::Paid {
        state.transfers.request_chunk(&peer, &file_id, index).await?
    } else {
        paid
    };
    Ok(serde_json::json!({ "index": index, "state": state_now }))
}

pub async fn request_chunk(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = param_id(params, "peer")?;
    let file_id = param_id(params, "file_id")?;
    let index = param_u32(params, "index")?;
    let now = state.transfers.request_chunk(&peer, &file_id, index).await?;
    Ok(serde_json::json!({ "index": index, "state": now }))
}

pub async fn transfer_status(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = param_id(params, "peer")?;
    let file_id = param_id(params, "file_id")?;
    let direction = param_direction(params)?;
    to_value(state.transfers.status(&peer, &file_id, direction).await?)
}

pub async fn chunk_state(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = param_id(params, "peer")?;
    let file_id = param_id(params, "file_id")?;
    let index = param_u32(params, "index")?;
    let direction = param_direction(params)?;
    let chunk = state
        .transfers
        .chunk_state(&peer, &file_id, direction, index)
        .await?;
    let invoice = state
        .transfers
        .chunk_invoice(&peer, &file_id, direction, index)
        .await?;
    Ok(serde_json::json!({ "index": index, "state": chunk, "invoice": invoice }))
}

/// Transfers in one direction, or both when none is given.
pub async fn list_transfers(state: &Arc<DaemonState>, params: &Value) -> Result {
    let mut all = Vec::new();
    if params.get("direction").is_some() {
        all.extend(state.transfers.list(param_direction(params)?).await?);
    } else {
        all.extend(state.transfers.list(Direction::Download).await?);
        all.extend(state.transfers.list(Direction::Upload).await?);
    }
    to_value(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use rvmesh_transport::{MemoryRelay, SimLedger};

    #[tokio::test]
    async fn test_share_and_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = testutil::state(&Arc::new(MemoryRelay::new()), &SimLedger::new(), "alice", dir.path());
        let src = dir.path().join("song.ogg");
        std::fs::write(&src, vec![7u8; 1500]).expect("write");

        let meta = share_file(
            &state,
            &serde_json::json!({ "path": src.to_string_lossy(), "chunk_price": 20 }),
        )
        .await
        .expect("share");
        assert_eq!(meta["filename"], "song.ogg");
        assert_eq!(meta["chunk_price_milli_atoms"], 20);

        let shared = list_shared(&state).await.expect("list");
        assert_eq!(shared.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_transfer_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = testutil::state(&Arc::new(MemoryRelay::new()), &SimLedger::new(), "alice", dir.path());
        let params = serde_json::json!({
            "peer": "22".repeat(32),
            "file_id": "33".repeat(32),
        });
        let err = transfer_status(&state, &params).await.expect_err("unknown");
        assert_eq!(err.code, -32031);

        let err = begin_download(&state, &serde_json::json!({ "peer": "22".repeat(32) }))
            .await
            .expect_err("no metadata");
        assert_eq!(err.code, -32602);
    }
}
