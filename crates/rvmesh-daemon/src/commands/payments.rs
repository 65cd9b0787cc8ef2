//! Payment command handlers: retries, status and tips.

use std::sync::Arc;

use serde_json::Value;

use rvmesh_types::payment::SubjectTag;

use super::{param_id, param_str, param_u32, param_u64, to_value, Result};
use crate::DaemonState;

/// Start a new attempt cycle.
///
/// With `peer`, `file_id` and `index` the failed chunk is also put back at
/// `has_invoice`; with only `subject` just the payment record is reset.
pub async fn retry_payment(state: &Arc<DaemonState>, params: &Value) -> Result {
    if params.get("file_id").is_some() {
        let peer = param_id(params, "peer")?;
        let file_id = param_id(params, "file_id")?;
        let index = param_u32(params, "index")?;
        state.transfers.retry_chunk(&peer, &file_id, index).await?;
        let subject = SubjectTag::chunk(&file_id, index);
        return to_value(state.payments.status(&subject).await?);
    }
    let subject = SubjectTag::from_raw(param_str(params, "subject")?);
    to_value(state.payments.reset_for_retry(&subject).await?)
}

pub async fn payment_status(state: &Arc<DaemonState>, params: &Value) -> Result {
    let subject = SubjectTag::from_raw(param_str(params, "subject")?);
    let record = state.payments.status(&subject).await?;
    Ok(serde_json::json!({
        "status": record.as_ref().map(|r| r.status()),
        "attempt": record,
    }))
}

/// Tip a peer. `tag` separates distinct tips to the same peer.
pub async fn tip_user(state: &Arc<DaemonState>, params: &Value) -> Result {
    let peer = param_id(params, "peer")?;
    let amount = param_u64(params, "amount")?;
    let tag = match params.get("tag") {
        Some(_) => param_u32(params, "tag")?,
        None => 0,
    };
    let max_attempts = match params.get("max_attempts") {
        Some(_) => param_u32(params, "max_attempts")?,
        None => state.config.payments.max_attempts,
    };
    let cancel = state.shutdown.child_token();
    let record = rvmesh_payments::tip_user(
        &state.payments,
        state.kx.as_ref(),
        &peer,
        amount,
        tag,
        max_attempts,
        &cancel,
    )
    .await?;
    to_value(record)
}
