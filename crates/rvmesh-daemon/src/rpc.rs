//! JSON-RPC server over a Unix socket.
//!
//! One request per line, one response per line. Library errors map onto
//! stable error codes so front ends can react without parsing messages.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use rvmesh_kx::KxError;
use rvmesh_payments::PaymentError;
use rvmesh_transfer::TransferError;

use crate::commands;
use crate::groups::GroupError;
use crate::DaemonState;

/// JSON-RPC request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// JSON-RPC response.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcError {
    pub code: i32,
    /// Stable error name.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: serde_json::Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl RpcError {
    fn new(code: i32, message: &str, detail: Option<String>) -> Self {
        Self {
            code,
            message: message.to_string(),
            data: detail.map(|d| serde_json::json!({ "detail": d })),
        }
    }

    // Standard JSON-RPC errors

    pub fn parse_error() -> Self {
        Self::new(-32700, "PARSE_ERROR", None)
    }

    pub fn invalid_request() -> Self {
        Self::new(-32600, "INVALID_REQUEST", None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: "METHOD_NOT_FOUND".to_string(),
            data: Some(serde_json::json!({ "method": method })),
        }
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self::new(-32602, "INVALID_PARAMS", Some(detail.to_string()))
    }

    pub fn internal_error(detail: &str) -> Self {
        Self::new(-32603, "INTERNAL_ERROR", Some(detail.to_string()))
    }

    // Key exchange (-3200x)

    pub fn invalid_invite(detail: String) -> Self {
        Self::new(-32001, "INVALID_INVITE", Some(detail))
    }

    pub fn unknown_peer(detail: String) -> Self {
        Self::new(-32002, "UNKNOWN_PEER", Some(detail))
    }

    pub fn stale_session() -> Self {
        Self::new(-32003, "STALE_SESSION", None)
    }

    // Payments (-3202x)

    pub fn retries_exhausted(detail: String) -> Self {
        Self::new(-32020, "RETRIES_EXHAUSTED", Some(detail))
    }

    pub fn capability_unavailable(detail: String) -> Self {
        Self::new(-32021, "PAYMENT_CAPABILITY_UNAVAILABLE", Some(detail))
    }

    pub fn payment_failed(detail: String) -> Self {
        Self::new(-32022, "PAYMENT_FAILED", Some(detail))
    }

    pub fn invoice_expired(detail: String) -> Self {
        Self::new(-32023, "INVOICE_EXPIRED", Some(detail))
    }

    // Transfers (-3203x)

    pub fn content_mismatch(detail: String) -> Self {
        Self::new(-32030, "CONTENT_MISMATCH", Some(detail))
    }

    pub fn unknown_transfer(detail: String) -> Self {
        Self::new(-32031, "UNKNOWN_TRANSFER", Some(detail))
    }

    pub fn invalid_transition(detail: String) -> Self {
        Self::new(-32032, "INVALID_TRANSITION", Some(detail))
    }

    pub fn not_shared(detail: String) -> Self {
        Self::new(-32033, "NOT_SHARED", Some(detail))
    }

    // Groups (-3204x)

    pub fn roster_rejected(detail: String) -> Self {
        Self::new(-32040, "ROSTER_REJECTED", Some(detail))
    }

    pub fn unknown_group(detail: String) -> Self {
        Self::new(-32041, "UNKNOWN_GROUP", Some(detail))
    }

    pub fn cancelled() -> Self {
        Self::new(-32050, "CANCELLED", None)
    }
}

impl From<KxError> for RpcError {
    fn from(e: KxError) -> Self {
        let detail = e.to_string();
        match e {
            KxError::InvalidInvite(_) => Self::invalid_invite(detail),
            KxError::UnknownPeer(_) => Self::unknown_peer(detail),
            KxError::StaleSession => Self::stale_session(),
            KxError::InvalidRequest(_) => Self::invalid_params(&detail),
            KxError::Cancelled => Self::cancelled(),
            _ => Self::internal_error(&detail),
        }
    }
}

impl From<PaymentError> for RpcError {
    fn from(e: PaymentError) -> Self {
        let detail = e.to_string();
        match e {
            PaymentError::RetriesExhausted { .. } => Self::retries_exhausted(detail),
            PaymentError::CapabilityUnavailable(_) => Self::capability_unavailable(detail),
            PaymentError::PaymentFailed(_) => Self::payment_failed(detail),
            PaymentError::InvoiceExpired(_) => Self::invoice_expired(detail),
            PaymentError::AmountMismatch { .. } | PaymentError::NotFound(_) => Self::invalid_params(&detail),
            PaymentError::Cancelled => Self::cancelled(),
            _ => Self::internal_error(&detail),
        }
    }
}

impl From<TransferError> for RpcError {
    fn from(e: TransferError) -> Self {
        let detail = e.to_string();
        match e {
            TransferError::Payment(inner) => inner.into(),
            TransferError::ContentMismatch { .. } => Self::content_mismatch(detail),
            TransferError::UnknownTransfer { .. } => Self::unknown_transfer(detail),
            TransferError::InvalidTransition { .. } | TransferError::NotSettled(_) => {
                Self::invalid_transition(detail)
            }
            TransferError::NotShared(_) => Self::not_shared(detail),
            TransferError::ChunkOutOfRange { .. }
            | TransferError::InvalidMetadata(_)
            | TransferError::PriceMismatch { .. } => Self::invalid_params(&detail),
            TransferError::Cancelled => Self::cancelled(),
            _ => Self::internal_error(&detail),
        }
    }
}

impl From<GroupError> for RpcError {
    fn from(e: GroupError) -> Self {
        let detail = e.to_string();
        match e {
            GroupError::UnknownGroup(_) => Self::unknown_group(detail),
            GroupError::Roster(_) => Self::roster_rejected(detail),
            _ => Self::internal_error(&detail),
        }
    }
}

/// The RPC server.
pub struct RpcServer {
    state: Arc<DaemonState>,
    socket_path: PathBuf,
}

impl RpcServer {
    pub fn new(state: Arc<DaemonState>, socket_path: PathBuf) -> Self {
        Self { state, socket_path }
    }

    /// Run the server, accepting connections until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        // Remove stale socket file
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "IPC server listening");

        loop {
            let accepted = tokio::select! {
                _ = self.state.shutdown.cancelled() => return Ok(()),
                a = listener.accept() => a,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream).await {
                            warn!(error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_connection(state: Arc<DaemonState>, stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break; // EOF
        }

        let response = handle_line(&state, &line).await;
        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn handle_line(state: &Arc<DaemonState>, line: &str) -> RpcResponse {
    match serde_json::from_str::<RpcRequest>(line) {
        Ok(request) if request.jsonrpc != "2.0" => {
            RpcResponse::error(request.id, RpcError::invalid_request())
        }
        Ok(request) => dispatch_request(state, request).await,
        Err(_) => RpcResponse::error(serde_json::Value::Null, RpcError::parse_error()),
    }
}

/// Dispatch a JSON-RPC request to the appropriate command handler.
pub async fn dispatch_request(state: &Arc<DaemonState>, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    let method = request.method.as_str();
    let params = &request.params;

    debug!(method, "dispatching RPC");

    let result = match method {
        // Key exchange
        "create_invite" => commands::kx::create_invite(state, params).await,
        "accept_invite" => commands::kx::accept_invite(state, params).await,
        "request_mediated_introduction" => {
            commands::kx::request_mediated_introduction(state, params).await
        }
        "request_transitive_reset" => commands::kx::request_transitive_reset(state, params).await,
        "kx_stage" => commands::kx::kx_stage(state, params).await,
        "list_peers" => commands::kx::list_peers(state).await,
        "ignore_peer" => commands::kx::ignore_peer(state, params).await,
        "get_my_identity" => commands::kx::get_my_identity(state).await,

        // File transfer
        "share_file" => commands::transfer::share_file(state, params).await,
        "list_shared" => commands::transfer::list_shared(state).await,
        "begin_download" => commands::transfer::begin_download(state, params).await,
        "pay_chunk" => commands::transfer::pay_chunk(state, params).await,
        "request_chunk" => commands::transfer::request_chunk(state, params).await,
        "transfer_status" => commands::transfer::transfer_status(state, params).await,
        "chunk_state" => commands::transfer::chunk_state(state, params).await,
        "list_transfers" => commands::transfer::list_transfers(state, params).await,

        // Payments
        "retry_payment" => commands::payments::retry_payment(state, params).await,
        "payment_status" => commands::payments::payment_status(state, params).await,
        "tip_user" => commands::payments::tip_user(state, params).await,

        // Groups
        "create_group" => commands::groups::create_group(state, params).await,
        "apply_group_update" => commands::groups::apply_group_update(state, params).await,
        "get_group" => commands::groups::get_group(state, params).await,
        "list_groups" => commands::groups::list_groups(state).await,

        // Events
        "events_since" => commands::events_since(state, params),

        _ => Err(RpcError::method_not_found(method)),
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(err) => RpcResponse::error(id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use rvmesh_transport::{MemoryRelay, SimLedger};

    #[test]
    fn test_error_mapping() {
        let err: RpcError = KxError::InvalidInvite("bad base64".into()).into();
        assert_eq!(err.code, -32001);
        assert_eq!(err.message, "INVALID_INVITE");

        let err: RpcError = TransferError::Payment(PaymentError::RetriesExhausted {
            subject: "chunk:aa:0".into(),
            last_error: None,
        })
        .into();
        assert_eq!(err.code, -32020);

        let err: RpcError = TransferError::ContentMismatch {
            file_id: "aa".into(),
            index: 2,
        }
        .into();
        assert_eq!(err.message, "CONTENT_MISMATCH");

        assert_eq!(RpcError::method_not_found("nope").code, -32601);
    }

    #[test]
    fn test_rpc_response_shapes() {
        let ok = RpcResponse::success(serde_json::json!(1), serde_json::json!({"x": 1}));
        assert!(ok.result.is_some() && ok.error.is_none());
        let err = RpcResponse::error(serde_json::json!(1), RpcError::internal_error("test"));
        assert!(err.result.is_none() && err.error.is_some());
    }

    #[tokio::test]
    async fn test_handle_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = testutil::state(
            &std::sync::Arc::new(MemoryRelay::new()),
            &SimLedger::new(),
            "alice",
            dir.path(),
        );

        let resp = handle_line(&state, "not json").await;
        assert_eq!(resp.error.map(|e| e.code), Some(-32700));

        let resp = handle_line(&state, r#"{"jsonrpc":"1.0","id":1,"method":"list_peers"}"#).await;
        assert_eq!(resp.error.map(|e| e.code), Some(-32600));

        let resp = handle_line(&state, r#"{"jsonrpc":"2.0","id":2,"method":"bogus"}"#).await;
        assert_eq!(resp.error.map(|e| e.code), Some(-32601));

        let resp = handle_line(&state, r#"{"jsonrpc":"2.0","id":3,"method":"list_peers"}"#).await;
        assert_eq!(resp.result, Some(serde_json::json!([])));
    }
}
