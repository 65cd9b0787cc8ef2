//! Periodic maintenance: expiry sweeps and outbox resend.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use rvmesh_kx::KxError;
use rvmesh_types::unix_now;

use crate::DaemonState;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_collected: usize,
    pub mediations_expired: usize,
    pub resent: usize,
}

/// Run [`sweep`] every maintenance interval until shutdown.
pub async fn run(state: Arc<DaemonState>) -> anyhow::Result<()> {
    let period = Duration::from_secs(state.config.kx.maintenance_interval_secs.max(1));
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return Ok(()),
            _ = tick.tick() => {
                let report = sweep(&state, unix_now()).await?;
                if report != SweepReport::default() {
                    info!(
                        sessions = report.sessions_collected,
                        mediations = report.mediations_expired,
                        resent = report.resent,
                        "maintenance sweep"
                    );
                }
            }
        }
    }
}

/// One pass of maintenance as of `now`.
pub async fn sweep(state: &DaemonState, now: u64) -> anyhow::Result<SweepReport> {
    let kx = &state.config.kx;
    let report = SweepReport {
        sessions_collected: absorb(state.kx.gc_expired(now, kx.session_ttl_secs).await)?,
        mediations_expired: absorb(
            state
                .kx
                .expire_mediations(now, kx.mediation_ttl_secs)
                .await
                .map(|expired| expired.len()),
        )?,
        resent: absorb(state.kx.resend_pending().await)?,
    };
    if report.sessions_collected > 0 {
        state.rv_changed.notify_one();
    }
    Ok(report)
}

/// Fatal errors stop the daemon; anything else is logged and counted as zero.
fn absorb(result: Result<usize, KxError>) -> anyhow::Result<usize> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!(error = %e, "maintenance step failed");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use rvmesh_kx::InviteMode;
    use rvmesh_transport::{MemoryRelay, SimLedger};
    use rvmesh_types::kx::KxStage;

    #[tokio::test]
    async fn test_sweep_collects_stale_invites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let relay = Arc::new(MemoryRelay::new());
        let state = testutil::state(&relay, &SimLedger::new(), "alice", dir.path());

        let invite = state.kx.create_invite(InviteMode::Open).await.expect("invite");
        let fresh = sweep(&state, unix_now()).await.expect("sweep");
        assert_eq!(fresh.sessions_collected, 0);
        assert_eq!(
            state.kx.session_stage(&invite.initial_rv).await.expect("stage"),
            KxStage::AwaitingAccept
        );

        let later = unix_now() + state.config.kx.session_ttl_secs + 1;
        let report = sweep(&state, later).await.expect("sweep");
        assert_eq!(report.sessions_collected, 1);
        assert_eq!(
            state.kx.session_stage(&invite.initial_rv).await.expect("stage"),
            KxStage::Unknown
        );
    }
}
