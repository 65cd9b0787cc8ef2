//! Tips: unsolicited payments to a peer, announced with a `TipNotice`.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rvmesh_transport::{PaymentNetwork, PeerMessenger};
use rvmesh_types::events::{ClientEvent, EventBus};
use rvmesh_types::payment::SubjectTag;
use rvmesh_types::wire::PeerMsg;
use rvmesh_types::{short_hex, UserId};

use crate::attempt::PaymentAttempt;
use crate::policy::{InvoiceSource, PaymentPolicy};
use crate::Result;

/// Pay `peer` a tip of `amount_milli_atoms`.
///
/// `tag` distinguishes separate tips to the same peer; repeating a call with
/// the same tag after success does not pay again. The notice is sent only
/// once the payment completes.
pub async fn tip_user<P: PaymentNetwork, M: PeerMessenger>(
    policy: &PaymentPolicy<P>,
    messenger: &M,
    peer: &UserId,
    amount_milli_atoms: u64,
    tag: u32,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> Result<PaymentAttempt> {
    let subject = SubjectTag::tip(peer, tag);
    let before = policy.prepare(&subject, amount_milli_atoms, max_attempts).await?;
    if before.is_completed() {
        return Ok(before);
    }

    let record = policy
        .attempt(&subject, amount_milli_atoms, InvoiceSource::Payee(*peer), cancel)
        .await?;
    info!(peer = %short_hex(peer), amount = amount_milli_atoms, tag, "tip paid");

    if let Err(e) = messenger
        .send(
            peer,
            PeerMsg::TipNotice {
                amount_milli_atoms,
                tag,
            },
        )
        .await
    {
        warn!(peer = %short_hex(peer), error = %e, "tip paid but notice not sent");
    }
    Ok(record)
}

/// Surface a tip notice from `from`.
pub fn tip_received(events: &EventBus, from: &UserId, amount_milli_atoms: u64, tag: u32) {
    info!(peer = %short_hex(from), amount = amount_milli_atoms, tag, "tip received");
    events.emit(ClientEvent::TipReceived {
        peer: hex::encode(from),
        amount_milli_atoms,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;
    use crate::PaymentError;
    use rvmesh_transport::{MemoryMessenger, SimLedger, SimPaymentNetwork};

    const PEER: UserId = [7u8; 32];

    fn setup() -> (PaymentPolicy<SimPaymentNetwork>, SimPaymentNetwork, MemoryMessenger) {
        let ledger = SimLedger::new();
        let net = ledger.node([1u8; 32]);
        let conn = rvmesh_db::open_memory().expect("open db");
        let policy = PaymentPolicy::new(
            Arc::new(Mutex::new(conn)),
            Arc::new(net.clone()),
            EventBus::new(16),
            crate::DEFAULT_MAX_ATTEMPTS,
        );
        (policy, net, MemoryMessenger::new())
    }

    #[tokio::test]
    async fn test_tip_sends_notice_once() {
        let (policy, net, messenger) = setup();
        let cancel = CancellationToken::new();

        let record = tip_user(&policy, &messenger, &PEER, 500, 1, 2, &cancel)
            .await
            .expect("tip");
        assert!(record.is_completed());
        assert_eq!(record.max_attempts, 2);

        let sent = messenger.take();
        assert_eq!(
            sent,
            vec![(
                PEER,
                PeerMsg::TipNotice {
                    amount_milli_atoms: 500,
                    tag: 1
                }
            )]
        );

        tip_user(&policy, &messenger, &PEER, 500, 1, 2, &cancel)
            .await
            .expect("repeat");
        assert_eq!(net.pay_calls(), 1);
        assert!(messenger.take().is_empty());
    }

    #[tokio::test]
    async fn test_tip_limit_and_no_notice_on_failure() {
        let (policy, net, messenger) = setup();
        let cancel = CancellationToken::new();
        net.fail_next_payments(5, "no liquidity");

        assert!(matches!(
            tip_user(&policy, &messenger, &PEER, 10, 9, 1, &cancel).await,
            Err(PaymentError::RetriesExhausted { .. })
        ));
        assert_eq!(net.pay_calls(), 1);
        assert!(messenger.take().is_empty());
    }

    #[test]
    fn test_tip_received_event() {
        let events = EventBus::new(4);
        let mut rx = events.subscribe();
        tip_received(&events, &PEER, 42, 0);
        let env = rx.try_recv().expect("event");
        assert_eq!(
            env.event,
            ClientEvent::TipReceived {
                peer: hex::encode(PEER),
                amount_milli_atoms: 42
            }
        );
    }
}
