//! Payment network seam and an in-process simulated ledger.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, info};

use rvmesh_types::payment::Invoice;
use rvmesh_types::{unix_now, UserId};

use crate::{Result, TransportError};

/// Default lifetime of a simulated invoice.
pub const DEFAULT_INVOICE_TTL: Duration = Duration::from_secs(3600);

pub trait PaymentNetwork: Send + Sync + 'static {
    /// Obtain an invoice payable to `payee` for `amount_milli_atoms`.
    fn request_invoice(
        &self,
        payee: UserId,
        amount_milli_atoms: u64,
    ) -> impl Future<Output = Result<Invoice>> + Send;

    /// Create an invoice payable to the local node.
    fn create_invoice(
        &self,
        amount_milli_atoms: u64,
        memo: String,
    ) -> impl Future<Output = Result<Invoice>> + Send;

    /// Pay an invoice. An `Err` is a definitive failure.
    fn pay(&self, invoice: &Invoice) -> impl Future<Output = Result<()>> + Send;

    /// Whether a route to `payee` with enough capacity currently exists.
    fn can_route(&self, payee: UserId, amount_milli_atoms: u64) -> impl Future<Output = bool> + Send;

    /// Whether the payee will no longer settle `invoice`.
    fn invoice_expired(&self, invoice: &Invoice) -> impl Future<Output = bool> + Send;

    /// Whether an invoice issued by the local node has been paid.
    fn invoice_settled(&self, invoice: &Invoice) -> impl Future<Output = bool> + Send;

    /// Whether the local wallet is usable (synced, channels open).
    fn wallet_ready(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Clone, Debug)]
struct InvoiceEntry {
    invoice: Invoice,
    settled: bool,
    expired: bool,
}

#[derive(Default)]
struct LedgerState {
    invoices: HashMap<String, InvoiceEntry>,
}

/// Shared ledger connecting every simulated node in a process.
#[derive(Clone, Default)]
pub struct SimLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl SimLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A payment-network handle for the node identified by `node_id`.
    pub fn node(&self, node_id: UserId) -> SimPaymentNetwork {
        SimPaymentNetwork {
            node_id,
            ledger: self.clone(),
            script: Arc::new(Mutex::new(Script {
                routable: true,
                wallet_ready: true,
                ..Script::default()
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn issue(&self, payee: UserId, amount_milli_atoms: u64, memo: &str) -> Invoice {
        let mut hash = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut hash);
        let payment_hash = hex::encode(hash);
        let invoice = Invoice {
            payee,
            payment_request: format!("lnsim1{}{}", &payment_hash[..16], memo.len()),
            payment_hash: payment_hash.clone(),
            amount_milli_atoms,
            expires_at: unix_now() + DEFAULT_INVOICE_TTL.as_secs(),
        };
        self.state().invoices.insert(
            payment_hash,
            InvoiceEntry {
                invoice: invoice.clone(),
                settled: false,
                expired: false,
            },
        );
        invoice
    }

    /// Force an invoice to be reported as expired.
    pub fn expire(&self, payment_hash: &str) {
        if let Some(entry) = self.state().invoices.get_mut(payment_hash) {
            entry.expired = true;
        }
    }

    pub fn is_settled(&self, payment_hash: &str) -> bool {
        self.state()
            .invoices
            .get(payment_hash)
            .map(|e| e.settled)
            .unwrap_or(false)
    }

    /// Number of invoices ever issued.
    pub fn issued(&self) -> usize {
        self.state().invoices.len()
    }
}

#[derive(Default)]
struct Script {
    routable: bool,
    wallet_ready: bool,
    failures: VecDeque<String>,
    pay_delay: Option<Duration>,
    pay_calls: u32,
    invoice_requests: u32,
}

/// One node's view of the simulated payment network, with scriptable
/// failures.
#[derive(Clone)]
pub struct SimPaymentNetwork {
    node_id: UserId,
    ledger: SimLedger,
    script: Arc<Mutex<Script>>,
}

impl SimPaymentNetwork {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ledger(&self) -> &SimLedger {
        &self.ledger
    }

    /// Make the next `n` payments fail with `reason`.
    pub fn fail_next_payments(&self, n: usize, reason: &str) {
        let mut script = self.script();
        for _ in 0..n {
            script.failures.push_back(reason.to_string());
        }
    }

    pub fn set_routable(&self, routable: bool) {
        self.script().routable = routable;
    }

    pub fn set_wallet_ready(&self, ready: bool) {
        self.script().wallet_ready = ready;
    }

    /// Delay every payment by `delay` before it resolves.
    pub fn set_pay_delay(&self, delay: Option<Duration>) {
        self.script().pay_delay = delay;
    }

    /// Number of `pay` calls made through this node.
    pub fn pay_calls(&self) -> u32 {
        self.script().pay_calls
    }

    /// Number of `request_invoice` calls made through this node.
    pub fn invoice_requests(&self) -> u32 {
        self.script().invoice_requests
    }
}

impl PaymentNetwork for SimPaymentNetwork {
    async fn request_invoice(&self, payee: UserId, amount_milli_atoms: u64) -> Result<Invoice> {
        self.script().invoice_requests += 1;
        let invoice = self.ledger.issue(payee, amount_milli_atoms, "requested");
        debug!(hash = %invoice.payment_hash, amount_milli_atoms, "sim invoice requested");
        Ok(invoice)
    }

    async fn create_invoice(&self, amount_milli_atoms: u64, memo: String) -> Result<Invoice> {
        Ok(self.ledger.issue(self.node_id, amount_milli_atoms, &memo))
    }

    async fn pay(&self, invoice: &Invoice) -> Result<()> {
        let (delay, failure) = {
            let mut script = self.script();
            script.pay_calls += 1;
            (script.pay_delay, script.failures.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(TransportError::PaymentFailed(reason));
        }

        let mut state = self.ledger.state();
        let entry = state
            .invoices
            .get_mut(&invoice.payment_hash)
            .ok_or_else(|| TransportError::PaymentFailed("unknown invoice".to_string()))?;
        if entry.expired || entry.invoice.expires_at < unix_now() {
            return Err(TransportError::PaymentFailed("invoice expired".to_string()));
        }
        entry.settled = true;
        info!(hash = %invoice.payment_hash, amount = invoice.amount_milli_atoms, "sim payment settled");
        Ok(())
    }

    async fn can_route(&self, _payee: UserId, _amount_milli_atoms: u64) -> bool {
        self.script().routable
    }

    async fn invoice_expired(&self, invoice: &Invoice) -> bool {
        let state = self.ledger.state();
        match state.invoices.get(&invoice.payment_hash) {
            Some(entry) => entry.expired || entry.invoice.expires_at < unix_now(),
            None => true,
        }
    }

    async fn invoice_settled(&self, invoice: &Invoice) -> bool {
        invoice.payee == self.node_id && self.ledger.is_settled(&invoice.payment_hash)
    }

    async fn wallet_ready(&self) -> bool {
        self.script().wallet_ready
    }
}
