//! The persisted payment attempt record.

use serde::{Deserialize, Serialize};

use rvmesh_types::payment::{Invoice, SubjectTag};

/// Coarse status reported to the presentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// No payment submitted yet in this cycle.
    Pending,
    /// A payment was submitted and has not resolved.
    InFlight,
    /// The last payment failed; attempts remain.
    Failed,
    Exhausted,
    Completed,
}

/// Everything known about paying for one subject.
///
/// Timestamps fill in the order invoice requested, payment attempted,
/// payment failed or completed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub subject: SubjectTag,
    pub amount_milli_atoms: u64,
    pub created_at: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub invoice_requested_at: Option<u64>,
    pub payment_attempted_at: Option<u64>,
    pub payment_failed_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub current_invoice: Option<Invoice>,
    /// Every invoice ever issued for this subject, oldest first.
    #[serde(default)]
    pub prior_invoices: Vec<Invoice>,
    pub last_error: Option<String>,
}

impl PaymentAttempt {
    pub fn new(subject: SubjectTag, amount_milli_atoms: u64, max_attempts: u32, now: u64) -> Self {
        Self {
            subject,
            amount_milli_atoms,
            created_at: now,
            attempts: 0,
            max_attempts,
            invoice_requested_at: None,
            payment_attempted_at: None,
            payment_failed_at: None,
            completed_at: None,
            current_invoice: None,
            prior_invoices: Vec::new(),
            last_error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        !self.is_completed() && self.attempts >= self.max_attempts
    }

    pub fn status(&self) -> AttemptStatus {
        if self.is_completed() {
            AttemptStatus::Completed
        } else if self.is_exhausted() {
            AttemptStatus::Exhausted
        } else if self.payment_failed_at.is_some() {
            AttemptStatus::Failed
        } else if self.payment_attempted_at.is_some() {
            AttemptStatus::InFlight
        } else {
            AttemptStatus::Pending
        }
    }

    /// Make `invoice` the current one, keeping the full history.
    pub fn adopt_invoice(&mut self, invoice: Invoice, now: u64) {
        if self
            .prior_invoices
            .iter()
            .all(|i| i.payment_hash != invoice.payment_hash)
        {
            self.prior_invoices.push(invoice.clone());
        }
        self.current_invoice = Some(invoice);
        self.invoice_requested_at = Some(now);
    }

    pub(crate) fn mark_attempted(&mut self, now: u64) {
        self.attempts += 1;
        self.payment_attempted_at = Some(now);
        self.payment_failed_at = None;
    }

    pub(crate) fn mark_failed(&mut self, error: String, now: u64) {
        self.payment_failed_at = Some(now);
        self.last_error = Some(error);
    }

    pub(crate) fn mark_completed(&mut self, now: u64) {
        self.completed_at = Some(now);
        self.payment_failed_at = None;
        self.last_error = None;
    }

    /// Start a new attempt cycle. Invoice history is kept.
    pub(crate) fn reset_cycle(&mut self) {
        self.attempts = 0;
        self.payment_attempted_at = None;
        self.payment_failed_at = None;
        self.last_error = None;
    }
}
