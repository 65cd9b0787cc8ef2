//! Attempt policy over a [`PaymentNetwork`].

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rvmesh_db::queries::payments;
use rvmesh_db::KeyedLocks;
use rvmesh_transport::PaymentNetwork;
use rvmesh_types::events::{ClientEvent, EventBus};
use rvmesh_types::payment::{Invoice, SubjectTag};
use rvmesh_types::{short_hex, unix_now, UserId};

use crate::attempt::PaymentAttempt;
use crate::{PaymentError, Result};

/// Where the invoice for an attempt comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvoiceSource {
    /// Request a fresh invoice payable to this user when needed.
    Payee(UserId),
    /// Only pay invoices registered with [`PaymentPolicy::register_invoice`].
    Offered,
}

/// Runs payment attempts, one subject at a time.
pub struct PaymentPolicy<P> {
    db: Arc<Mutex<Connection>>,
    network: Arc<P>,
    events: EventBus,
    locks: KeyedLocks<SubjectTag>,
    max_attempts: u32,
}

impl<P: PaymentNetwork> PaymentPolicy<P> {
    pub fn new(db: Arc<Mutex<Connection>>, network: Arc<P>, events: EventBus, max_attempts: u32) -> Self {
        Self {
            db,
            network,
            events,
            locks: KeyedLocks::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn network(&self) -> &Arc<P> {
        &self.network
    }

    pub async fn status(&self, subject: &SubjectTag) -> Result<Option<PaymentAttempt>> {
        let conn = self.db.lock().await;
        Ok(payments::get(&conn, subject.as_str())?)
    }

    /// Create the record for `subject` with its own attempt limit.
    ///
    /// An existing record keeps the limit it was created with.
    pub async fn prepare(
        &self,
        subject: &SubjectTag,
        amount_milli_atoms: u64,
        max_attempts: u32,
    ) -> Result<PaymentAttempt> {
        let _guard = self.locks.lock(subject).await;
        if let Some(existing) = self.status(subject).await? {
            return Ok(existing);
        }
        let record = PaymentAttempt::new(subject.clone(), amount_milli_atoms, max_attempts.max(1), unix_now());
        self.store(&record).await?;
        Ok(record)
    }

    /// Record an invoice the payee offered for `subject`.
    ///
    /// A completed subject ignores new invoices.
    pub async fn register_invoice(
        &self,
        subject: &SubjectTag,
        amount_milli_atoms: u64,
        invoice: Invoice,
    ) -> Result<PaymentAttempt> {
        if invoice.amount_milli_atoms != amount_milli_atoms {
            return Err(PaymentError::AmountMismatch {
                expected: amount_milli_atoms,
                got: invoice.amount_milli_atoms,
            });
        }
        let _guard = self.locks.lock(subject).await;
        let now = unix_now();
        let mut record = self.load_or_new(subject, amount_milli_atoms, now).await?;
        if record.is_completed() {
            debug!(subject = %subject, "invoice offered for completed subject; ignored");
            return Ok(record);
        }
        record.adopt_invoice(invoice, now);
        self.store(&record).await?;
        Ok(record)
    }

    /// Pay for `subject`.
    ///
    /// A completed subject returns its record without touching the
    /// network. Cancellation during a network wait leaves the record in
    /// its last persisted state; a payment interrupted after submission
    /// is retried against the same invoice.
    pub async fn attempt(
        &self,
        subject: &SubjectTag,
        amount_milli_atoms: u64,
        source: InvoiceSource,
        cancel: &CancellationToken,
    ) -> Result<PaymentAttempt> {
        let _guard = self.locks.lock(subject).await;
        let now = unix_now();
        let mut record = self.load_or_new(subject, amount_milli_atoms, now).await?;

        if record.is_completed() {
            debug!(subject = %subject, "already paid");
            return Ok(record);
        }
        if record.is_exhausted() {
            return Err(PaymentError::RetriesExhausted {
                subject: subject.to_string(),
                last_error: record.last_error.clone(),
            });
        }

        let payee = match (source, &record.current_invoice) {
            (InvoiceSource::Payee(payee), _) => payee,
            (InvoiceSource::Offered, Some(invoice)) => invoice.payee,
            (InvoiceSource::Offered, None) => {
                return Err(PaymentError::InvoiceExpired(subject.to_string()))
            }
        };

        let routable = tokio::select! {
            r = self.network.can_route(payee, amount_milli_atoms) => r,
            _ = cancel.cancelled() => return Err(PaymentError::Cancelled),
        };
        if !routable {
            warn!(subject = %subject, payee = %short_hex(&payee), "no route for payment");
            self.events.emit(ClientEvent::PaymentCapabilityUnavailable {
                subject: subject.to_string(),
            });
            return Err(PaymentError::CapabilityUnavailable(subject.to_string()));
        }

        let reusable = match &record.current_invoice {
            Some(invoice) => tokio::select! {
                expired = self.network.invoice_expired(invoice) => !expired,
                _ = cancel.cancelled() => return Err(PaymentError::Cancelled),
            },
            None => false,
        };
        if !reusable {
            let InvoiceSource::Payee(payee) = source else {
                return Err(PaymentError::InvoiceExpired(subject.to_string()));
            };
            let invoice = tokio::select! {
                r = self.network.request_invoice(payee, amount_milli_atoms) => r?,
                _ = cancel.cancelled() => return Err(PaymentError::Cancelled),
            };
            debug!(subject = %subject, hash = %invoice.payment_hash, "new invoice");
            record.adopt_invoice(invoice, unix_now());
            self.store(&record).await?;
        }
        let Some(invoice) = record.current_invoice.clone() else {
            return Err(PaymentError::InvoiceExpired(subject.to_string()));
        };

        record.mark_attempted(unix_now());
        self.store(&record).await?;

        let outcome = tokio::select! {
            r = self.network.pay(&invoice) => r,
            _ = cancel.cancelled() => {
                warn!(subject = %subject, hash = %invoice.payment_hash, "payment wait cancelled; will resume on the same invoice");
                return Err(PaymentError::Cancelled);
            }
        };

        match outcome {
            Ok(()) => {
                record.mark_completed(unix_now());
                self.store(&record).await?;
                info!(
                    subject = %subject,
                    amount = amount_milli_atoms,
                    attempts = record.attempts,
                    "payment completed"
                );
                Ok(record)
            }
            Err(e) => {
                let reason = e.to_string();
                record.mark_failed(reason.clone(), unix_now());
                self.store(&record).await?;
                if record.is_exhausted() {
                    warn!(subject = %subject, attempts = record.attempts, error = %reason, "payment attempts exhausted");
                    self.events.emit(ClientEvent::PaymentExhausted {
                        subject: subject.to_string(),
                        last_error: Some(reason.clone()),
                    });
                    Err(PaymentError::RetriesExhausted {
                        subject: subject.to_string(),
                        last_error: Some(reason),
                    })
                } else {
                    warn!(subject = %subject, attempts = record.attempts, error = %reason, "payment failed");
                    Err(PaymentError::PaymentFailed(reason))
                }
            }
        }
    }

    /// Begin a new attempt cycle for an exhausted or failed subject.
    pub async fn reset_for_retry(&self, subject: &SubjectTag) -> Result<PaymentAttempt> {
        let _guard = self.locks.lock(subject).await;
        let mut record = self
            .status(subject)
            .await?
            .ok_or_else(|| PaymentError::NotFound(subject.to_string()))?;
        if record.is_completed() {
            return Ok(record);
        }
        record.reset_cycle();
        self.store(&record).await?;
        info!(subject = %subject, "payment retry cycle started");
        Ok(record)
    }

    /// Attempts that were submitted but never resolved, e.g. across a
    /// restart.
    pub async fn in_flight(&self) -> Result<Vec<PaymentAttempt>> {
        let conn = self.db.lock().await;
        let records: Vec<PaymentAttempt> = payments::list_incomplete(&conn)?;
        Ok(records
            .into_iter()
            .filter(|r| r.payment_attempted_at.is_some() && r.payment_failed_at.is_none())
            .collect())
    }

    async fn load_or_new(&self, subject: &SubjectTag, amount: u64, now: u64) -> Result<PaymentAttempt> {
        let conn = self.db.lock().await;
        Ok(payments::get(&conn, subject.as_str())?
            .unwrap_or_else(|| PaymentAttempt::new(subject.clone(), amount, self.max_attempts, now)))
    }

    async fn store(&self, record: &PaymentAttempt) -> Result<()> {
        let conn = self.db.lock().await;
        payments::upsert(
            &conn,
            record.subject.as_str(),
            record,
            record.completed_at,
            unix_now(),
        )?;
        Ok(())
    }
}
