//! Billing service: invoices, payments, refunds and the payment gateway.
//!
//! A payment's effect on its invoice is written in the same transaction that
//! moves the payment to `paid`, guarded by a conditional update on the
//! payment row, so it lands exactly once no matter how many times capture is
//! reported (verify call, webhook, retries).

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::clock::Clock;
use crate::collaborators::{MembershipLookup, PaymentGateway};
use crate::config::Settings;
use crate::db::{self, Database};
use crate::error::ClinicError;
use crate::invoice::{self, InvoiceHeaderUpdate, ItemInput};
use crate::models::{
    GatewayRefs, Invoice, InvoiceDiscount, Payment, PaymentMode, PaymentStatus, Refund,
};
use crate::payment::{self, WebhookAction, WebhookEvent};
use crate::sequence::{self, SequenceScope};

/// Input for a new invoice.
#[derive(Debug, Clone, Default)]
pub struct NewInvoice {
    pub patient_id: String,
    pub clinic_id: String,
    pub appointment_id: Option<Uuid>,
    pub items: Vec<ItemInput>,
    pub discount: Option<InvoiceDiscount>,
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub created_by: String,
}

/// Input for an offline payment or a gateway order.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub patient_id: String,
    pub clinic_id: String,
    pub invoice_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub amount: Decimal,
    pub payment_mode: PaymentMode,
    pub notes: Option<String>,
    pub created_by: String,
}

impl PaymentRequest {
    pub fn for_invoice(invoice: &Invoice, amount: Decimal, mode: PaymentMode) -> Self {
        PaymentRequest {
            patient_id: invoice.patient_id.clone(),
            clinic_id: invoice.clinic_id.clone(),
            invoice_id: Some(invoice.id),
            appointment_id: invoice.appointment_id,
            amount,
            payment_mode: mode,
            notes: None,
            created_by: "system".to_string(),
        }
    }

    pub fn by(mut self, actor: &str) -> Self {
        self.created_by = actor.to_string();
        self
    }
}

/// A payment together with the invoice it affected, if any.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub invoice: Option<Invoice>,
}

#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Applied(Payment),
    /// Already processed; acknowledged without effect.
    Duplicate(Payment),
    Ignored,
}

enum Verification {
    Settled(PaymentReceipt),
    Unapplied(Payment),
    Rejected,
}

/// Result of reporting a gateway capture for a pending payment.
enum Capture {
    Applied(PaymentReceipt),
    /// Another report moved the payment first.
    AlreadySettled,
    /// The target could no longer take the money. The payment is failed
    /// with a reason and its gateway refs kept for a refund at the gateway.
    Unapplied(Payment),
}

pub struct BillingService {
    db: Arc<Database>,
    memberships: Arc<dyn MembershipLookup>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    currency: String,
    invoice_due_days: u32,
    webhook_secret: String,
}

impl BillingService {
    pub fn new(
        db: Arc<Database>,
        memberships: Arc<dyn MembershipLookup>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        BillingService {
            db,
            memberships,
            gateway,
            clock,
            currency: settings.currency.clone(),
            invoice_due_days: settings.invoice_due_days,
            webhook_secret: settings.webhook_secret.clone(),
        }
    }

    // ─── Invoices ────────────────────────────────────────────────────────────

    pub fn create_invoice(&self, input: NewInvoice) -> Result<Invoice, ClinicError> {
        if input.patient_id.trim().is_empty() || input.clinic_id.trim().is_empty() {
            return Err(ClinicError::InvalidInput(
                "Invoice needs a patient and a clinic".to_string(),
            ));
        }
        let membership_percent = self.memberships.current_discount_percent(&input.patient_id);
        let items = input
            .items
            .into_iter()
            .map(|item| invoice::build_item(item, membership_percent))
            .collect::<Result<Vec<_>, _>>()?;
        let now = self.clock.now();
        let today = self.clock.today();

        let invoice = self.db.write(|tx| {
            if let Some(appointment_id) = &input.appointment_id {
                db::require_appointment(tx, appointment_id)?;
            }
            let number = sequence::next_number(tx, &SequenceScope::Invoice { month: today })?;
            let mut draft = invoice::new_draft(
                number,
                input.patient_id.trim(),
                input.clinic_id.trim(),
                input.appointment_id,
                &input.created_by,
                now,
            );
            for item in items {
                invoice::add_item(&mut draft, item)?;
            }
            invoice::update_header(
                &mut draft,
                InvoiceHeaderUpdate {
                    notes: input.notes.clone(),
                    due_date: input.due_date,
                    discount: input.discount.clone(),
                },
            )?;
            db::insert_invoice(tx, &draft)?;
            Ok::<_, ClinicError>(draft)
        })?;

        tracing::info!(
            invoice = %invoice.invoice_number,
            patient_id = %invoice.patient_id,
            grand_total = %invoice.grand_total,
            "invoice created"
        );
        Ok(invoice)
    }

    /// Load an invoice, apply `op`, persist. Runs in one transaction.
    fn modify_invoice<F>(&self, id: &Uuid, op: F) -> Result<Invoice, ClinicError>
    where
        F: FnOnce(&mut Invoice, DateTime<Utc>) -> Result<(), ClinicError>,
    {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut invoice = db::require_invoice(tx, id)?;
            op(&mut invoice, now)?;
            invoice.updated_at = now;
            db::update_invoice(tx, &invoice)?;
            Ok(invoice)
        })
    }

    pub fn update_invoice(
        &self,
        id: &Uuid,
        update: InvoiceHeaderUpdate,
    ) -> Result<Invoice, ClinicError> {
        self.modify_invoice(id, |invoice, _| invoice::update_header(invoice, update))
    }

    pub fn add_item(&self, id: &Uuid, item: ItemInput) -> Result<Invoice, ClinicError> {
        let patient_id = self.get_invoice(id)?.patient_id;
        let membership_percent = self.memberships.current_discount_percent(&patient_id);
        let item = invoice::build_item(item, membership_percent)?;
        self.modify_invoice(id, |invoice, _| invoice::add_item(invoice, item))
    }

    pub fn remove_item(&self, id: &Uuid, item_id: &Uuid) -> Result<Invoice, ClinicError> {
        self.modify_invoice(id, |invoice, _| {
            invoice::remove_item(invoice, item_id).map(|_| ())
        })
    }

    pub fn issue_invoice(&self, id: &Uuid) -> Result<Invoice, ClinicError> {
        let today = self.clock.today();
        let due_days = self.invoice_due_days;
        let invoice = self.modify_invoice(id, |invoice, now| {
            invoice::issue(invoice, now, today, due_days)
        })?;
        tracing::info!(
            invoice = %invoice.invoice_number,
            due_date = ?invoice.due_date,
            "invoice issued"
        );
        Ok(invoice)
    }

    /// Cancel an invoice. Any recorded payment must be refunded first.
    pub fn cancel_invoice(&self, id: &Uuid, reason: &str) -> Result<Invoice, ClinicError> {
        let invoice = self.modify_invoice(id, |invoice, now| {
            if invoice.amount_paid > Decimal::ZERO {
                return Err(ClinicError::InvalidOperation(format!(
                    "Invoice {} has {} paid; refund before cancelling",
                    invoice.invoice_number, invoice.amount_paid
                )));
            }
            invoice::cancel(invoice, reason, now)
        })?;
        tracing::info!(invoice = %invoice.invoice_number, "invoice cancelled");
        Ok(invoice)
    }

    pub fn get_invoice(&self, id: &Uuid) -> Result<Invoice, ClinicError> {
        self.db
            .read(|conn| db::require_invoice(conn, id).map_err(ClinicError::from))
    }

    pub fn invoices_for_patient(&self, patient_id: &str) -> Result<Vec<Invoice>, ClinicError> {
        self.db.read(|conn| {
            db::list_invoices_for_patient(conn, patient_id).map_err(ClinicError::from)
        })
    }

    /// Flip issued invoices whose due date is before `today` to overdue.
    pub fn sweep_overdue(&self, today: NaiveDate) -> Result<usize, ClinicError> {
        let now = self.clock.now();
        let changed = self
            .db
            .write(|tx| db::mark_overdue(tx, today, now).map_err(ClinicError::from))?;
        if changed > 0 {
            tracing::info!(changed, %today, "invoices marked overdue");
        }
        Ok(changed)
    }

    // ─── Payments ────────────────────────────────────────────────────────────

    fn new_payment(
        &self,
        conn: &Connection,
        request: &PaymentRequest,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Payment, ClinicError> {
        let month = self.clock.today();
        let payment_number = sequence::next_number(conn, &SequenceScope::Payment { month })?;
        Ok(Payment {
            id: Uuid::new_v4(),
            payment_number,
            patient_id: request.patient_id.clone(),
            clinic_id: request.clinic_id.clone(),
            invoice_id: request.invoice_id,
            appointment_id: request.appointment_id,
            amount: request.amount,
            payment_mode: request.payment_mode,
            status,
            gateway: None,
            failure_reason: None,
            refund: None,
            paid_at: (status == PaymentStatus::Paid).then_some(now),
            notes: request.notes.clone(),
            created_by: request.created_by.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    fn validate_request(&self, request: &PaymentRequest) -> Result<(), ClinicError> {
        if request.amount <= Decimal::ZERO {
            return Err(ClinicError::InvalidInput(
                "Payment amount must be positive".to_string(),
            ));
        }
        if request.patient_id.trim().is_empty() || request.clinic_id.trim().is_empty() {
            return Err(ClinicError::InvalidInput(
                "Payment needs a patient and a clinic".to_string(),
            ));
        }
        Ok(())
    }

    /// Check the targets of a payment exist and can take `amount` now.
    /// Without an invoice the payment is for the appointment's OPD fee.
    fn check_targets(
        conn: &Connection,
        invoice_id: Option<&Uuid>,
        appointment_id: Option<&Uuid>,
        amount: Decimal,
    ) -> Result<(), ClinicError> {
        match (invoice_id, appointment_id) {
            (Some(invoice_id), appointment_id) => {
                let invoice = db::require_invoice(conn, invoice_id)?;
                payment::ensure_payable(&invoice, amount)?;
                if let Some(appointment_id) = appointment_id {
                    db::require_appointment(conn, appointment_id)?;
                }
            }
            (None, Some(appointment_id)) => {
                let appointment = db::require_appointment(conn, appointment_id)?;
                payment::ensure_opd_payable(&appointment, amount)?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn check_request_targets(conn: &Connection, request: &PaymentRequest) -> Result<(), ClinicError> {
        Self::check_targets(
            conn,
            request.invoice_id.as_ref(),
            request.appointment_id.as_ref(),
            request.amount,
        )
    }

    /// Gateway orders still open against the same target hold their share of
    /// what is owed, so a new order only gets the remainder.
    fn check_open_orders(conn: &Connection, request: &PaymentRequest) -> Result<(), ClinicError> {
        let (owed, open) = match (&request.invoice_id, &request.appointment_id) {
            (Some(invoice_id), _) => {
                let invoice = db::require_invoice(conn, invoice_id)?;
                let payments = db::list_payments_for_invoice(conn, invoice_id)?;
                (invoice.balance_due, payment::pending_total(&payments))
            }
            (None, Some(appointment_id)) => {
                let appointment = db::require_appointment(conn, appointment_id)?;
                let payments = db::list_opd_payments(conn, appointment_id)?;
                (appointment.opd_fee, payment::pending_total(&payments))
            }
            (None, None) => return Ok(()),
        };
        let available = (owed - open).max(Decimal::ZERO);
        if request.amount > available {
            return Err(ClinicError::ExceedsBalance {
                requested: request.amount,
                available,
            });
        }
        Ok(())
    }

    /// Apply a payment that has just become paid to what it pays for.
    fn apply_to_targets(
        conn: &Connection,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, ClinicError> {
        match (&payment.invoice_id, &payment.appointment_id) {
            (Some(invoice_id), _) => {
                let mut invoice = db::require_invoice(conn, invoice_id)?;
                payment::apply_payment(&mut invoice, payment.amount)?;
                invoice.updated_at = now;
                db::update_invoice(conn, &invoice)?;
                Ok(Some(invoice))
            }
            (None, Some(appointment_id)) => {
                db::set_opd_fee_paid(conn, appointment_id, true, now)?;
                Ok(None)
            }
            (None, None) => Ok(None),
        }
    }

    /// Record an offline payment (cash, card, UPI...). It is paid on creation
    /// and applied to its invoice in the same transaction.
    pub fn record_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, ClinicError> {
        self.validate_request(request)?;
        if request.payment_mode.is_gateway() {
            return Err(ClinicError::InvalidInput(format!(
                "{} payments go through the gateway order flow",
                request.payment_mode
            )));
        }
        let now = self.clock.now();

        let receipt = self.db.write(|tx| {
            Self::check_request_targets(tx, request)?;
            let payment = self.new_payment(tx, request, PaymentStatus::Paid, now)?;
            db::insert_payment(tx, &payment)?;
            let invoice = Self::apply_to_targets(tx, &payment, now)?;
            Ok::<_, ClinicError>(PaymentReceipt { payment, invoice })
        })?;

        tracing::info!(
            payment = %receipt.payment.payment_number,
            amount = %receipt.payment.amount,
            mode = %receipt.payment.payment_mode,
            invoice = ?receipt.invoice.as_ref().map(|i| i.invoice_number.as_str()),
            "payment applied"
        );
        Ok(receipt)
    }

    /// Open a pending gateway payment correlated to a new gateway order.
    pub fn create_gateway_order(&self, request: &PaymentRequest) -> Result<Payment, ClinicError> {
        self.validate_request(request)?;
        let minor_units = payment::to_minor_units(request.amount)?;
        let now = self.clock.now();
        let request = PaymentRequest {
            payment_mode: PaymentMode::Razorpay,
            ..request.clone()
        };

        let payment = self.db.write(|tx| {
            Self::check_request_targets(tx, &request)?;
            Self::check_open_orders(tx, &request)?;
            let mut payment = self.new_payment(tx, &request, PaymentStatus::Pending, now)?;
            let order_id =
                self.gateway
                    .create_order(minor_units, &self.currency, &payment.payment_number)?;
            payment.gateway = Some(GatewayRefs {
                order_id,
                payment_id: None,
                signature: None,
            });
            db::insert_payment(tx, &payment)?;
            Ok::<_, ClinicError>(payment)
        })?;

        tracing::info!(
            payment = %payment.payment_number,
            order_id = ?payment.gateway.as_ref().map(|g| g.order_id.as_str()),
            "gateway order created"
        );
        Ok(payment)
    }

    /// Move a pending payment to paid and apply it, at most once.
    fn settle_pending(
        conn: &Connection,
        payment: &Payment,
        gateway_payment_id: Option<&str>,
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Capture, ClinicError> {
        if payment.status != PaymentStatus::Pending {
            return Ok(Capture::AlreadySettled);
        }
        let accepted = Self::check_targets(
            conn,
            payment.invoice_id.as_ref(),
            payment.appointment_id.as_ref(),
            payment.amount,
        );
        match accepted {
            Ok(()) => {}
            Err(
                err @ (ClinicError::InvalidInput(_)
                | ClinicError::InvalidOperation(_)
                | ClinicError::ExceedsBalance { .. }),
            ) => {
                let mut unapplied = payment.clone();
                if let Some(refs) = unapplied.gateway.as_mut() {
                    if let Some(id) = gateway_payment_id {
                        refs.payment_id = Some(id.to_string());
                    }
                    if let Some(signature) = signature {
                        refs.signature = Some(signature.to_string());
                    }
                }
                let reason = format!("Captured but not applied: {err}. Refund at the gateway");
                return Ok(Capture::Unapplied(Self::fail_pending(
                    conn, unapplied, &reason, now,
                )?));
            }
            Err(err) => return Err(err),
        }

        if !db::mark_paid_if_pending(conn, &payment.id, gateway_payment_id, signature, now)? {
            return Ok(Capture::AlreadySettled);
        }
        let stored = db::require_payment(conn, &payment.id)?;
        let invoice = Self::apply_to_targets(conn, &stored, now)?;
        Ok(Capture::Applied(PaymentReceipt {
            payment: stored,
            invoice,
        }))
    }

    fn receipt_for(conn: &Connection, payment: Payment) -> Result<PaymentReceipt, ClinicError> {
        let invoice = match &payment.invoice_id {
            Some(id) => Some(db::require_invoice(conn, id)?),
            None => None,
        };
        Ok(PaymentReceipt { payment, invoice })
    }

    fn fail_pending(
        conn: &Connection,
        mut payment: Payment,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Payment, ClinicError> {
        payment.status = PaymentStatus::Failed;
        payment.failure_reason = Some(reason.to_string());
        payment.updated_at = now;
        db::update_payment(conn, &payment)?;
        Ok(payment)
    }

    /// Verify the gateway's signature for a captured payment.
    ///
    /// On a match the payment becomes paid exactly as an offline one would.
    /// On a mismatch the pending payment is marked failed and the call
    /// returns `SignatureInvalid`.
    pub fn verify_gateway_payment(
        &self,
        order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> Result<PaymentReceipt, ClinicError> {
        let now = self.clock.now();
        let verified = self
            .gateway
            .verify_signature(order_id, gateway_payment_id, signature);

        let outcome = self.db.write(|tx| -> Result<Verification, ClinicError> {
            let payment = db::get_payment_by_order(tx, order_id)?
                .ok_or_else(|| ClinicError::NotFound(format!("Payment for order {order_id}")))?;

            if !verified {
                if payment.status == PaymentStatus::Pending {
                    Self::fail_pending(tx, payment, "Signature verification failed", now)?;
                }
                return Ok(Verification::Rejected);
            }
            match payment.status {
                PaymentStatus::Paid => Ok(Verification::Settled(Self::receipt_for(tx, payment)?)),
                PaymentStatus::Pending => {
                    let capture = Self::settle_pending(
                        tx,
                        &payment,
                        Some(gateway_payment_id),
                        Some(signature),
                        now,
                    )?;
                    match capture {
                        Capture::Applied(receipt) => Ok(Verification::Settled(receipt)),
                        Capture::AlreadySettled => Ok(Verification::Settled(Self::receipt_for(
                            tx,
                            db::require_payment(tx, &payment.id)?,
                        )?)),
                        Capture::Unapplied(payment) => Ok(Verification::Unapplied(payment)),
                    }
                }
                other => Err(ClinicError::InvalidOperation(format!(
                    "Payment {} is {other}",
                    payment.payment_number
                ))),
            }
        })?;

        match outcome {
            Verification::Settled(receipt) => {
                tracing::info!(
                    payment = %receipt.payment.payment_number,
                    order_id,
                    "gateway payment verified"
                );
                Ok(receipt)
            }
            Verification::Unapplied(payment) => {
                tracing::warn!(
                    payment = %payment.payment_number,
                    order_id,
                    gateway_payment_id,
                    "captured payment could not be applied"
                );
                Err(ClinicError::InvalidOperation(format!(
                    "Payment {}: {}",
                    payment.payment_number,
                    payment.failure_reason.unwrap_or_default()
                )))
            }
            Verification::Rejected => {
                tracing::warn!(order_id, gateway_payment_id, "gateway signature mismatch");
                Err(ClinicError::SignatureInvalid)
            }
        }
    }

    /// Process a gateway webhook delivery. `signature` is the hex HMAC of the
    /// raw body under the webhook secret.
    pub fn handle_webhook(&self, body: &str, signature: &str) -> Result<WebhookOutcome, ClinicError> {
        if !payment::verify_hmac(&self.webhook_secret, body, signature) {
            tracing::warn!("webhook signature mismatch");
            return Err(ClinicError::SignatureInvalid);
        }
        let event = WebhookEvent::parse(body)?;
        let action = event.action();
        if action == WebhookAction::Ignored {
            tracing::debug!(event = %event.event, "webhook event ignored");
            return Ok(WebhookOutcome::Ignored);
        }
        let now = self.clock.now();

        let outcome = self.db.write(|tx| -> Result<WebhookOutcome, ClinicError> {
            let payment = db::get_payment_by_order(tx, &event.order_id)?.ok_or_else(|| {
                ClinicError::NotFound(format!("Payment for order {}", event.order_id))
            })?;
            if payment.status != PaymentStatus::Pending {
                return Ok(WebhookOutcome::Duplicate(payment));
            }

            match &action {
                WebhookAction::Captured { payment_id } => {
                    match Self::settle_pending(tx, &payment, payment_id.as_deref(), None, now)? {
                        Capture::Applied(receipt) => Ok(WebhookOutcome::Applied(receipt.payment)),
                        Capture::AlreadySettled => Ok(WebhookOutcome::Duplicate(payment)),
                        Capture::Unapplied(failed) => Ok(WebhookOutcome::Applied(failed)),
                    }
                }
                WebhookAction::Failed { reason } => Ok(WebhookOutcome::Applied(
                    Self::fail_pending(tx, payment, reason, now)?,
                )),
                WebhookAction::Ignored => Ok(WebhookOutcome::Ignored),
            }
        })?;

        match &outcome {
            WebhookOutcome::Applied(payment) => tracing::info!(
                payment = %payment.payment_number,
                status = %payment.status,
                order_id = %event.order_id,
                "webhook applied"
            ),
            WebhookOutcome::Duplicate(payment) => tracing::warn!(
                payment = %payment.payment_number,
                order_id = %event.order_id,
                "duplicate webhook delivery"
            ),
            WebhookOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Abandon a pending gateway payment. Nothing is applied.
    pub fn cancel_payment(&self, id: &Uuid, reason: Option<&str>) -> Result<Payment, ClinicError> {
        let now = self.clock.now();
        let payment = self.db.write(|tx| {
            let mut payment = db::require_payment(tx, id)?;
            match payment.status {
                PaymentStatus::Pending => {}
                PaymentStatus::Cancelled => {
                    return Err(ClinicError::AlreadyCancelled(format!(
                        "Payment {} is already cancelled",
                        payment.payment_number
                    )))
                }
                other => {
                    return Err(ClinicError::InvalidOperation(format!(
                        "Payment {} is {other}; only pending payments can be cancelled",
                        payment.payment_number
                    )))
                }
            }
            payment.status = PaymentStatus::Cancelled;
            payment.failure_reason = reason.map(str::to_string);
            payment.updated_at = now;
            db::update_payment(tx, &payment)?;
            Ok(payment)
        })?;
        tracing::info!(payment = %payment.payment_number, "pending payment cancelled");
        Ok(payment)
    }

    /// Refund a paid payment, fully by default. The invoice's amount paid
    /// drops by the refunded amount; gateway payments are refunded at the
    /// gateway inside the same transaction.
    pub fn refund_payment(
        &self,
        id: &Uuid,
        amount: Option<Decimal>,
        reason: &str,
        actor: &str,
    ) -> Result<PaymentReceipt, ClinicError> {
        if reason.trim().is_empty() {
            return Err(ClinicError::InvalidInput(
                "Refund reason is required".to_string(),
            ));
        }
        let now = self.clock.now();
        let today = self.clock.today();

        let receipt = self.db.write(|tx| {
            let mut payment = db::require_payment(tx, id)?;
            let refund_amount = payment::refund_amount(&payment, amount)?;

            let invoice = match (&payment.invoice_id, &payment.appointment_id) {
                (Some(invoice_id), _) => {
                    let mut invoice = db::require_invoice(tx, invoice_id)?;
                    payment::reverse_payment(&mut invoice, refund_amount, today)?;
                    invoice.updated_at = now;
                    db::update_invoice(tx, &invoice)?;
                    Some(invoice)
                }
                (None, Some(appointment_id)) => {
                    let still_covered = db::list_opd_payments(tx, appointment_id)?
                        .iter()
                        .any(|p| p.id != payment.id && p.status == PaymentStatus::Paid);
                    db::set_opd_fee_paid(tx, appointment_id, still_covered, now)?;
                    None
                }
                (None, None) => None,
            };

            let gateway_payment_id = payment
                .gateway
                .as_ref()
                .and_then(|g| g.payment_id.clone());
            let refund_id = match (payment.payment_mode.is_gateway(), gateway_payment_id) {
                (true, Some(gateway_payment_id)) => Some(self.gateway.refund(
                    &gateway_payment_id,
                    payment::to_minor_units(refund_amount)?,
                )?),
                _ => None,
            };

            payment.status = PaymentStatus::Refunded;
            payment.refund = Some(Refund {
                amount: refund_amount,
                reason: reason.trim().to_string(),
                refund_id,
                refunded_by: actor.to_string(),
                refunded_at: now,
            });
            payment.updated_at = now;
            db::update_payment(tx, &payment)?;
            Ok::<_, ClinicError>(PaymentReceipt { payment, invoice })
        })?;

        tracing::info!(
            payment = %receipt.payment.payment_number,
            refunded = ?receipt.payment.refund.as_ref().map(|r| r.amount),
            actor,
            "payment refunded"
        );
        Ok(receipt)
    }

    pub fn get_payment(&self, id: &Uuid) -> Result<Payment, ClinicError> {
        self.db
            .read(|conn| db::require_payment(conn, id).map_err(ClinicError::from))
    }

    pub fn payments_for_invoice(&self, invoice_id: &Uuid) -> Result<Vec<Payment>, ClinicError> {
        self.db.read(|conn| {
            db::require_invoice(conn, invoice_id)?;
            db::list_payments_for_invoice(conn, invoice_id).map_err(ClinicError::from)
        })
    }

    // ─── Lab numbering ───────────────────────────────────────────────────────

    pub fn next_test_number(&self) -> Result<String, ClinicError> {
        let month = self.clock.today();
        self.db.write(|tx| {
            sequence::next_number(tx, &SequenceScope::Test { month }).map_err(ClinicError::from)
        })
    }

    pub fn next_report_number(&self) -> Result<String, ClinicError> {
        let month = self.clock.today();
        self.db.write(|tx| {
            sequence::next_number(tx, &SequenceScope::Report { month }).map_err(ClinicError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::WeeklyHours;
    use crate::clock::FixedClock;
    use crate::collaborators::{
        ClinicProfile, InMemoryClinicDirectory, InMemoryMemberships, MembershipPlan,
        SignedOrderGateway,
    };
    use crate::models::{InvoiceStatus, ItemType, SettlementStatus};
    use crate::scheduler::{AppointmentService, BookingRequest};
    use chrono::Weekday;
    use rust_decimal_macros::dec;

    const KEY_SECRET: &str = "rzp_test_secret";
    const WEBHOOK_SECRET: &str = "whsec_test";

    struct Fixture {
        billing: BillingService,
        appointments: AppointmentService,
        memberships: Arc<InMemoryMemberships>,
        gateway: Arc<SignedOrderGateway>,
        clock: Arc<FixedClock>,
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, 2).unwrap()
    }

    fn fixture() -> Fixture {
        let settings = Settings {
            gateway_key_secret: KEY_SECRET.to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            ..Settings::default()
        };
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clock = Arc::new(FixedClock::on(monday()));
        let memberships = Arc::new(InMemoryMemberships::new(clock.clone()));
        let gateway = Arc::new(SignedOrderGateway::new(KEY_SECRET));

        let clinics = InMemoryClinicDirectory::new();
        clinics
            .register(ClinicProfile {
                clinic_id: "c1".to_string(),
                code: "SD".to_string(),
                name: "Smile Dental".to_string(),
                hours: WeeklyHours::uniform(&[Weekday::Mon, Weekday::Tue], "09:00", "13:00")
                    .unwrap(),
                holidays: Vec::new(),
                slot_minutes: 30,
            })
            .unwrap();

        Fixture {
            billing: BillingService::new(
                db.clone(),
                memberships.clone(),
                gateway.clone(),
                clock.clone(),
                &settings,
            ),
            appointments: AppointmentService::new(db, Arc::new(clinics), clock.clone(), &settings),
            memberships,
            gateway,
            clock,
        }
    }

    fn root_canal(discount_percent: Decimal) -> NewInvoice {
        NewInvoice {
            patient_id: "P1".to_string(),
            clinic_id: "c1".to_string(),
            items: vec![ItemInput::new(ItemType::Treatment, "Root canal", 1, dec!(5000))
                .with_discount(discount_percent, Decimal::ZERO)],
            created_by: "billing-desk".to_string(),
            ..NewInvoice::default()
        }
    }

    fn issued(f: &Fixture, discount_percent: Decimal) -> Invoice {
        let invoice = f.billing.create_invoice(root_canal(discount_percent)).unwrap();
        f.billing.issue_invoice(&invoice.id).unwrap()
    }

    fn webhook(f: &Fixture, body: &str) -> Result<WebhookOutcome, ClinicError> {
        let signature = payment::hmac_hex(WEBHOOK_SECRET, body).unwrap();
        f.billing.handle_webhook(body, &signature)
    }

    #[test]
    fn create_invoice_numbers_and_prices() {
        let f = fixture();
        let first = f.billing.create_invoice(root_canal(dec!(10))).unwrap();
        let second = f.billing.create_invoice(root_canal(Decimal::ZERO)).unwrap();

        assert_eq!(first.invoice_number, "INV-2611-0001");
        assert_eq!(second.invoice_number, "INV-2611-0002");
        assert_eq!(first.status, InvoiceStatus::Draft);
        assert_eq!(first.grand_total, dec!(4500));
        assert_eq!(first.balance_due, dec!(4500));
        assert_eq!(f.billing.invoices_for_patient("P1").unwrap().len(), 2);
        assert!(f.billing.invoices_for_patient("P9").unwrap().is_empty());
    }

    #[test]
    fn membership_discount_applies_when_item_has_none() {
        let f = fixture();
        f.memberships.enroll(
            "P1",
            MembershipPlan {
                plan_code: "SILVER".to_string(),
                discount_percent: dec!(20),
                expires_on: NaiveDate::from_ymd_opt(2027, 1, 1).unwrap(),
            },
        );
        let input = NewInvoice {
            items: vec![ItemInput::new(ItemType::Consultation, "Consultation", 1, dec!(500))],
            ..root_canal(Decimal::ZERO)
        };
        let invoice = f.billing.create_invoice(input).unwrap();
        assert_eq!(invoice.grand_total, dec!(400));
    }

    #[test]
    fn full_cash_payment_settles_invoice() {
        let f = fixture();
        let invoice = issued(&f, dec!(10));
        assert_eq!(invoice.status, InvoiceStatus::Sent);

        let receipt = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(4500), PaymentMode::Cash))
            .unwrap();
        let paid = receipt.invoice.unwrap();
        assert_eq!(receipt.payment.payment_number, "PAY-2611-0001");
        assert_eq!(receipt.payment.status, PaymentStatus::Paid);
        assert!(receipt.payment.paid_at.is_some());
        assert_eq!(paid.amount_paid, dec!(4500));
        assert_eq!(paid.balance_due, Decimal::ZERO);
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.payment_status, SettlementStatus::Paid);

        let err = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&paid, dec!(1), PaymentMode::Cash))
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));
    }

    #[test]
    fn overpayment_and_draft_payment_are_rejected() {
        let f = fixture();
        let draft = f.billing.create_invoice(root_canal(Decimal::ZERO)).unwrap();
        let err = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&draft, dec!(100), PaymentMode::Cash))
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));

        let invoice = f.billing.issue_invoice(&draft.id).unwrap();
        let err = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(5001), PaymentMode::Card))
            .unwrap_err();
        assert!(matches!(err, ClinicError::ExceedsBalance { .. }));
        assert!(f.billing.payments_for_invoice(&invoice.id).unwrap().is_empty());
    }

    #[test]
    fn gateway_mode_is_refused_for_offline_recording() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let err = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(100), PaymentMode::Razorpay))
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidInput(_)));
    }

    #[test]
    fn partial_refund_reopens_balance() {
        let f = fixture();
        let invoice = f
            .billing
            .create_invoice(NewInvoice {
                items: vec![ItemInput::new(ItemType::Treatment, "Crown", 1, dec!(4900))],
                ..root_canal(Decimal::ZERO)
            })
            .unwrap();
        let invoice = f.billing.issue_invoice(&invoice.id).unwrap();
        let receipt = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(4900), PaymentMode::Upi))
            .unwrap();

        let err = f
            .billing
            .refund_payment(&receipt.payment.id, Some(dec!(2000)), "  ", "admin")
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidInput(_)));

        let refunded = f
            .billing
            .refund_payment(&receipt.payment.id, Some(dec!(2000)), "Crown re-do", "admin")
            .unwrap();
        let invoice = refunded.invoice.unwrap();
        assert_eq!(refunded.payment.status, PaymentStatus::Refunded);
        let refund = refunded.payment.refund.unwrap();
        assert_eq!(refund.amount, dec!(2000));
        assert_eq!(refund.refunded_by, "admin");
        assert!(refund.refund_id.is_none());
        assert_eq!(invoice.amount_paid, dec!(2900));
        assert_eq!(invoice.balance_due, dec!(2000));
        assert_eq!(invoice.status, InvoiceStatus::PartiallyPaid);
        assert_eq!(invoice.payment_status, SettlementStatus::Partial);

        let err = f
            .billing
            .refund_payment(&receipt.payment.id, None, "again", "admin")
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));
    }

    #[test]
    fn gateway_capture_is_applied_once() {
        let f = fixture();
        let invoice = issued(&f, dec!(10));
        let pending = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(4500), PaymentMode::Razorpay))
            .unwrap();
        assert_eq!(pending.status, PaymentStatus::Pending);
        assert_eq!(f.billing.get_invoice(&invoice.id).unwrap().amount_paid, Decimal::ZERO);

        let order_id = pending.gateway.as_ref().unwrap().order_id.clone();
        let signature = f.gateway.sign(&order_id, "pay_abc").unwrap();

        let receipt = f
            .billing
            .verify_gateway_payment(&order_id, "pay_abc", &signature)
            .unwrap();
        assert_eq!(receipt.payment.status, PaymentStatus::Paid);
        let refs = receipt.payment.gateway.clone().unwrap();
        assert_eq!(refs.payment_id.as_deref(), Some("pay_abc"));
        assert_eq!(refs.signature.as_deref(), Some(signature.as_str()));
        assert_eq!(receipt.invoice.unwrap().status, InvoiceStatus::Paid);

        let again = f
            .billing
            .verify_gateway_payment(&order_id, "pay_abc", &signature)
            .unwrap();
        assert_eq!(again.payment.id, pending.id);

        let body = format!(
            r#"{{"event":"payment.captured","order_id":"{order_id}","payment_id":"pay_abc"}}"#
        );
        assert!(matches!(webhook(&f, &body).unwrap(), WebhookOutcome::Duplicate(_)));

        let invoice = f.billing.get_invoice(&invoice.id).unwrap();
        assert_eq!(invoice.amount_paid, dec!(4500));
        assert_eq!(invoice.balance_due, Decimal::ZERO);
    }

    #[test]
    fn signature_mismatch_fails_the_payment() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let pending = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(1000), PaymentMode::Razorpay))
            .unwrap();
        let order_id = pending.gateway.unwrap().order_id;

        let err = f
            .billing
            .verify_gateway_payment(&order_id, "pay_abc", "deadbeef")
            .unwrap_err();
        assert!(matches!(err, ClinicError::SignatureInvalid));

        let stored = f.billing.get_payment(&pending.id).unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert!(stored.failure_reason.is_some());
        assert_eq!(f.billing.get_invoice(&invoice.id).unwrap().amount_paid, Decimal::ZERO);

        let signature = f.gateway.sign(&order_id, "pay_abc").unwrap();
        let err = f
            .billing
            .verify_gateway_payment(&order_id, "pay_abc", &signature)
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));
    }

    #[test]
    fn webhook_capture_and_failure() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let first = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(1000), PaymentMode::Razorpay))
            .unwrap();
        let second = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(1000), PaymentMode::Razorpay))
            .unwrap();
        let first_order = first.gateway.unwrap().order_id;
        let second_order = second.gateway.unwrap().order_id;

        let captured = format!(
            r#"{{"event":"payment.captured","order_id":"{first_order}","payment_id":"pay_1"}}"#
        );
        match webhook(&f, &captured).unwrap() {
            WebhookOutcome::Applied(payment) => assert_eq!(payment.status, PaymentStatus::Paid),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(webhook(&f, &captured).unwrap(), WebhookOutcome::Duplicate(_)));

        let failed = format!(
            r#"{{"event":"payment.failed","order_id":"{second_order}","error":"card declined"}}"#
        );
        match webhook(&f, &failed).unwrap() {
            WebhookOutcome::Applied(payment) => {
                assert_eq!(payment.status, PaymentStatus::Failed);
                assert_eq!(payment.failure_reason.as_deref(), Some("card declined"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let refund = r#"{"event":"refund.processed","order_id":"order_x"}"#;
        assert!(matches!(webhook(&f, refund).unwrap(), WebhookOutcome::Ignored));

        let err = f.billing.handle_webhook(&captured, "00ff").unwrap_err();
        assert!(matches!(err, ClinicError::SignatureInvalid));

        assert_eq!(f.billing.get_invoice(&invoice.id).unwrap().amount_paid, dec!(1000));
    }

    #[test]
    fn opd_fee_payment_marks_appointment() {
        let f = fixture();
        let appointment = f
            .appointments
            .book(&BookingRequest::new("P1", "c1", monday(), "09:00", "Checkup"))
            .unwrap();
        let request = PaymentRequest {
            patient_id: "P1".to_string(),
            clinic_id: "c1".to_string(),
            invoice_id: None,
            appointment_id: Some(appointment.id),
            amount: appointment.opd_fee,
            payment_mode: PaymentMode::Cash,
            notes: None,
            created_by: "reception".to_string(),
        };

        let receipt = f.billing.record_payment(&request).unwrap();
        assert!(receipt.invoice.is_none());
        assert!(f.appointments.get(&appointment.id).unwrap().opd_fee_paid);

        f.billing
            .refund_payment(&receipt.payment.id, None, "Visit cancelled", "admin")
            .unwrap();
        assert!(!f.appointments.get(&appointment.id).unwrap().opd_fee_paid);
    }

    #[test]
    fn cancel_invoice_requires_refund_first() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let receipt = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(1000), PaymentMode::Cash))
            .unwrap();

        let err = f.billing.cancel_invoice(&invoice.id, "Duplicate").unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));

        f.billing
            .refund_payment(&receipt.payment.id, None, "Duplicate invoice", "admin")
            .unwrap();
        let cancelled = f.billing.cancel_invoice(&invoice.id, "Duplicate").unwrap();
        assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        let err = f.billing.cancel_invoice(&invoice.id, "Duplicate").unwrap_err();
        assert!(matches!(err, ClinicError::AlreadyCancelled(_)));
    }

    #[test]
    fn sweep_marks_past_due_invoices() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let draft = f.billing.create_invoice(root_canal(Decimal::ZERO)).unwrap();
        assert_eq!(invoice.due_date, NaiveDate::from_ymd_opt(2026, 11, 17));

        assert_eq!(f.billing.sweep_overdue(monday()).unwrap(), 0);
        f.clock.set_date(NaiveDate::from_ymd_opt(2026, 11, 20).unwrap());
        assert_eq!(f.billing.sweep_overdue(f.clock.today()).unwrap(), 1);

        assert_eq!(
            f.billing.get_invoice(&invoice.id).unwrap().status,
            InvoiceStatus::Overdue
        );
        assert_eq!(f.billing.get_invoice(&draft.id).unwrap().status, InvoiceStatus::Draft);

        let overdue = f.billing.get_invoice(&invoice.id).unwrap();
        let receipt = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&overdue, dec!(1000), PaymentMode::Cash))
            .unwrap();
        assert_eq!(receipt.invoice.unwrap().status, InvoiceStatus::Overdue);
    }

    #[test]
    fn pending_payment_can_be_cancelled_once() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let pending = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(500), PaymentMode::Razorpay))
            .unwrap();

        let cancelled = f
            .billing
            .cancel_payment(&pending.id, Some("Patient paid cash instead"))
            .unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);

        let err = f.billing.cancel_payment(&pending.id, None).unwrap_err();
        assert!(matches!(err, ClinicError::AlreadyCancelled(_)));
        assert_eq!(f.billing.get_invoice(&invoice.id).unwrap().amount_paid, Decimal::ZERO);
    }

    #[test]
    fn fully_discounted_invoice_is_settled_when_issued() {
        let f = fixture();
        let draft = f.billing.create_invoice(root_canal(dec!(100))).unwrap();
        assert_eq!(draft.grand_total, Decimal::ZERO);
        assert_eq!(draft.status, InvoiceStatus::Draft);

        let invoice = f.billing.issue_invoice(&draft.id).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.payment_status, SettlementStatus::Paid);

        let err = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(1), PaymentMode::Cash))
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));

        f.clock.set_date(NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
        assert_eq!(f.billing.sweep_overdue(f.clock.today()).unwrap(), 0);
        assert_eq!(f.billing.get_invoice(&invoice.id).unwrap().status, InvoiceStatus::Paid);
    }

    #[test]
    fn open_orders_hold_their_share_of_the_balance() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let first = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(3000), PaymentMode::Razorpay))
            .unwrap();

        let err = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(2500), PaymentMode::Razorpay))
            .unwrap_err();
        match err {
            ClinicError::ExceedsBalance { available, .. } => assert_eq!(available, dec!(2000)),
            other => panic!("unexpected error {other:?}"),
        }
        f.billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(2000), PaymentMode::Razorpay))
            .unwrap();

        // Cancelling an order frees its share again.
        f.billing.cancel_payment(&first.id, None).unwrap();
        f.billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(3000), PaymentMode::Razorpay))
            .unwrap();
    }

    #[test]
    fn capture_that_no_longer_fits_fails_with_a_reason() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let pending = f
            .billing
            .create_gateway_order(&PaymentRequest::for_invoice(&invoice, dec!(5000), PaymentMode::Razorpay))
            .unwrap();
        f.billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(5000), PaymentMode::Cash))
            .unwrap();

        let order_id = pending.gateway.as_ref().unwrap().order_id.clone();
        let signature = f.gateway.sign(&order_id, "pay_late").unwrap();
        let err = f
            .billing
            .verify_gateway_payment(&order_id, "pay_late", &signature)
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));

        let stored = f.billing.get_payment(&pending.id).unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("Refund at the gateway"));
        assert_eq!(
            stored.gateway.unwrap().payment_id.as_deref(),
            Some("pay_late")
        );
        assert_eq!(f.billing.get_invoice(&invoice.id).unwrap().amount_paid, dec!(5000));

        let body = format!(
            r#"{{"event":"payment.captured","order_id":"{order_id}","payment_id":"pay_late"}}"#
        );
        assert!(matches!(webhook(&f, &body).unwrap(), WebhookOutcome::Duplicate(_)));
    }

    #[test]
    fn opd_fee_is_paid_once_and_in_full() {
        let f = fixture();
        let appointment = f
            .appointments
            .book(&BookingRequest::new("P1", "c1", monday(), "09:30", "Checkup"))
            .unwrap();
        let opd = |amount: Decimal, mode: PaymentMode| PaymentRequest {
            patient_id: "P1".to_string(),
            clinic_id: "c1".to_string(),
            invoice_id: None,
            appointment_id: Some(appointment.id),
            amount,
            payment_mode: mode,
            notes: None,
            created_by: "reception".to_string(),
        };

        let err = f
            .billing
            .record_payment(&opd(appointment.opd_fee - dec!(100), PaymentMode::Cash))
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidInput(_)));
        let err = f
            .billing
            .record_payment(&opd(appointment.opd_fee + dec!(1), PaymentMode::Cash))
            .unwrap_err();
        assert!(matches!(err, ClinicError::ExceedsBalance { .. }));

        let order = f
            .billing
            .create_gateway_order(&opd(appointment.opd_fee, PaymentMode::Razorpay))
            .unwrap();
        let err = f
            .billing
            .create_gateway_order(&opd(appointment.opd_fee, PaymentMode::Razorpay))
            .unwrap_err();
        assert!(matches!(err, ClinicError::ExceedsBalance { .. }));
        f.billing.cancel_payment(&order.id, None).unwrap();

        let paid = f
            .billing
            .record_payment(&opd(appointment.opd_fee, PaymentMode::Cash))
            .unwrap();
        let err = f
            .billing
            .record_payment(&opd(appointment.opd_fee, PaymentMode::Upi))
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidOperation(_)));
        assert_eq!(f.billing.get_payment(&paid.payment.id).unwrap().status, PaymentStatus::Paid);
        assert!(f.appointments.get(&appointment.id).unwrap().opd_fee_paid);
    }

    #[test]
    fn refund_after_due_date_returns_invoice_to_overdue() {
        let f = fixture();
        let invoice = issued(&f, Decimal::ZERO);
        let receipt = f
            .billing
            .record_payment(&PaymentRequest::for_invoice(&invoice, dec!(5000), PaymentMode::Card))
            .unwrap();

        f.clock.set_date(NaiveDate::from_ymd_opt(2026, 11, 20).unwrap());
        let refunded = f
            .billing
            .refund_payment(&receipt.payment.id, Some(dec!(1500)), "Filling redone free", "admin")
            .unwrap();
        let invoice = refunded.invoice.unwrap();
        assert_eq!(invoice.payment_status, SettlementStatus::Partial);
        assert_eq!(invoice.status, InvoiceStatus::Overdue);
    }

    #[test]
    fn lab_numbers_are_monthly() {
        let f = fixture();
        assert_eq!(f.billing.next_test_number().unwrap(), "TST-2611-0001");
        assert_eq!(f.billing.next_test_number().unwrap(), "TST-2611-0002");
        assert_eq!(f.billing.next_report_number().unwrap(), "RPT-2611-0001");
    }
}
