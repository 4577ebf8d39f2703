//! Payment reconciliation against invoices, plus gateway signature checks.
//!
//! The functions that touch an `Invoice` only change `amount_paid` and then
//! hand over to `invoice::recalculate`; `billing` decides when they run so
//! that each payment lands exactly once.

use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::ClinicError;
use crate::invoice;
use crate::models::{Appointment, Invoice, InvoiceStatus, Payment, PaymentStatus, SettlementStatus};

type HmacSha256 = Hmac<Sha256>;

/// Check that `amount` may be paid against `invoice` right now.
pub fn ensure_payable(invoice: &Invoice, amount: Decimal) -> Result<(), ClinicError> {
    if amount <= Decimal::ZERO {
        return Err(ClinicError::InvalidInput(
            "Payment amount must be positive".to_string(),
        ));
    }
    match invoice.status {
        InvoiceStatus::Cancelled => {
            return Err(ClinicError::InvalidOperation(format!(
                "Invoice {} is cancelled",
                invoice.invoice_number
            )))
        }
        InvoiceStatus::Draft => {
            return Err(ClinicError::InvalidOperation(format!(
                "Invoice {} must be issued before it can be paid",
                invoice.invoice_number
            )))
        }
        _ => {}
    }
    if invoice.payment_status == SettlementStatus::Paid {
        return Err(ClinicError::InvalidOperation(format!(
            "Invoice {} is already fully paid",
            invoice.invoice_number
        )));
    }
    if amount > invoice.balance_due {
        return Err(ClinicError::ExceedsBalance {
            requested: amount,
            available: invoice.balance_due,
        });
    }
    Ok(())
}

/// Check that `amount` settles the appointment's OPD fee, paid in one go.
pub fn ensure_opd_payable(appointment: &Appointment, amount: Decimal) -> Result<(), ClinicError> {
    if appointment.opd_fee_paid {
        return Err(ClinicError::InvalidOperation(format!(
            "OPD fee for appointment {} is already paid",
            appointment.appointment_number
        )));
    }
    if amount > appointment.opd_fee {
        return Err(ClinicError::ExceedsBalance {
            requested: amount,
            available: appointment.opd_fee,
        });
    }
    if amount < appointment.opd_fee {
        return Err(ClinicError::InvalidInput(format!(
            "OPD fee for appointment {} is {}",
            appointment.appointment_number, appointment.opd_fee
        )));
    }
    Ok(())
}

/// Amount held by gateway orders that have not been captured yet.
pub fn pending_total(payments: &[Payment]) -> Decimal {
    payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Pending)
        .map(|p| p.amount)
        .sum()
}

/// Add a paid amount to the invoice and recalculate.
pub fn apply_payment(invoice: &mut Invoice, amount: Decimal) -> Result<(), ClinicError> {
    ensure_payable(invoice, amount)?;
    invoice.amount_paid += amount;
    invoice::recalculate(invoice);
    Ok(())
}

/// Take a refunded amount back off the invoice and recalculate. An invoice
/// reopened after its due date goes straight back to overdue.
pub fn reverse_payment(
    invoice: &mut Invoice,
    amount: Decimal,
    today: NaiveDate,
) -> Result<(), ClinicError> {
    if amount <= Decimal::ZERO {
        return Err(ClinicError::InvalidInput(
            "Refund amount must be positive".to_string(),
        ));
    }
    if amount > invoice.amount_paid {
        return Err(ClinicError::ExceedsBalance {
            requested: amount,
            available: invoice.amount_paid,
        });
    }
    invoice.amount_paid -= amount;
    invoice::recalculate(invoice);
    invoice::flag_if_past_due(invoice, today);
    Ok(())
}

/// Resolve how much of a payment to refund. Defaults to the full amount.
pub fn refund_amount(payment: &Payment, requested: Option<Decimal>) -> Result<Decimal, ClinicError> {
    if payment.status != PaymentStatus::Paid {
        return Err(ClinicError::InvalidOperation(format!(
            "Payment {} is {}; only paid payments can be refunded",
            payment.payment_number, payment.status
        )));
    }
    let amount = requested.unwrap_or(payment.amount);
    if amount <= Decimal::ZERO {
        return Err(ClinicError::InvalidInput(
            "Refund amount must be positive".to_string(),
        ));
    }
    if amount > payment.amount {
        return Err(ClinicError::ExceedsBalance {
            requested: amount,
            available: payment.amount,
        });
    }
    Ok(amount)
}

/// Convert a currency amount to minor units (paise, cents).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ClinicError> {
    let scaled = (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled
        .to_i64()
        .ok_or_else(|| ClinicError::InvalidInput(format!("Amount {amount} is out of range")))
}

// ─── Signatures ───────────────────────────────────────────────────────────────

/// Message signed by the gateway for a captured payment.
pub fn signature_payload(order_id: &str, payment_id: &str) -> String {
    format!("{order_id}|{payment_id}")
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Lowercase hex HMAC-SHA256 of `message`.
pub fn hmac_hex(secret: &str, message: &str) -> Result<String, ClinicError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ClinicError::Internal(format!("HMAC key rejected: {e}")))?;
    mac.update(message.as_bytes());
    Ok(to_hex(&mac.finalize().into_bytes()))
}

pub fn gateway_signature(
    secret: &str,
    order_id: &str,
    payment_id: &str,
) -> Result<String, ClinicError> {
    hmac_hex(secret, &signature_payload(order_id, payment_id))
}

/// Constant-time check of a hex signature. An empty secret never verifies.
pub fn verify_hmac(secret: &str, message: &str, signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let expected = match hmac_hex(secret, message) {
        Ok(expected) => expected,
        Err(_) => return false,
    };
    let provided = signature.trim().to_ascii_lowercase();
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

// ─── Webhook ──────────────────────────────────────────────────────────────────

/// Body of a gateway webhook delivery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub order_id: String,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAction {
    Captured { payment_id: Option<String> },
    Failed { reason: String },
    Ignored,
}

impl WebhookEvent {
    pub fn parse(body: &str) -> Result<Self, ClinicError> {
        let event: WebhookEvent = serde_json::from_str(body)
            .map_err(|e| ClinicError::InvalidInput(format!("Malformed webhook body: {e}")))?;
        if event.order_id.trim().is_empty() {
            return Err(ClinicError::InvalidInput(
                "Webhook is missing order_id".to_string(),
            ));
        }
        Ok(event)
    }

    pub fn action(&self) -> WebhookAction {
        match self.event.as_str() {
            "payment.captured" => WebhookAction::Captured {
                payment_id: self.payment_id.clone(),
            },
            "payment.failed" => WebhookAction::Failed {
                reason: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "Payment failed at gateway".to_string()),
            },
            _ => WebhookAction::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{add_item, build_item, issue, new_draft, ItemInput};
    use crate::models::ItemType;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn issue_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, 2).unwrap()
    }

    fn issued_invoice(price: Decimal) -> Invoice {
        let now = Utc.with_ymd_and_hms(2026, 11, 2, 10, 0, 0).unwrap();
        let mut invoice = new_draft("INV-2611-0001".into(), "P1", "c1", None, "billing", now);
        let item = build_item(
            ItemInput::new(ItemType::Treatment, "Crown", 1, price).with_discount(dec!(0), dec!(0)),
            Decimal::ZERO,
        )
        .unwrap();
        add_item(&mut invoice, item).unwrap();
        issue(&mut invoice, now, issue_day(), 15).unwrap();
        invoice
    }

    #[test]
    fn payment_settles_invoice() {
        let mut invoice = issued_invoice(dec!(4500));
        apply_payment(&mut invoice, dec!(4500)).unwrap();
        assert_eq!(invoice.payment_status, SettlementStatus::Paid);
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.balance_due, Decimal::ZERO);

        assert!(matches!(
            apply_payment(&mut invoice, dec!(1)),
            Err(ClinicError::InvalidOperation(_))
        ));
    }

    #[test]
    fn overpayment_leaves_invoice_untouched() {
        let mut invoice = issued_invoice(dec!(1000));
        let err = apply_payment(&mut invoice, dec!(1500)).unwrap_err();
        assert!(matches!(err, ClinicError::ExceedsBalance { .. }));
        assert_eq!(invoice.amount_paid, Decimal::ZERO);
    }

    #[test]
    fn draft_and_cancelled_invoices_reject_payment() {
        let now = Utc.with_ymd_and_hms(2026, 11, 2, 10, 0, 0).unwrap();
        let draft = new_draft("INV-2611-0002".into(), "P1", "c1", None, "billing", now);
        assert!(matches!(
            ensure_payable(&draft, dec!(10)),
            Err(ClinicError::InvalidOperation(_))
        ));

        let mut cancelled = issued_invoice(dec!(1000));
        crate::invoice::cancel(&mut cancelled, "Duplicate", now).unwrap();
        assert!(matches!(
            ensure_payable(&cancelled, dec!(10)),
            Err(ClinicError::InvalidOperation(_))
        ));
    }

    #[test]
    fn refund_reduces_amount_paid() {
        let mut invoice = issued_invoice(dec!(4900));
        apply_payment(&mut invoice, dec!(4900)).unwrap();
        reverse_payment(&mut invoice, dec!(2000), issue_day()).unwrap();
        assert_eq!(invoice.amount_paid, dec!(2900));
        assert_eq!(invoice.balance_due, dec!(2000));
        assert_eq!(invoice.payment_status, SettlementStatus::Partial);
        assert_eq!(invoice.status, InvoiceStatus::PartiallyPaid);

        assert!(matches!(
            reverse_payment(&mut invoice, dec!(5000), issue_day()),
            Err(ClinicError::ExceedsBalance { .. })
        ));
    }

    #[test]
    fn refund_after_due_date_reopens_as_overdue() {
        let mut invoice = issued_invoice(dec!(1000));
        apply_payment(&mut invoice, dec!(1000)).unwrap();
        let after_due = invoice.due_date.unwrap().succ_opt().unwrap();

        reverse_payment(&mut invoice, dec!(300), after_due).unwrap();
        assert_eq!(invoice.payment_status, SettlementStatus::Partial);
        assert_eq!(invoice.status, InvoiceStatus::Overdue);
        assert_eq!(invoice.balance_due, dec!(300));
    }

    #[test]
    fn minor_units() {
        assert_eq!(to_minor_units(dec!(4500)).unwrap(), 450_000);
        assert_eq!(to_minor_units(dec!(12.345)).unwrap(), 1235);
    }

    #[test]
    fn signatures_verify_in_constant_time_compare() {
        let signature = gateway_signature("secret", "order_1", "pay_1").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_hmac("secret", "order_1|pay_1", &signature));
        assert!(verify_hmac("secret", "order_1|pay_1", &signature.to_uppercase()));
        assert!(!verify_hmac("secret", "order_1|pay_2", &signature));
        assert!(!verify_hmac("other", "order_1|pay_1", &signature));
        assert!(!verify_hmac("", "order_1|pay_1", &signature));
        assert!(!verify_hmac("secret", "order_1|pay_1", "deadbeef"));
    }

    #[test]
    fn known_hmac_vector() {
        // RFC 4231 test case 2.
        let mac = hmac_hex("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            mac,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn webhook_parsing() {
        let captured = WebhookEvent::parse(
            r#"{"event":"payment.captured","order_id":"order_1","payment_id":"pay_1"}"#,
        )
        .unwrap();
        assert_eq!(
            captured.action(),
            WebhookAction::Captured {
                payment_id: Some("pay_1".into())
            }
        );

        let failed =
            WebhookEvent::parse(r#"{"event":"payment.failed","order_id":"order_1"}"#).unwrap();
        assert!(matches!(failed.action(), WebhookAction::Failed { .. }));

        let other = WebhookEvent::parse(r#"{"event":"order.paid","order_id":"order_1"}"#).unwrap();
        assert_eq!(other.action(), WebhookAction::Ignored);

        assert!(matches!(
            WebhookEvent::parse("not json"),
            Err(ClinicError::InvalidInput(_))
        ));
    }

    #[test]
    fn refund_amount_rules() {
        let now = Utc.with_ymd_and_hms(2026, 11, 2, 10, 0, 0).unwrap();
        let mut payment = Payment {
            id: uuid::Uuid::new_v4(),
            payment_number: "PAY-2611-0001".into(),
            patient_id: "P1".into(),
            clinic_id: "c1".into(),
            invoice_id: None,
            appointment_id: None,
            amount: dec!(4900),
            payment_mode: crate::models::PaymentMode::Cash,
            status: PaymentStatus::Paid,
            gateway: None,
            failure_reason: None,
            refund: None,
            paid_at: Some(now),
            notes: None,
            created_by: "billing".into(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(refund_amount(&payment, None).unwrap(), dec!(4900));
        assert_eq!(refund_amount(&payment, Some(dec!(2000))).unwrap(), dec!(2000));
        assert!(matches!(
            refund_amount(&payment, Some(dec!(5000))),
            Err(ClinicError::ExceedsBalance { .. })
        ));

        payment.status = PaymentStatus::Pending;
        assert!(matches!(
            refund_amount(&payment, None),
            Err(ClinicError::InvalidOperation(_))
        ));
    }
}
