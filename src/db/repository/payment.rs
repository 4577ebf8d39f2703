use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{decimal_at, decimal_text, opt_decimal_at, opt_uuid_at, uuid_at};
use crate::db::DatabaseError;
use crate::models::{GatewayRefs, Payment, PaymentStatus, Refund};

const PAYMENT_COLUMNS: &str = "id, payment_number, patient_id, clinic_id, invoice_id,
    appointment_id, amount, payment_mode, status, gateway_order_id, gateway_payment_id,
    gateway_signature, failure_reason, refund_amount, refund_reason, refund_id, refunded_by,
    refunded_at, paid_at, notes, created_by, created_at, updated_at";

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let order_id: Option<String> = row.get(9)?;
    let gateway = match order_id {
        Some(order_id) => Some(GatewayRefs {
            order_id,
            payment_id: row.get(10)?,
            signature: row.get(11)?,
        }),
        None => None,
    };

    let refund = match opt_decimal_at(row, 13)? {
        Some(amount) => Some(Refund {
            amount,
            reason: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
            refund_id: row.get(15)?,
            refunded_by: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
            refunded_at: row.get(17)?,
        }),
        None => None,
    };

    Ok(Payment {
        id: uuid_at(row, 0)?,
        payment_number: row.get(1)?,
        patient_id: row.get(2)?,
        clinic_id: row.get(3)?,
        invoice_id: opt_uuid_at(row, 4)?,
        appointment_id: opt_uuid_at(row, 5)?,
        amount: decimal_at(row, 6)?,
        payment_mode: row.get(7)?,
        status: row.get(8)?,
        gateway,
        failure_reason: row.get(12)?,
        refund,
        paid_at: row.get(18)?,
        notes: row.get(19)?,
        created_by: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

pub fn insert_payment(conn: &Connection, payment: &Payment) -> Result<(), DatabaseError> {
    let gateway = payment.gateway.as_ref();
    let refund = payment.refund.as_ref();
    conn.execute(
        "INSERT INTO payments
         (id, payment_number, patient_id, clinic_id, invoice_id, appointment_id, amount,
          payment_mode, status, gateway_order_id, gateway_payment_id, gateway_signature,
          failure_reason, refund_amount, refund_reason, refund_id, refunded_by, refunded_at,
          paid_at, notes, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            payment.id.to_string(),
            payment.payment_number,
            payment.patient_id,
            payment.clinic_id,
            payment.invoice_id.map(|id| id.to_string()),
            payment.appointment_id.map(|id| id.to_string()),
            decimal_text(&payment.amount),
            payment.payment_mode,
            payment.status,
            gateway.map(|g| g.order_id.clone()),
            gateway.and_then(|g| g.payment_id.clone()),
            gateway.and_then(|g| g.signature.clone()),
            payment.failure_reason,
            refund.map(|r| decimal_text(&r.amount)),
            refund.map(|r| r.reason.clone()),
            refund.and_then(|r| r.refund_id.clone()),
            refund.map(|r| r.refunded_by.clone()),
            refund.map(|r| r.refunded_at),
            payment.paid_at,
            payment.notes,
            payment.created_by,
            payment.created_at,
            payment.updated_at,
        ],
    )?;
    Ok(())
}

/// Rewrite the mutable columns of a payment.
pub fn update_payment(conn: &Connection, payment: &Payment) -> Result<(), DatabaseError> {
    let gateway = payment.gateway.as_ref();
    let refund = payment.refund.as_ref();
    let changed = conn.execute(
        "UPDATE payments SET
            status = ?2, gateway_payment_id = ?3, gateway_signature = ?4, failure_reason = ?5,
            refund_amount = ?6, refund_reason = ?7, refund_id = ?8, refunded_by = ?9,
            refunded_at = ?10, paid_at = ?11, notes = ?12, updated_at = ?13
         WHERE id = ?1",
        params![
            payment.id.to_string(),
            payment.status,
            gateway.and_then(|g| g.payment_id.clone()),
            gateway.and_then(|g| g.signature.clone()),
            payment.failure_reason,
            refund.map(|r| decimal_text(&r.amount)),
            refund.map(|r| r.reason.clone()),
            refund.and_then(|r| r.refund_id.clone()),
            refund.map(|r| r.refunded_by.clone()),
            refund.map(|r| r.refunded_at),
            payment.paid_at,
            payment.notes,
            payment.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("Payment", payment.id));
    }
    Ok(())
}

/// Move a pending payment to paid. Returns false when the payment was not
/// pending, so a capture can only be applied once.
pub fn mark_paid_if_pending(
    conn: &Connection,
    id: &Uuid,
    gateway_payment_id: Option<&str>,
    signature: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE payments SET
            status = ?2,
            gateway_payment_id = COALESCE(?3, gateway_payment_id),
            gateway_signature = COALESCE(?4, gateway_signature),
            failure_reason = NULL,
            paid_at = ?5,
            updated_at = ?5
         WHERE id = ?1 AND status = ?6",
        params![
            id.to_string(),
            PaymentStatus::Paid,
            gateway_payment_id,
            signature,
            now,
            PaymentStatus::Pending,
        ],
    )?;
    Ok(changed == 1)
}

pub fn get_payment(conn: &Connection, id: &Uuid) -> Result<Option<Payment>, DatabaseError> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1");
    let payment = conn
        .query_row(&sql, params![id.to_string()], payment_from_row)
        .optional()?;
    Ok(payment)
}

pub fn require_payment(conn: &Connection, id: &Uuid) -> Result<Payment, DatabaseError> {
    get_payment(conn, id)?.ok_or_else(|| DatabaseError::not_found("Payment", id))
}

pub fn get_payment_by_order(
    conn: &Connection,
    order_id: &str,
) -> Result<Option<Payment>, DatabaseError> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE gateway_order_id = ?1");
    let payment = conn
        .query_row(&sql, params![order_id], payment_from_row)
        .optional()?;
    Ok(payment)
}

pub fn list_payments_for_invoice(
    conn: &Connection,
    invoice_id: &Uuid,
) -> Result<Vec<Payment>, DatabaseError> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE invoice_id = ?1 ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![invoice_id.to_string()], payment_from_row)?;

    let mut payments = Vec::new();
    for row in rows {
        payments.push(row?);
    }
    Ok(payments)
}

/// Payments made straight against an appointment's OPD fee, without an invoice.
pub fn list_opd_payments(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Vec<Payment>, DatabaseError> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments
         WHERE appointment_id = ?1 AND invoice_id IS NULL ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![appointment_id.to_string()], payment_from_row)?;

    let mut payments = Vec::new();
    for row in rows {
        payments.push(row?);
    }
    Ok(payments)
}

pub fn max_payment_serial(conn: &Connection, prefix: &str) -> Result<i64, DatabaseError> {
    let max = conn.query_row(
        "SELECT COALESCE(MAX(CAST(substr(payment_number, length(?1) + 1) AS INTEGER)), 0)
         FROM payments WHERE substr(payment_number, 1, length(?1)) = ?1",
        params![prefix],
        |row| row.get(0),
    )?;
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::PaymentMode;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn make_payment(number: &str, order: Option<&str>) -> Payment {
        let now = Utc.with_ymd_and_hms(2026, 11, 2, 10, 0, 0).unwrap();
        Payment {
            id: Uuid::new_v4(),
            payment_number: number.to_string(),
            patient_id: "P1".to_string(),
            clinic_id: "c1".to_string(),
            invoice_id: None,
            appointment_id: None,
            amount: dec!(2000),
            payment_mode: if order.is_some() {
                PaymentMode::Razorpay
            } else {
                PaymentMode::Cash
            },
            status: if order.is_some() {
                PaymentStatus::Pending
            } else {
                PaymentStatus::Paid
            },
            gateway: order.map(|order_id| GatewayRefs {
                order_id: order_id.to_string(),
                payment_id: None,
                signature: None,
            }),
            failure_reason: None,
            refund: None,
            paid_at: None,
            notes: None,
            created_by: "billing".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn payment_insert_and_lookup_by_order() {
        let conn = open_memory_database().unwrap();
        let payment = make_payment("PAY-2611-0001", Some("order_abc"));
        insert_payment(&conn, &payment).unwrap();

        let loaded = get_payment_by_order(&conn, "order_abc").unwrap().unwrap();
        assert_eq!(loaded.id, payment.id);
        assert_eq!(loaded.status, PaymentStatus::Pending);
        assert!(loaded.refund.is_none());
        assert!(get_payment_by_order(&conn, "order_zzz").unwrap().is_none());
    }

    #[test]
    fn pending_capture_applies_once() {
        let conn = open_memory_database().unwrap();
        let payment = make_payment("PAY-2611-0001", Some("order_abc"));
        insert_payment(&conn, &payment).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 11, 2, 10, 5, 0).unwrap();

        assert!(mark_paid_if_pending(&conn, &payment.id, Some("pay_1"), Some("sig"), now).unwrap());
        assert!(!mark_paid_if_pending(&conn, &payment.id, Some("pay_1"), Some("sig"), now).unwrap());

        let loaded = require_payment(&conn, &payment.id).unwrap();
        assert_eq!(loaded.status, PaymentStatus::Paid);
        assert_eq!(loaded.paid_at, Some(now));
        let gateway = loaded.gateway.unwrap();
        assert_eq!(gateway.payment_id.as_deref(), Some("pay_1"));
    }

    #[test]
    fn refund_fields_round_trip() {
        let conn = open_memory_database().unwrap();
        let mut payment = make_payment("PAY-2611-0001", None);
        insert_payment(&conn, &payment).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 11, 3, 9, 0, 0).unwrap();
        payment.status = PaymentStatus::Refunded;
        payment.refund = Some(Refund {
            amount: dec!(2000),
            reason: "Treatment not done".to_string(),
            refund_id: None,
            refunded_by: "manager".to_string(),
            refunded_at: now,
        });
        update_payment(&conn, &payment).unwrap();

        let loaded = require_payment(&conn, &payment.id).unwrap();
        assert_eq!(loaded.status, PaymentStatus::Refunded);
        assert_eq!(loaded.refund, payment.refund);
    }

    #[test]
    fn order_ids_are_unique() {
        let conn = open_memory_database().unwrap();
        insert_payment(&conn, &make_payment("PAY-2611-0001", Some("order_abc"))).unwrap();
        let err = insert_payment(&conn, &make_payment("PAY-2611-0002", Some("order_abc")))
            .unwrap_err();
        assert!(err.is_unique_violation());
    }
}
