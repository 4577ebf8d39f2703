use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{decimal_at, decimal_text, opt_uuid_at, uuid_at};
use crate::db::DatabaseError;
use crate::models::{
    BilledEntity, Invoice, InvoiceDiscount, InvoiceStatus, ItemDiscount, LineItem,
};

const INVOICE_COLUMNS: &str = "id, invoice_number, patient_id, clinic_id, appointment_id,
    discount_percentage, discount_amount, discount_reason, subtotal, total_tax, grand_total,
    amount_paid, balance_due, status, payment_status, due_date, issued_at, cancelled_at,
    cancellation_reason, notes, created_by, created_at, updated_at";

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: uuid_at(row, 0)?,
        invoice_number: row.get(1)?,
        patient_id: row.get(2)?,
        clinic_id: row.get(3)?,
        appointment_id: opt_uuid_at(row, 4)?,
        items: Vec::new(),
        discount: InvoiceDiscount {
            percentage: decimal_at(row, 5)?,
            amount: decimal_at(row, 6)?,
            reason: row.get(7)?,
        },
        subtotal: decimal_at(row, 8)?,
        total_tax: decimal_at(row, 9)?,
        grand_total: decimal_at(row, 10)?,
        amount_paid: decimal_at(row, 11)?,
        balance_due: decimal_at(row, 12)?,
        status: row.get(13)?,
        payment_status: row.get(14)?,
        due_date: row.get(15)?,
        issued_at: row.get(16)?,
        cancelled_at: row.get(17)?,
        cancellation_reason: row.get(18)?,
        notes: row.get(19)?,
        created_by: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<LineItem> {
    let kind: Option<String> = row.get(2)?;
    let reference = BilledEntity::from_parts(kind.as_deref(), row.get(3)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(LineItem {
        id: uuid_at(row, 0)?,
        item_type: row.get(1)?,
        reference,
        description: row.get(4)?,
        quantity: row.get(5)?,
        unit_price: decimal_at(row, 6)?,
        discount: ItemDiscount {
            percentage: decimal_at(row, 7)?,
            amount: decimal_at(row, 8)?,
        },
        tax_rate: decimal_at(row, 9)?,
        amount: decimal_at(row, 10)?,
        tax_amount: decimal_at(row, 11)?,
        total: decimal_at(row, 12)?,
    })
}

/// Insert a new invoice and its line items.
pub fn insert_invoice(conn: &Connection, invoice: &Invoice) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO invoices
         (id, invoice_number, patient_id, clinic_id, appointment_id, discount_percentage,
          discount_amount, discount_reason, subtotal, total_tax, grand_total, amount_paid,
          balance_due, status, payment_status, due_date, issued_at, cancelled_at,
          cancellation_reason, notes, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            invoice.id.to_string(),
            invoice.invoice_number,
            invoice.patient_id,
            invoice.clinic_id,
            invoice.appointment_id.map(|id| id.to_string()),
            decimal_text(&invoice.discount.percentage),
            decimal_text(&invoice.discount.amount),
            invoice.discount.reason,
            decimal_text(&invoice.subtotal),
            decimal_text(&invoice.total_tax),
            decimal_text(&invoice.grand_total),
            decimal_text(&invoice.amount_paid),
            decimal_text(&invoice.balance_due),
            invoice.status,
            invoice.payment_status,
            invoice.due_date,
            invoice.issued_at,
            invoice.cancelled_at,
            invoice.cancellation_reason,
            invoice.notes,
            invoice.created_by,
            invoice.created_at,
            invoice.updated_at,
        ],
    )?;
    insert_items(conn, &invoice.id, &invoice.items)
}

/// Rewrite an invoice header and replace its line items.
pub fn update_invoice(conn: &Connection, invoice: &Invoice) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE invoices SET
            discount_percentage = ?2, discount_amount = ?3, discount_reason = ?4,
            subtotal = ?5, total_tax = ?6, grand_total = ?7, amount_paid = ?8,
            balance_due = ?9, status = ?10, payment_status = ?11, due_date = ?12,
            issued_at = ?13, cancelled_at = ?14, cancellation_reason = ?15, notes = ?16,
            updated_at = ?17
         WHERE id = ?1",
        params![
            invoice.id.to_string(),
            decimal_text(&invoice.discount.percentage),
            decimal_text(&invoice.discount.amount),
            invoice.discount.reason,
            decimal_text(&invoice.subtotal),
            decimal_text(&invoice.total_tax),
            decimal_text(&invoice.grand_total),
            decimal_text(&invoice.amount_paid),
            decimal_text(&invoice.balance_due),
            invoice.status,
            invoice.payment_status,
            invoice.due_date,
            invoice.issued_at,
            invoice.cancelled_at,
            invoice.cancellation_reason,
            invoice.notes,
            invoice.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("Invoice", invoice.id));
    }

    conn.execute(
        "DELETE FROM invoice_items WHERE invoice_id = ?1",
        params![invoice.id.to_string()],
    )?;
    insert_items(conn, &invoice.id, &invoice.items)
}

fn insert_items(conn: &Connection, invoice_id: &Uuid, items: &[LineItem]) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "INSERT INTO invoice_items
         (id, invoice_id, position, item_type, reference_kind, reference_id, description,
          quantity, unit_price, discount_percentage, discount_amount, tax_rate, amount,
          tax_amount, total)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )?;
    for (position, item) in items.iter().enumerate() {
        let (kind, reference_id) = item.reference.to_parts();
        stmt.execute(params![
            item.id.to_string(),
            invoice_id.to_string(),
            position as i64,
            item.item_type,
            kind,
            reference_id,
            item.description,
            item.quantity,
            decimal_text(&item.unit_price),
            decimal_text(&item.discount.percentage),
            decimal_text(&item.discount.amount),
            decimal_text(&item.tax_rate),
            decimal_text(&item.amount),
            decimal_text(&item.tax_amount),
            decimal_text(&item.total),
        ])?;
    }
    Ok(())
}

fn load_items(conn: &Connection, invoice_id: &Uuid) -> Result<Vec<LineItem>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, item_type, reference_kind, reference_id, description, quantity, unit_price,
                discount_percentage, discount_amount, tax_rate, amount, tax_amount, total
         FROM invoice_items
         WHERE invoice_id = ?1
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![invoice_id.to_string()], item_from_row)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

pub fn get_invoice(conn: &Connection, id: &Uuid) -> Result<Option<Invoice>, DatabaseError> {
    let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1");
    let invoice = conn
        .query_row(&sql, params![id.to_string()], invoice_from_row)
        .optional()?;

    match invoice {
        Some(mut invoice) => {
            invoice.items = load_items(conn, &invoice.id)?;
            Ok(Some(invoice))
        }
        None => Ok(None),
    }
}

pub fn require_invoice(conn: &Connection, id: &Uuid) -> Result<Invoice, DatabaseError> {
    get_invoice(conn, id)?.ok_or_else(|| DatabaseError::not_found("Invoice", id))
}

pub fn list_invoices_for_patient(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<Invoice>, DatabaseError> {
    let sql = format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE patient_id = ?1 ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![patient_id], invoice_from_row)?;

    let mut invoices = Vec::new();
    for row in rows {
        let mut invoice = row?;
        invoice.items = load_items(conn, &invoice.id)?;
        invoices.push(invoice);
    }
    Ok(invoices)
}

pub fn max_invoice_serial(conn: &Connection, prefix: &str) -> Result<i64, DatabaseError> {
    let max = conn.query_row(
        "SELECT COALESCE(MAX(CAST(substr(invoice_number, length(?1) + 1) AS INTEGER)), 0)
         FROM invoices WHERE substr(invoice_number, 1, length(?1)) = ?1",
        params![prefix],
        |row| row.get(0),
    )?;
    Ok(max)
}

/// Flip issued, unsettled invoices past their due date to overdue.
/// Returns the number of invoices changed.
pub fn mark_overdue(
    conn: &Connection,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE invoices SET status = ?1, updated_at = ?2
         WHERE status IN (?3, ?4) AND due_date IS NOT NULL AND due_date < ?5",
        params![
            InvoiceStatus::Overdue,
            now,
            InvoiceStatus::Sent,
            InvoiceStatus::PartiallyPaid,
            today,
        ],
    )?;
    Ok(changed)
}
