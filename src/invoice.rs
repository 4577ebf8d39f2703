//! Invoice arithmetic and draft-state mutations.
//!
//! Everything here works on an in-memory `Invoice`; persistence and
//! transaction boundaries belong to `billing`. Every mutation ends with
//! `recalculate`, which is the single place totals and both status fields
//! are written.

use chrono::{DateTime, Days, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::error::ClinicError;
use crate::models::{
    BilledEntity, Invoice, InvoiceDiscount, InvoiceStatus, ItemDiscount, ItemType, LineItem,
    SettlementStatus,
};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Money kept at two decimal places on line items.
fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Grand totals are rounded to whole currency units.
fn round_whole(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

fn check_percentage(field: &str, value: Decimal) -> Result<(), ClinicError> {
    if value < Decimal::ZERO || value > HUNDRED {
        return Err(ClinicError::InvalidInput(format!(
            "{field} must be between 0 and 100"
        )));
    }
    Ok(())
}

fn check_non_negative(field: &str, value: Decimal) -> Result<(), ClinicError> {
    if value < Decimal::ZERO {
        return Err(ClinicError::InvalidInput(format!("{field} cannot be negative")));
    }
    Ok(())
}

/// Caller-supplied fields of a line item.
#[derive(Debug, Clone)]
pub struct ItemInput {
    pub item_type: ItemType,
    pub reference: BilledEntity,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    /// `None` lets the patient's membership discount apply.
    pub discount: Option<ItemDiscount>,
    pub tax_rate: Decimal,
}

impl ItemInput {
    pub fn new(item_type: ItemType, description: &str, quantity: u32, unit_price: Decimal) -> Self {
        ItemInput {
            item_type,
            reference: BilledEntity::None,
            description: description.to_string(),
            quantity,
            unit_price,
            discount: None,
            tax_rate: Decimal::ZERO,
        }
    }

    pub fn with_reference(mut self, reference: BilledEntity) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_discount(mut self, percentage: Decimal, amount: Decimal) -> Self {
        self.discount = Some(ItemDiscount { percentage, amount });
        self
    }

    pub fn with_tax_rate(mut self, tax_rate: Decimal) -> Self {
        self.tax_rate = tax_rate;
        self
    }
}

/// Validate input and produce a priced line item.
///
/// When no explicit discount is given, `membership_percent` becomes the
/// item's discount percentage.
pub fn build_item(input: ItemInput, membership_percent: Decimal) -> Result<LineItem, ClinicError> {
    if input.description.trim().is_empty() {
        return Err(ClinicError::InvalidInput(
            "Item description is required".to_string(),
        ));
    }
    if input.quantity < 1 {
        return Err(ClinicError::InvalidInput(
            "Quantity must be at least 1".to_string(),
        ));
    }
    check_non_negative("Unit price", input.unit_price)?;
    check_non_negative("Tax rate", input.tax_rate)?;

    let discount = match input.discount {
        Some(discount) => discount,
        None => ItemDiscount {
            percentage: membership_percent,
            amount: Decimal::ZERO,
        },
    };
    check_percentage("Discount percentage", discount.percentage)?;
    check_non_negative("Discount amount", discount.amount)?;

    let mut item = LineItem {
        id: Uuid::new_v4(),
        item_type: input.item_type,
        reference: input.reference,
        description: input.description.trim().to_string(),
        quantity: input.quantity,
        unit_price: input.unit_price,
        discount,
        tax_rate: input.tax_rate,
        amount: Decimal::ZERO,
        tax_amount: Decimal::ZERO,
        total: Decimal::ZERO,
    };
    price_item(&mut item);
    Ok(item)
}

/// amount = max(0, gross - percentage discount - flat discount);
/// total = amount + tax.
pub fn price_item(item: &mut LineItem) {
    let gross = item.unit_price * Decimal::from(item.quantity);
    let pct_discount = gross * item.discount.percentage / HUNDRED;
    let amount = (gross - pct_discount - item.discount.amount).max(Decimal::ZERO);

    item.amount = round_money(amount);
    item.tax_amount = round_money(item.amount * item.tax_rate / HUNDRED);
    item.total = item.amount + item.tax_amount;
}

/// Invoice status implied by the settlement, given the current status.
fn derive_status(invoice: &Invoice, settlement: SettlementStatus) -> InvoiceStatus {
    match (invoice.status, settlement) {
        (InvoiceStatus::Cancelled, _) => InvoiceStatus::Cancelled,
        (_, SettlementStatus::Paid) => InvoiceStatus::Paid,
        (InvoiceStatus::Overdue, SettlementStatus::Partial) => InvoiceStatus::Overdue,
        (_, SettlementStatus::Partial) => InvoiceStatus::PartiallyPaid,
        (InvoiceStatus::Paid | InvoiceStatus::PartiallyPaid, SettlementStatus::Unpaid) => {
            if invoice.issued_at.is_some() {
                InvoiceStatus::Sent
            } else {
                InvoiceStatus::Draft
            }
        }
        (current, SettlementStatus::Unpaid) => current,
    }
}

/// Recompute every derived field from items, discount and `amount_paid`.
pub fn recalculate(invoice: &mut Invoice) {
    for item in invoice.items.iter_mut() {
        price_item(item);
    }

    let subtotal: Decimal = invoice.items.iter().map(|item| item.amount).sum();
    let total_tax: Decimal = invoice.items.iter().map(|item| item.tax_amount).sum();

    let pct_discount = subtotal * invoice.discount.percentage / HUNDRED;
    let discounted_base = (subtotal - pct_discount - invoice.discount.amount).max(Decimal::ZERO);

    invoice.subtotal = subtotal;
    invoice.total_tax = total_tax;
    invoice.grand_total = round_whole(discounted_base + total_tax).max(Decimal::ZERO);
    invoice.balance_due = (invoice.grand_total - invoice.amount_paid).max(Decimal::ZERO);

    // Drafts are not payable, so they stay unpaid whatever the total.
    let settlement = if invoice.issued_at.is_some() {
        SettlementStatus::from_amounts(invoice.amount_paid, invoice.grand_total)
    } else {
        SettlementStatus::Unpaid
    };
    invoice.status = derive_status(invoice, settlement);
    invoice.payment_status = settlement;

    tracing::debug!(
        invoice = %invoice.invoice_number,
        subtotal = %invoice.subtotal,
        total_tax = %invoice.total_tax,
        grand_total = %invoice.grand_total,
        balance_due = %invoice.balance_due,
        "invoice recalculated"
    );
}

/// Put an open invoice whose due date has passed back into `overdue`.
pub fn flag_if_past_due(invoice: &mut Invoice, today: NaiveDate) {
    let open = matches!(
        invoice.status,
        InvoiceStatus::Sent | InvoiceStatus::PartiallyPaid
    );
    if open && invoice.due_date.is_some_and(|due| due < today) {
        invoice.status = InvoiceStatus::Overdue;
    }
}

fn ensure_draft(invoice: &Invoice, action: &str) -> Result<(), ClinicError> {
    if invoice.status != InvoiceStatus::Draft {
        return Err(ClinicError::InvalidOperation(format!(
            "Cannot {action}: invoice {} is {}, not draft",
            invoice.invoice_number, invoice.status
        )));
    }
    Ok(())
}

/// Fresh, empty draft invoice.
pub fn new_draft(
    invoice_number: String,
    patient_id: &str,
    clinic_id: &str,
    appointment_id: Option<Uuid>,
    created_by: &str,
    now: DateTime<Utc>,
) -> Invoice {
    let mut invoice = Invoice {
        id: Uuid::new_v4(),
        invoice_number,
        patient_id: patient_id.to_string(),
        clinic_id: clinic_id.to_string(),
        appointment_id,
        items: Vec::new(),
        discount: InvoiceDiscount::default(),
        subtotal: Decimal::ZERO,
        total_tax: Decimal::ZERO,
        grand_total: Decimal::ZERO,
        amount_paid: Decimal::ZERO,
        balance_due: Decimal::ZERO,
        status: InvoiceStatus::Draft,
        payment_status: SettlementStatus::Unpaid,
        due_date: None,
        issued_at: None,
        cancelled_at: None,
        cancellation_reason: None,
        notes: None,
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
    };
    recalculate(&mut invoice);
    invoice
}

pub fn add_item(invoice: &mut Invoice, item: LineItem) -> Result<(), ClinicError> {
    ensure_draft(invoice, "add items")?;
    invoice.items.push(item);
    recalculate(invoice);
    Ok(())
}

pub fn remove_item(invoice: &mut Invoice, item_id: &Uuid) -> Result<LineItem, ClinicError> {
    ensure_draft(invoice, "remove items")?;
    let position = invoice
        .items
        .iter()
        .position(|item| item.id == *item_id)
        .ok_or_else(|| ClinicError::NotFound(format!("Line item {item_id}")))?;
    let removed = invoice.items.remove(position);
    recalculate(invoice);
    Ok(removed)
}

pub fn set_discount(invoice: &mut Invoice, discount: InvoiceDiscount) -> Result<(), ClinicError> {
    ensure_draft(invoice, "change the discount")?;
    check_percentage("Discount percentage", discount.percentage)?;
    check_non_negative("Discount amount", discount.amount)?;
    invoice.discount = discount;
    recalculate(invoice);
    Ok(())
}

/// Header fields editable while the invoice is a draft.
#[derive(Debug, Clone, Default)]
pub struct InvoiceHeaderUpdate {
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub discount: Option<InvoiceDiscount>,
}

pub fn update_header(invoice: &mut Invoice, update: InvoiceHeaderUpdate) -> Result<(), ClinicError> {
    ensure_draft(invoice, "update")?;
    if let Some(discount) = update.discount {
        set_discount(invoice, discount)?;
    }
    if let Some(notes) = update.notes {
        invoice.notes = Some(notes);
    }
    if let Some(due_date) = update.due_date {
        invoice.due_date = Some(due_date);
    }
    recalculate(invoice);
    Ok(())
}

/// draft -> sent. Requires at least one item; sets the due date unless one
/// was already chosen.
pub fn issue(
    invoice: &mut Invoice,
    now: DateTime<Utc>,
    today: NaiveDate,
    due_days: u32,
) -> Result<(), ClinicError> {
    ensure_draft(invoice, "issue")?;
    if invoice.items.is_empty() {
        return Err(ClinicError::InvalidOperation(format!(
            "Invoice {} has no items",
            invoice.invoice_number
        )));
    }
    invoice.status = InvoiceStatus::Sent;
    invoice.issued_at = Some(now);
    if invoice.due_date.is_none() {
        invoice.due_date = today.checked_add_days(Days::new(u64::from(due_days)));
    }
    recalculate(invoice);
    Ok(())
}

/// Cancel an invoice unless it is already cancelled or still holds payments.
pub fn cancel(invoice: &mut Invoice, reason: &str, now: DateTime<Utc>) -> Result<(), ClinicError> {
    if invoice.status == InvoiceStatus::Cancelled {
        return Err(ClinicError::AlreadyCancelled(format!(
            "Invoice {} is already cancelled",
            invoice.invoice_number
        )));
    }
    if invoice.amount_paid > Decimal::ZERO {
        return Err(ClinicError::InvalidOperation(format!(
            "Invoice {} has payments; refund before cancelling",
            invoice.invoice_number
        )));
    }
    invoice.status = InvoiceStatus::Cancelled;
    invoice.cancelled_at = Some(now);
    invoice.cancellation_reason = Some(reason.trim().to_string()).filter(|r| !r.is_empty());
    recalculate(invoice);
    Ok(())
}
