//! Data models for the clinic scheduling and billing core.
//!
//! This module defines the core data structures used throughout the system:
//! - TimeSlot: a bookable interval on a clinic's day grid
//! - Appointment: a booked visit with its status history
//! - Invoice / LineItem: billable documents and their entries
//! - Payment: money received against an invoice or an appointment's OPD fee

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::error::ClinicError;

/// Generates a string-backed enum with `as_str`, `FromStr` and SQLite conversions.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

str_enum!(
    /// Kind of visit. Emergency visits carry a higher OPD fee.
    AppointmentType {
        Regular => "regular",
        Emergency => "emergency",
        FollowUp => "follow_up",
    }
);

str_enum!(
    AppointmentStatus {
        Scheduled => "scheduled",
        Confirmed => "confirmed",
        CheckedIn => "checked_in",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
        NoShow => "no_show",
    }
);

impl AppointmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }
}

str_enum!(
    /// Channel through which the booking arrived.
    AppointmentSource {
        WalkIn => "walk_in",
        Phone => "phone",
        Online => "online",
        App => "app",
    }
);

str_enum!(
    InvoiceStatus {
        Draft => "draft",
        Sent => "sent",
        PartiallyPaid => "partially_paid",
        Paid => "paid",
        Overdue => "overdue",
        Cancelled => "cancelled",
    }
);

str_enum!(
    /// Settlement view of an invoice, derived from amount paid vs grand total.
    SettlementStatus {
        Unpaid => "unpaid",
        Partial => "partial",
        Paid => "paid",
    }
);

impl SettlementStatus {
    /// Derive the settlement status from what has been paid against what is owed.
    /// Nothing owed counts as settled.
    pub fn from_amounts(amount_paid: Decimal, grand_total: Decimal) -> Self {
        if amount_paid >= grand_total {
            SettlementStatus::Paid
        } else if amount_paid <= Decimal::ZERO {
            SettlementStatus::Unpaid
        } else {
            SettlementStatus::Partial
        }
    }
}

str_enum!(
    ItemType {
        Consultation => "consultation",
        Treatment => "treatment",
        Test => "test",
        Medicine => "medicine",
        Membership => "membership",
        Other => "other",
    }
);

str_enum!(
    PaymentMode {
        Cash => "cash",
        Card => "card",
        Upi => "upi",
        Razorpay => "razorpay",
        Netbanking => "netbanking",
        Other => "other",
    }
);

impl PaymentMode {
    pub fn is_gateway(&self) -> bool {
        matches!(self, PaymentMode::Razorpay)
    }
}

str_enum!(
    PaymentStatus {
        Pending => "pending",
        Paid => "paid",
        Failed => "failed",
        Refunded => "refunded",
        Cancelled => "cancelled",
    }
);

/// Parse a slot label such as "09:30".
pub fn parse_slot_label(label: &str) -> Result<NaiveTime, ClinicError> {
    NaiveTime::parse_from_str(label.trim(), "%H:%M").map_err(|_| {
        ClinicError::InvalidInput(format!(
            "Invalid time slot: '{}'. Expected HH:MM",
            label
        ))
    })
}

/// Represents a bookable interval on a clinic's day grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl TimeSlot {
    /// Create a new time slot with validation.
    pub fn new(start_time: NaiveTime, end_time: NaiveTime) -> Result<Self, ClinicError> {
        if end_time <= start_time {
            return Err(ClinicError::InvalidInput(
                "End time must be after start time".to_string(),
            ));
        }
        Ok(TimeSlot {
            start_time,
            end_time,
        })
    }

    /// The label used to book this slot, e.g. "09:30".
    pub fn label(&self) -> String {
        self.start_time.format("%H:%M").to_string()
    }
}

/// One entry in an appointment's append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: AppointmentStatus,
    pub reason: String,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

/// Represents a booked appointment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub appointment_number: String,
    pub patient_id: String,
    pub clinic_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
    pub token_number: u32,
    pub appointment_type: AppointmentType,
    pub status: AppointmentStatus,
    pub reason: String,
    pub notes: Option<String>,
    pub check_in_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub status_history: Vec<StatusChange>,
    pub opd_fee: Decimal,
    pub opd_fee_paid: bool,
    pub source: AppointmentSource,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The entity a line item bills for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BilledEntity {
    #[default]
    None,
    Treatment(String),
    Test(String),
    Appointment(Uuid),
    Membership(String),
}

impl BilledEntity {
    /// Split into the (kind, id) pair used for storage.
    pub fn to_parts(&self) -> (Option<&'static str>, Option<String>) {
        match self {
            BilledEntity::None => (None, None),
            BilledEntity::Treatment(id) => (Some("treatment"), Some(id.clone())),
            BilledEntity::Test(id) => (Some("test"), Some(id.clone())),
            BilledEntity::Appointment(id) => (Some("appointment"), Some(id.to_string())),
            BilledEntity::Membership(id) => (Some("membership"), Some(id.clone())),
        }
    }

    pub fn from_parts(kind: Option<&str>, id: Option<String>) -> Result<Self, DatabaseError> {
        let invalid = |kind: &str| DatabaseError::InvalidEnum {
            field: "BilledEntity".into(),
            value: kind.into(),
        };
        match (kind, id) {
            (None, _) => Ok(BilledEntity::None),
            (Some(kind), None) => Err(invalid(kind)),
            (Some("treatment"), Some(id)) => Ok(BilledEntity::Treatment(id)),
            (Some("test"), Some(id)) => Ok(BilledEntity::Test(id)),
            (Some("membership"), Some(id)) => Ok(BilledEntity::Membership(id)),
            (Some("appointment"), Some(id)) => Uuid::parse_str(&id)
                .map(BilledEntity::Appointment)
                .map_err(|_| DatabaseError::InvalidValue {
                    field: "reference_id".into(),
                    value: id,
                }),
            (Some(kind), Some(_)) => Err(invalid(kind)),
        }
    }
}

/// Per-item discount: percentage first, then a flat amount.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemDiscount {
    pub percentage: Decimal,
    pub amount: Decimal,
}

/// Invoice-level discount applied to the subtotal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvoiceDiscount {
    pub percentage: Decimal,
    pub amount: Decimal,
    pub reason: Option<String>,
}

/// One billable entry on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Uuid,
    pub item_type: ItemType,
    pub reference: BilledEntity,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub discount: ItemDiscount,
    pub tax_rate: Decimal,
    pub amount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub patient_id: String,
    pub clinic_id: String,
    pub appointment_id: Option<Uuid>,
    pub items: Vec<LineItem>,
    pub discount: InvoiceDiscount,
    pub subtotal: Decimal,
    pub total_tax: Decimal,
    pub grand_total: Decimal,
    pub amount_paid: Decimal,
    pub balance_due: Decimal,
    pub status: InvoiceStatus,
    pub payment_status: SettlementStatus,
    pub due_date: Option<NaiveDate>,
    pub issued_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Gateway correlation fields for online payments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GatewayRefs {
    pub order_id: String,
    pub payment_id: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub amount: Decimal,
    pub reason: String,
    pub refund_id: Option<String>,
    pub refunded_by: String,
    pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub payment_number: String,
    pub patient_id: String,
    pub clinic_id: String,
    pub invoice_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub amount: Decimal,
    pub payment_mode: PaymentMode,
    pub status: PaymentStatus,
    pub gateway: Option<GatewayRefs>,
    pub failure_reason: Option<String>,
    pub refund: Option<Refund>,
    pub paid_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn enum_round_trips_through_str() {
        assert_eq!(
            AppointmentStatus::from_str("checked_in").unwrap(),
            AppointmentStatus::CheckedIn
        );
        assert_eq!(AppointmentSource::WalkIn.as_str(), "walk_in");
        assert!(InvoiceStatus::from_str("void").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(AppointmentStatus::Completed.is_terminal());
        assert!(AppointmentStatus::NoShow.is_terminal());
        assert!(!AppointmentStatus::InProgress.is_terminal());
    }

    #[test]
    fn settlement_status_from_amounts() {
        assert_eq!(
            SettlementStatus::from_amounts(dec!(0), dec!(100)),
            SettlementStatus::Unpaid
        );
        assert_eq!(
            SettlementStatus::from_amounts(dec!(40), dec!(100)),
            SettlementStatus::Partial
        );
        assert_eq!(
            SettlementStatus::from_amounts(dec!(100), dec!(100)),
            SettlementStatus::Paid
        );
        assert_eq!(
            SettlementStatus::from_amounts(dec!(0), dec!(0)),
            SettlementStatus::Paid
        );
    }

    #[test]
    fn slot_label_parsing() {
        let t = parse_slot_label("09:30").unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert!(matches!(
            parse_slot_label("9.30am"),
            Err(ClinicError::InvalidInput(_))
        ));
    }

    #[test]
    fn time_slot_validation_and_label() {
        let a = TimeSlot::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        )
        .unwrap();
        assert_eq!(a.label(), "09:00");
        assert!(TimeSlot::new(a.end_time, a.start_time).is_err());
        assert!(TimeSlot::new(a.start_time, a.start_time).is_err());
    }

    #[test]
    fn billed_entity_parts() {
        let id = Uuid::new_v4();
        let entity = BilledEntity::Appointment(id);
        let (kind, raw) = entity.to_parts();
        assert_eq!(kind, Some("appointment"));
        assert_eq!(BilledEntity::from_parts(kind, raw).unwrap(), entity);
        assert_eq!(
            BilledEntity::from_parts(None, None).unwrap(),
            BilledEntity::None
        );
        assert!(BilledEntity::from_parts(Some("invoice"), Some("x".into())).is_err());
    }
}
