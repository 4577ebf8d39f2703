//! Human-readable serial numbers and same-day queue tokens.
//!
//! Every scope owns a row in `sequence_counters`, advanced atomically inside
//! the caller's write transaction. The first time a scope is used its counter
//! is seeded from the highest serial already stored in that scope.

use chrono::NaiveDate;
use rusqlite::Connection;

use crate::db::{self, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SequenceScope {
    /// `{clinicCode}-{YY}{MM}-{serial:04}`, per clinic and month.
    Appointment { clinic_code: String, month: NaiveDate },
    /// `INV-{YY}{MM}-{serial:04}`, global per month.
    Invoice { month: NaiveDate },
    /// `PAY-{YY}{MM}-{serial:04}`, global per month.
    Payment { month: NaiveDate },
    /// `TST-{YY}{MM}-{serial:04}`, global per month.
    Test { month: NaiveDate },
    /// `RPT-{YY}{MM}-{serial:04}`, global per month.
    Report { month: NaiveDate },
    /// Plain 1-based queue position, per clinic and day.
    Token { clinic_id: String, date: NaiveDate },
}

fn yymm(date: &NaiveDate) -> String {
    date.format("%y%m").to_string()
}

impl SequenceScope {
    /// Number prefix including the trailing dash, `None` for tokens.
    pub fn prefix(&self) -> Option<String> {
        match self {
            SequenceScope::Appointment { clinic_code, month } => {
                Some(format!("{}-{}-", clinic_code, yymm(month)))
            }
            SequenceScope::Invoice { month } => Some(format!("INV-{}-", yymm(month))),
            SequenceScope::Payment { month } => Some(format!("PAY-{}-", yymm(month))),
            SequenceScope::Test { month } => Some(format!("TST-{}-", yymm(month))),
            SequenceScope::Report { month } => Some(format!("RPT-{}-", yymm(month))),
            SequenceScope::Token { .. } => None,
        }
    }

    /// Key of the counter row backing this scope.
    pub fn counter_key(&self) -> String {
        match self {
            SequenceScope::Appointment { .. } => {
                format!("appointment:{}", self.prefix().unwrap_or_default())
            }
            SequenceScope::Invoice { .. }
            | SequenceScope::Payment { .. }
            | SequenceScope::Test { .. }
            | SequenceScope::Report { .. } => {
                format!("serial:{}", self.prefix().unwrap_or_default())
            }
            SequenceScope::Token { clinic_id, date } => format!("token:{clinic_id}:{date}"),
        }
    }

    /// Highest serial already stored in this scope. Gaps in the stored
    /// numbers do not matter: the counter resumes after the largest.
    fn highest_existing(&self, conn: &Connection) -> Result<i64, DatabaseError> {
        let prefix = self.prefix().unwrap_or_default();
        match self {
            SequenceScope::Appointment { .. } => db::max_appointment_serial(conn, &prefix),
            SequenceScope::Invoice { .. } => db::max_invoice_serial(conn, &prefix),
            SequenceScope::Payment { .. } => db::max_payment_serial(conn, &prefix),
            // Test and report records live outside this store.
            SequenceScope::Test { .. } | SequenceScope::Report { .. } => Ok(0),
            SequenceScope::Token { clinic_id, date } => {
                db::max_active_token_for_day(conn, clinic_id, *date)
            }
        }
    }

    pub fn format(&self, serial: i64) -> String {
        match self.prefix() {
            Some(prefix) => format!("{prefix}{serial:04}"),
            None => serial.to_string(),
        }
    }
}

/// Advance the scope's counter and return the new serial.
pub fn next_serial(conn: &Connection, scope: &SequenceScope) -> Result<i64, DatabaseError> {
    let key = scope.counter_key();
    let seed = match db::current_counter(conn, &key)? {
        Some(_) => 0,
        None => scope.highest_existing(conn)?,
    };
    let serial = db::advance_counter(conn, &key, seed)?;
    tracing::debug!(scope = %key, serial, "sequence advanced");
    Ok(serial)
}

/// Mint the next formatted number for the scope.
pub fn next_number(conn: &Connection, scope: &SequenceScope) -> Result<String, DatabaseError> {
    Ok(scope.format(next_serial(conn, scope)?))
}

/// Next queue token for a clinic day.
pub fn next_token(
    conn: &Connection,
    clinic_id: &str,
    date: NaiveDate,
) -> Result<u32, DatabaseError> {
    let scope = SequenceScope::Token {
        clinic_id: clinic_id.to_string(),
        date,
    };
    let serial = next_serial(conn, &scope)?;
    u32::try_from(serial).map_err(|_| DatabaseError::InvalidValue {
        field: "token_number".into(),
        value: serial.to_string(),
    })
}
