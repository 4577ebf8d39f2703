//! Slot reservation.
//!
//! A slot is held by at most one live (non-cancelled) appointment. The check
//! here runs inside the caller's IMMEDIATE transaction, and the partial unique
//! index on `appointments` catches anything that slips past it.

use chrono::NaiveDate;
use rusqlite::Connection;
use uuid::Uuid;

use crate::db::{self, DatabaseError};
use crate::error::ClinicError;
use crate::models::Appointment;

fn unavailable(clinic_id: &str, date: NaiveDate, time_slot: &str) -> ClinicError {
    ClinicError::SlotUnavailable(format!(
        "{time_slot} on {date} is already booked at clinic {clinic_id}"
    ))
}

/// Fail with `SlotUnavailable` if another live appointment holds the slot.
/// `exclude` lets an appointment keep or move within its own slot.
pub fn reserve(
    conn: &Connection,
    clinic_id: &str,
    date: NaiveDate,
    time_slot: &str,
    exclude: Option<&Uuid>,
) -> Result<(), ClinicError> {
    if let Some(holder) = db::find_active_in_slot(conn, clinic_id, date, time_slot, exclude)? {
        tracing::warn!(clinic_id, %date, time_slot, %holder, "slot conflict");
        return Err(unavailable(clinic_id, date, time_slot));
    }
    Ok(())
}

fn is_slot_index_violation(err: &DatabaseError) -> bool {
    err.is_unique_violation()
        && err
            .sqlite_message()
            .map(|msg| msg.contains("appointments.time_slot"))
            .unwrap_or(false)
}

/// Translate a storage error raised while writing `appointment`.
fn slot_error(err: DatabaseError, appointment: &Appointment) -> ClinicError {
    if is_slot_index_violation(&err) {
        tracing::warn!(
            clinic_id = %appointment.clinic_id,
            date = %appointment.date,
            time_slot = %appointment.time_slot,
            "slot conflict caught by index"
        );
        unavailable(&appointment.clinic_id, appointment.date, &appointment.time_slot)
    } else {
        ClinicError::from(err)
    }
}

/// Insert a new appointment whose slot has been reserved.
pub fn insert_reserved(conn: &Connection, appointment: &Appointment) -> Result<(), ClinicError> {
    db::insert_appointment(conn, appointment).map_err(|e| slot_error(e, appointment))
}

/// Persist an appointment that may have moved to a new slot.
pub fn update_reserved(conn: &Connection, appointment: &Appointment) -> Result<(), ClinicError> {
    db::update_appointment(conn, appointment).map_err(|e| slot_error(e, appointment))
}
