use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{decimal_at, decimal_text, uuid_at};
use crate::db::DatabaseError;
use crate::models::{Appointment, AppointmentStatus, StatusChange};

const APPOINTMENT_COLUMNS: &str = "id, appointment_number, patient_id, clinic_id, date, time_slot,
    token_number, appointment_type, status, reason, notes, check_in_time, start_time, end_time,
    cancellation_reason, opd_fee, opd_fee_paid, source, created_by, created_at, updated_at";

fn appointment_from_row(row: &Row<'_>) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        id: uuid_at(row, 0)?,
        appointment_number: row.get(1)?,
        patient_id: row.get(2)?,
        clinic_id: row.get(3)?,
        date: row.get(4)?,
        time_slot: row.get(5)?,
        token_number: row.get(6)?,
        appointment_type: row.get(7)?,
        status: row.get(8)?,
        reason: row.get(9)?,
        notes: row.get(10)?,
        check_in_time: row.get(11)?,
        start_time: row.get(12)?,
        end_time: row.get(13)?,
        cancellation_reason: row.get(14)?,
        status_history: Vec::new(),
        opd_fee: decimal_at(row, 15)?,
        opd_fee_paid: row.get(16)?,
        source: row.get(17)?,
        created_by: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

/// Insert a new appointment together with its initial history entries.
pub fn insert_appointment(conn: &Connection, appt: &Appointment) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO appointments
         (id, appointment_number, patient_id, clinic_id, date, time_slot, token_number,
          appointment_type, status, reason, notes, check_in_time, start_time, end_time,
          cancellation_reason, opd_fee, opd_fee_paid, source, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21)",
        params![
            appt.id.to_string(),
            appt.appointment_number,
            appt.patient_id,
            appt.clinic_id,
            appt.date,
            appt.time_slot,
            appt.token_number,
            appt.appointment_type,
            appt.status,
            appt.reason,
            appt.notes,
            appt.check_in_time,
            appt.start_time,
            appt.end_time,
            appt.cancellation_reason,
            decimal_text(&appt.opd_fee),
            appt.opd_fee_paid,
            appt.source,
            appt.created_by,
            appt.created_at,
            appt.updated_at,
        ],
    )?;

    for change in &appt.status_history {
        append_status_change(conn, &appt.id, change)?;
    }
    Ok(())
}

/// Rewrite the mutable columns of an appointment. History is appended separately.
pub fn update_appointment(conn: &Connection, appt: &Appointment) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE appointments SET
            date = ?2, time_slot = ?3, token_number = ?4, appointment_type = ?5, status = ?6,
            reason = ?7, notes = ?8, check_in_time = ?9, start_time = ?10, end_time = ?11,
            cancellation_reason = ?12, opd_fee = ?13, opd_fee_paid = ?14, updated_at = ?15
         WHERE id = ?1",
        params![
            appt.id.to_string(),
            appt.date,
            appt.time_slot,
            appt.token_number,
            appt.appointment_type,
            appt.status,
            appt.reason,
            appt.notes,
            appt.check_in_time,
            appt.start_time,
            appt.end_time,
            appt.cancellation_reason,
            decimal_text(&appt.opd_fee),
            appt.opd_fee_paid,
            appt.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("Appointment", appt.id));
    }
    Ok(())
}

pub fn append_status_change(
    conn: &Connection,
    appointment_id: &Uuid,
    change: &StatusChange,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO appointment_status_history
         (appointment_id, status, reason, changed_by, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            appointment_id.to_string(),
            change.status,
            change.reason,
            change.changed_by,
            change.changed_at,
        ],
    )?;
    Ok(())
}

fn load_history(conn: &Connection, appointment_id: &Uuid) -> Result<Vec<StatusChange>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT status, reason, changed_by, changed_at
         FROM appointment_status_history
         WHERE appointment_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![appointment_id.to_string()], |row| {
        Ok(StatusChange {
            status: row.get(0)?,
            reason: row.get(1)?,
            changed_by: row.get(2)?,
            changed_at: row.get(3)?,
        })
    })?;

    let mut history = Vec::new();
    for row in rows {
        history.push(row?);
    }
    Ok(history)
}

pub fn get_appointment(conn: &Connection, id: &Uuid) -> Result<Option<Appointment>, DatabaseError> {
    let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1");
    let appt = conn
        .query_row(&sql, params![id.to_string()], appointment_from_row)
        .optional()?;

    match appt {
        Some(mut appt) => {
            appt.status_history = load_history(conn, &appt.id)?;
            Ok(Some(appt))
        }
        None => Ok(None),
    }
}

pub fn require_appointment(conn: &Connection, id: &Uuid) -> Result<Appointment, DatabaseError> {
    get_appointment(conn, id)?.ok_or_else(|| DatabaseError::not_found("Appointment", id))
}

/// Id of the live (non-cancelled) appointment holding a slot, ignoring `exclude`.
pub fn find_active_in_slot(
    conn: &Connection,
    clinic_id: &str,
    date: NaiveDate,
    time_slot: &str,
    exclude: Option<&Uuid>,
) -> Result<Option<Uuid>, DatabaseError> {
    let exclude = exclude.map(|id| id.to_string()).unwrap_or_default();
    let found = conn
        .query_row(
            "SELECT id FROM appointments
             WHERE clinic_id = ?1 AND date = ?2 AND time_slot = ?3
               AND status <> ?4 AND id <> ?5
             LIMIT 1",
            params![
                clinic_id,
                date,
                time_slot,
                AppointmentStatus::Cancelled,
                exclude
            ],
            |row| uuid_at(row, 0),
        )
        .optional()?;
    Ok(found)
}

/// Live appointments for a clinic day, in queue order.
pub fn list_active_for_day(
    conn: &Connection,
    clinic_id: &str,
    date: NaiveDate,
) -> Result<Vec<Appointment>, DatabaseError> {
    let sql = format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE clinic_id = ?1 AND date = ?2 AND status <> ?3
         ORDER BY token_number ASC, time_slot ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![clinic_id, date, AppointmentStatus::Cancelled],
        appointment_from_row,
    )?;

    let mut appointments = Vec::new();
    for row in rows {
        let mut appt = row?;
        appt.status_history = load_history(conn, &appt.id)?;
        appointments.push(appt);
    }
    Ok(appointments)
}

/// Highest token held by a live appointment on the day, 0 if none.
pub fn max_active_token_for_day(
    conn: &Connection,
    clinic_id: &str,
    date: NaiveDate,
) -> Result<i64, DatabaseError> {
    let max = conn.query_row(
        "SELECT COALESCE(MAX(token_number), 0) FROM appointments
         WHERE clinic_id = ?1 AND date = ?2 AND status <> ?3",
        params![clinic_id, date, AppointmentStatus::Cancelled],
        |row| row.get(0),
    )?;
    Ok(max)
}

/// Highest serial already minted under `prefix`, 0 if none.
pub fn max_appointment_serial(conn: &Connection, prefix: &str) -> Result<i64, DatabaseError> {
    let max = conn.query_row(
        "SELECT COALESCE(MAX(CAST(substr(appointment_number, length(?1) + 1) AS INTEGER)), 0)
         FROM appointments WHERE substr(appointment_number, 1, length(?1)) = ?1",
        params![prefix],
        |row| row.get(0),
    )?;
    Ok(max)
}

pub fn set_opd_fee_paid(
    conn: &Connection,
    id: &Uuid,
    paid: bool,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE appointments SET opd_fee_paid = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), paid, now],
    )?;
    if changed == 0 {
        return Err(DatabaseError::not_found("Appointment", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::{AppointmentSource, AppointmentType};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn make_appointment(slot: &str, number: &str) -> Appointment {
        let now = Utc.with_ymd_and_hms(2026, 11, 2, 8, 0, 0).unwrap();
        Appointment {
            id: Uuid::new_v4(),
            appointment_number: number.to_string(),
            patient_id: "P1".to_string(),
            clinic_id: "c1".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            time_slot: slot.to_string(),
            token_number: 1,
            appointment_type: AppointmentType::Regular,
            status: AppointmentStatus::Scheduled,
            reason: "Cleaning".to_string(),
            notes: None,
            check_in_time: None,
            start_time: None,
            end_time: None,
            cancellation_reason: None,
            status_history: vec![StatusChange {
                status: AppointmentStatus::Scheduled,
                reason: "Appointment scheduled".to_string(),
                changed_by: "reception".to_string(),
                changed_at: now,
            }],
            opd_fee: Decimal::from(300),
            opd_fee_paid: false,
            source: AppointmentSource::WalkIn,
            created_by: "reception".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn appointment_insert_and_retrieve() {
        let conn = open_memory_database().unwrap();
        let appt = make_appointment("09:00", "SD-2611-0001");
        insert_appointment(&conn, &appt).unwrap();

        let loaded = require_appointment(&conn, &appt.id).unwrap();
        assert_eq!(loaded.appointment_number, "SD-2611-0001");
        assert_eq!(loaded.status, AppointmentStatus::Scheduled);
        assert_eq!(loaded.opd_fee, Decimal::from(300));
        assert_eq!(loaded.status_history.len(), 1);
        assert_eq!(loaded.created_at, appt.created_at);
    }

    #[test]
    fn missing_appointment_is_not_found() {
        let conn = open_memory_database().unwrap();
        let err = require_appointment(&conn, &Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn unique_index_rejects_second_live_booking() {
        let conn = open_memory_database().unwrap();
        insert_appointment(&conn, &make_appointment("09:00", "SD-2611-0001")).unwrap();
        let err = insert_appointment(&conn, &make_appointment("09:00", "SD-2611-0002")).unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn cancelled_booking_frees_the_slot() {
        let conn = open_memory_database().unwrap();
        let mut first = make_appointment("09:00", "SD-2611-0001");
        insert_appointment(&conn, &first).unwrap();
        first.status = AppointmentStatus::Cancelled;
        update_appointment(&conn, &first).unwrap();

        let slot_date = first.date;
        assert!(find_active_in_slot(&conn, "c1", slot_date, "09:00", None)
            .unwrap()
            .is_none());
        insert_appointment(&conn, &make_appointment("09:00", "SD-2611-0002")).unwrap();
        assert_eq!(max_active_token_for_day(&conn, "c1", slot_date).unwrap(), 1);
    }

    #[test]
    fn exclude_ignores_the_appointment_itself() {
        let conn = open_memory_database().unwrap();
        let appt = make_appointment("10:00", "SD-2611-0001");
        insert_appointment(&conn, &appt).unwrap();
        let found = find_active_in_slot(&conn, "c1", appt.date, "10:00", Some(&appt.id)).unwrap();
        assert!(found.is_none());
        let found = find_active_in_slot(&conn, "c1", appt.date, "10:00", None).unwrap();
        assert_eq!(found, Some(appt.id));
    }

    #[test]
    fn status_history_is_append_only() {
        let conn = open_memory_database().unwrap();
        let appt = make_appointment("11:00", "SD-2611-0001");
        insert_appointment(&conn, &appt).unwrap();
        let result = conn.execute("DELETE FROM appointment_status_history", []);
        assert!(result.is_err());
        let result = conn.execute("UPDATE appointment_status_history SET reason = 'x'", []);
        assert!(result.is_err());
    }

    #[test]
    fn max_serial_only_matches_scope() {
        let conn = open_memory_database().unwrap();
        insert_appointment(&conn, &make_appointment("09:00", "SD-2611-0001")).unwrap();
        insert_appointment(&conn, &make_appointment("09:30", "SD-2611-0007")).unwrap();
        insert_appointment(&conn, &make_appointment("10:00", "SD-2612-0012")).unwrap();
        assert_eq!(max_appointment_serial(&conn, "SD-2611-").unwrap(), 7);
        assert_eq!(max_appointment_serial(&conn, "XY-2611-").unwrap(), 0);
    }
}
