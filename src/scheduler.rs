//! Appointment booking and lifecycle service.
//!
//! `AppointmentService` ties the clinic calendar, the slot allocator, the
//! sequence numberer and the lifecycle state machine together. Every mutating
//! call runs in one write transaction, so a rejected request leaves nothing
//! behind.

use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::allocator;
use crate::calendar::DaySchedule;
use crate::clock::Clock;
use crate::collaborators::ClinicDirectory;
use crate::config::Settings;
use crate::db::{self, Database};
use crate::error::{ClinicError, ErrorKind};
use crate::lifecycle::{self, TransitionContext};
use crate::models::{
    parse_slot_label, Appointment, AppointmentSource, AppointmentStatus, AppointmentType,
    StatusChange, TimeSlot,
};
use crate::sequence::{self, SequenceScope};

/// A request to book one appointment.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub patient_id: String,
    pub clinic_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
    pub appointment_type: AppointmentType,
    pub reason: String,
    pub notes: Option<String>,
    /// Overrides the fee derived from the appointment type.
    pub opd_fee: Option<Decimal>,
    pub source: AppointmentSource,
    pub created_by: String,
}

impl BookingRequest {
    pub fn new(
        patient_id: &str,
        clinic_id: &str,
        date: NaiveDate,
        time_slot: &str,
        reason: &str,
    ) -> Self {
        BookingRequest {
            patient_id: patient_id.to_string(),
            clinic_id: clinic_id.to_string(),
            date,
            time_slot: time_slot.to_string(),
            appointment_type: AppointmentType::Regular,
            reason: reason.to_string(),
            notes: None,
            opd_fee: None,
            source: AppointmentSource::WalkIn,
            created_by: "system".to_string(),
        }
    }

    pub fn with_type(mut self, appointment_type: AppointmentType) -> Self {
        self.appointment_type = appointment_type;
        self
    }

    pub fn with_source(mut self, source: AppointmentSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }

    pub fn with_opd_fee(mut self, fee: Decimal) -> Self {
        self.opd_fee = Some(fee);
        self
    }

    pub fn by(mut self, actor: &str) -> Self {
        self.created_by = actor.to_string();
        self
    }
}

/// Editable fields of a live appointment. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct AppointmentUpdate {
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub appointment_type: Option<AppointmentType>,
    pub opd_fee: Option<Decimal>,
    pub date: Option<NaiveDate>,
    pub time_slot: Option<String>,
}

/// One grid slot and whether it can still be booked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotAvailability {
    pub slot: TimeSlot,
    pub label: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub is_open: bool,
    pub reason: Option<String>,
    pub slots: Vec<SlotAvailability>,
}

impl DayAvailability {
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.available).count()
    }
}

/// Result of a booking attempt inside a batch.
#[derive(Debug)]
pub struct BookingResult {
    pub request: BookingRequest,
    pub appointment: Option<Appointment>,
    pub error: Option<ErrorKind>,
    pub message: String,
}

/// Result of booking multiple requests.
#[derive(Debug)]
pub struct BatchBookingResult {
    pub confirmed: Vec<Appointment>,
    pub failed: Vec<BookingResult>,
    pub total_requests: usize,
}

impl BatchBookingResult {
    /// Calculate the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.confirmed.len() as f64 / self.total_requests as f64) * 100.0
    }
}

pub struct AppointmentService {
    db: Arc<Database>,
    clinics: Arc<dyn ClinicDirectory>,
    clock: Arc<dyn Clock>,
    default_opd_fee: Decimal,
    emergency_opd_fee: Decimal,
}

impl AppointmentService {
    pub fn new(
        db: Arc<Database>,
        clinics: Arc<dyn ClinicDirectory>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        AppointmentService {
            db,
            clinics,
            clock,
            default_opd_fee: settings.default_opd_fee,
            emergency_opd_fee: settings.emergency_opd_fee,
        }
    }

    fn context<'a>(&self, actor: &'a str) -> TransitionContext<'a> {
        TransitionContext {
            actor,
            now: self.clock.now(),
            today: self.clock.today(),
        }
    }

    fn fee_for(&self, appointment_type: AppointmentType) -> Decimal {
        match appointment_type {
            AppointmentType::Emergency => self.emergency_opd_fee,
            AppointmentType::Regular | AppointmentType::FollowUp => self.default_opd_fee,
        }
    }

    /// Check that `time_slot` is a bookable grid slot at the clinic on `date`.
    /// Returns the canonical slot label.
    fn validate_slot(
        &self,
        clinic_id: &str,
        date: NaiveDate,
        time_slot: &str,
    ) -> Result<String, ClinicError> {
        parse_slot_label(time_slot)?;
        if date < self.clock.today() {
            return Err(ClinicError::InvalidInput(format!(
                "Cannot book {date}: the date is in the past"
            )));
        }

        let schedule = self.clinics.calendar(clinic_id)?.slots_for(date);
        if !schedule.is_open {
            return Err(ClinicError::InvalidOperation(
                schedule
                    .reason
                    .unwrap_or_else(|| format!("Clinic is closed on {date}")),
            ));
        }
        match schedule.find_slot(time_slot) {
            Some(slot) => Ok(slot.label()),
            None => Err(ClinicError::InvalidInput(format!(
                "{time_slot} is not a valid slot for {date}"
            ))),
        }
    }

    /// Book an appointment: validate against the calendar, reserve the slot,
    /// mint the appointment number and token, and persist.
    pub fn book(&self, request: &BookingRequest) -> Result<Appointment, ClinicError> {
        if request.patient_id.trim().is_empty() {
            return Err(ClinicError::InvalidInput("Patient is required".to_string()));
        }
        if request.reason.trim().is_empty() {
            return Err(ClinicError::InvalidInput(
                "Reason for visit is required".to_string(),
            ));
        }
        let opd_fee = request
            .opd_fee
            .unwrap_or_else(|| self.fee_for(request.appointment_type));
        if opd_fee < Decimal::ZERO {
            return Err(ClinicError::InvalidInput(
                "OPD fee cannot be negative".to_string(),
            ));
        }

        let label = self.validate_slot(&request.clinic_id, request.date, &request.time_slot)?;
        let clinic_code = self.clinics.clinic_code(&request.clinic_id)?;
        let ctx = self.context(&request.created_by);

        let appointment = self.db.write(|tx| {
            allocator::reserve(tx, &request.clinic_id, request.date, &label, None)?;

            let number_scope = SequenceScope::Appointment {
                clinic_code: clinic_code.clone(),
                month: ctx.today,
            };
            let appointment_number = sequence::next_number(tx, &number_scope)?;
            let token_number = sequence::next_token(tx, &request.clinic_id, request.date)?;

            let appointment = Appointment {
                id: Uuid::new_v4(),
                appointment_number,
                patient_id: request.patient_id.trim().to_string(),
                clinic_id: request.clinic_id.clone(),
                date: request.date,
                time_slot: label.clone(),
                token_number,
                appointment_type: request.appointment_type,
                status: AppointmentStatus::Scheduled,
                reason: request.reason.trim().to_string(),
                notes: request.notes.clone(),
                check_in_time: None,
                start_time: None,
                end_time: None,
                cancellation_reason: None,
                status_history: vec![lifecycle::initial_entry(&ctx)],
                opd_fee,
                opd_fee_paid: false,
                source: request.source,
                created_by: request.created_by.clone(),
                created_at: ctx.now,
                updated_at: ctx.now,
            };
            allocator::insert_reserved(tx, &appointment)?;
            Ok::<_, ClinicError>(appointment)
        })?;

        tracing::info!(
            appointment = %appointment.appointment_number,
            clinic_id = %appointment.clinic_id,
            date = %appointment.date,
            time_slot = %appointment.time_slot,
            token = appointment.token_number,
            "appointment booked"
        );
        Ok(appointment)
    }

    /// Book a batch of requests, emergencies first, otherwise in the order given.
    pub fn book_batch(&self, requests: Vec<BookingRequest>) -> BatchBookingResult {
        let total_requests = requests.len();
        let mut ordered = requests;
        ordered.sort_by_key(|r| r.appointment_type != AppointmentType::Emergency);

        let mut confirmed = Vec::new();
        let mut failed = Vec::new();
        for request in ordered {
            match self.book(&request) {
                Ok(appointment) => confirmed.push(appointment),
                Err(err) => failed.push(BookingResult {
                    message: err.to_string(),
                    error: Some(err.kind()),
                    appointment: None,
                    request,
                }),
            }
        }

        BatchBookingResult {
            confirmed,
            failed,
            total_requests,
        }
    }

    pub fn get(&self, id: &Uuid) -> Result<Appointment, ClinicError> {
        self.db
            .read(|conn| db::require_appointment(conn, id).map_err(ClinicError::from))
    }

    /// Edit a live appointment. Moving it re-runs the allocator against its
    /// own slot; changing the date re-derives the token. Status is untouched,
    /// so moves are refused once the patient has checked in.
    pub fn update(
        &self,
        id: &Uuid,
        update: AppointmentUpdate,
        actor: &str,
    ) -> Result<Appointment, ClinicError> {
        let current = self.get(id)?;
        if current.status.is_terminal() {
            return Err(ClinicError::InvalidOperation(format!(
                "Appointment {} is {} and can no longer be changed",
                current.appointment_number, current.status
            )));
        }

        let date = update.date.unwrap_or(current.date);
        let moving = update.date.is_some() || update.time_slot.is_some();
        if moving {
            lifecycle::ensure_movable(&current)?;
        }
        let label = match (&update.time_slot, moving) {
            (_, false) => current.time_slot.clone(),
            (Some(slot), true) => self.validate_slot(&current.clinic_id, date, slot)?,
            (None, true) => self.validate_slot(&current.clinic_id, date, &current.time_slot)?,
        };
        if let Some(reason) = &update.reason {
            if reason.trim().is_empty() {
                return Err(ClinicError::InvalidInput(
                    "Reason for visit is required".to_string(),
                ));
            }
        }
        if update.opd_fee.map(|fee| fee < Decimal::ZERO).unwrap_or(false) {
            return Err(ClinicError::InvalidInput(
                "OPD fee cannot be negative".to_string(),
            ));
        }
        let now = self.clock.now();

        let appointment = self.db.write(|tx| {
            let mut appt = db::require_appointment(tx, id)?;
            if appt.status.is_terminal() {
                return Err(ClinicError::InvalidOperation(format!(
                    "Appointment {} is {} and can no longer be changed",
                    appt.appointment_number, appt.status
                )));
            }

            if moving {
                lifecycle::ensure_movable(&appt)?;
                allocator::reserve(tx, &appt.clinic_id, date, &label, Some(&appt.id))?;
                if date != appt.date {
                    appt.token_number = sequence::next_token(tx, &appt.clinic_id, date)?;
                }
                appt.date = date;
                appt.time_slot = label.clone();
            }
            if let Some(reason) = &update.reason {
                appt.reason = reason.trim().to_string();
            }
            if let Some(notes) = &update.notes {
                appt.notes = Some(notes.clone());
            }
            if let Some(appointment_type) = update.appointment_type {
                appt.appointment_type = appointment_type;
            }
            if let Some(fee) = update.opd_fee {
                appt.opd_fee = fee;
            }
            appt.updated_at = now;

            allocator::update_reserved(tx, &appt)?;
            Ok(appt)
        })?;

        tracing::info!(appointment = %appointment.appointment_number, actor, "appointment updated");
        Ok(appointment)
    }

    /// Load, apply one lifecycle operation, persist the row and its new
    /// history entry. The operation sees the transaction so it can reserve
    /// slots or mint tokens atomically with the change.
    fn apply<F>(&self, id: &Uuid, actor: &str, op: F) -> Result<Appointment, ClinicError>
    where
        F: FnOnce(
            &Connection,
            &mut Appointment,
            &TransitionContext<'_>,
        ) -> Result<StatusChange, ClinicError>,
    {
        let ctx = self.context(actor);
        let appointment = self.db.write(|tx| {
            let conn: &Connection = tx;
            let mut appt = db::require_appointment(conn, id)?;
            let change = op(conn, &mut appt, &ctx)?;
            allocator::update_reserved(conn, &appt)?;
            db::append_status_change(conn, &appt.id, &change)?;
            Ok::<_, ClinicError>(appt)
        });

        match &appointment {
            Ok(appt) => tracing::info!(
                appointment = %appt.appointment_number,
                status = %appt.status,
                actor,
                "appointment status changed"
            ),
            Err(err) => tracing::debug!(%id, error = %err, "appointment operation rejected"),
        }
        appointment
    }

    /// Generic transition along the status table.
    pub fn transition_status(
        &self,
        id: &Uuid,
        to: AppointmentStatus,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<Appointment, ClinicError> {
        self.apply(id, actor, |_, appt, ctx| {
            lifecycle::transition(appt, to, reason, ctx)
        })
    }

    pub fn confirm(&self, id: &Uuid, actor: &str) -> Result<Appointment, ClinicError> {
        self.transition_status(id, AppointmentStatus::Confirmed, None, actor)
    }

    pub fn check_in(&self, id: &Uuid, actor: &str) -> Result<Appointment, ClinicError> {
        self.apply(id, actor, |_, appt, ctx| lifecycle::check_in(appt, ctx))
    }

    pub fn start(&self, id: &Uuid, actor: &str) -> Result<Appointment, ClinicError> {
        self.apply(id, actor, |_, appt, ctx| lifecycle::start(appt, ctx))
    }

    pub fn complete(
        &self,
        id: &Uuid,
        clinical_notes: Option<&str>,
        actor: &str,
    ) -> Result<Appointment, ClinicError> {
        self.apply(id, actor, |_, appt, ctx| {
            lifecycle::complete(appt, clinical_notes, ctx)
        })
    }

    pub fn cancel(
        &self,
        id: &Uuid,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<Appointment, ClinicError> {
        self.apply(id, actor, |_, appt, ctx| lifecycle::cancel(appt, reason, ctx))
    }

    pub fn mark_no_show(&self, id: &Uuid, actor: &str) -> Result<Appointment, ClinicError> {
        self.apply(id, actor, |_, appt, ctx| lifecycle::mark_no_show(appt, ctx))
    }

    /// Move to a new slot and reset to `scheduled`. The token is re-derived
    /// when the date changes.
    pub fn reschedule(
        &self,
        id: &Uuid,
        date: NaiveDate,
        time_slot: &str,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<Appointment, ClinicError> {
        let current = self.get(id)?;
        lifecycle::ensure_reschedulable(&current)?;
        let label = self.validate_slot(&current.clinic_id, date, time_slot)?;

        self.apply(id, actor, |conn, appt, ctx| {
            lifecycle::ensure_reschedulable(appt)?;
            allocator::reserve(conn, &appt.clinic_id, date, &label, Some(&appt.id))?;
            let token = if date != appt.date {
                sequence::next_token(conn, &appt.clinic_id, date)?
            } else {
                appt.token_number
            };
            lifecycle::reschedule(appt, date, &label, token, reason, ctx)
        })
    }

    /// Calendar grid for a clinic day, with taken slots marked unavailable.
    pub fn available_slots(
        &self,
        clinic_id: &str,
        date: NaiveDate,
    ) -> Result<DayAvailability, ClinicError> {
        let schedule: DaySchedule = self.clinics.calendar(clinic_id)?.slots_for(date);
        let booked: Vec<String> = self.db.read(|conn| {
            db::list_active_for_day(conn, clinic_id, date)
                .map(|appts| appts.into_iter().map(|a| a.time_slot).collect())
                .map_err(ClinicError::from)
        })?;

        let slots = schedule
            .slots
            .iter()
            .map(|slot| {
                let label = slot.label();
                SlotAvailability {
                    slot: *slot,
                    available: !booked.contains(&label),
                    label,
                }
            })
            .collect();

        Ok(DayAvailability {
            date,
            is_open: schedule.is_open,
            reason: schedule.reason,
            slots,
        })
    }

    /// Live appointments for the day in token order.
    pub fn day_queue(
        &self,
        clinic_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, ClinicError> {
        self.db.read(|conn| {
            db::list_active_for_day(conn, clinic_id, date).map_err(ClinicError::from)
        })
    }
}
