//! Appointment state machine.
//!
//! The legal transition table is data; `transition` is the single place that
//! consults it. The named operations (check-in, start, complete, cancel,
//! reschedule) carry their own precondition sets and side effects, and all of
//! them funnel through `record`, which appends exactly one history entry.
//! Every function validates before it mutates, so a failed call leaves the
//! appointment untouched.

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::ClinicError;
use crate::models::{Appointment, AppointmentStatus, StatusChange};

use AppointmentStatus::*;

/// Legal generic transitions. States not listed have no outgoing edges.
pub const TRANSITIONS: [(AppointmentStatus, &[AppointmentStatus]); 4] = [
    (Scheduled, &[Confirmed, Cancelled]),
    (Confirmed, &[CheckedIn, Cancelled, NoShow]),
    (CheckedIn, &[InProgress, Cancelled]),
    (InProgress, &[Completed]),
];

const CHECK_IN_FROM: &[AppointmentStatus] = &[Scheduled, Confirmed];
const COMPLETE_FROM: &[AppointmentStatus] = &[CheckedIn, InProgress];
const RESCHEDULE_BLOCKED: &[AppointmentStatus] = &[Cancelled, Completed];

/// Who is acting and when.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub actor: &'a str,
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
}

pub fn allowed_next(from: AppointmentStatus) -> &'static [AppointmentStatus] {
    TRANSITIONS
        .iter()
        .find(|(state, _)| *state == from)
        .map(|(_, next)| *next)
        .unwrap_or(&[])
}

pub fn can_transition(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    allowed_next(from).contains(&to)
}

/// Move an appointment along the transition table.
pub fn transition(
    appointment: &mut Appointment,
    to: AppointmentStatus,
    reason: Option<&str>,
    ctx: &TransitionContext<'_>,
) -> Result<StatusChange, ClinicError> {
    let from = appointment.status;
    if from == Cancelled && to == Cancelled {
        return Err(already_cancelled(appointment));
    }
    if !can_transition(from, to) {
        return Err(ClinicError::InvalidTransition { from, to });
    }
    if to == CheckedIn {
        ensure_today(appointment, ctx)?;
    }

    match to {
        CheckedIn => appointment.check_in_time = Some(ctx.now),
        InProgress => appointment.start_time = Some(ctx.now),
        Completed => appointment.end_time = Some(ctx.now),
        Cancelled => appointment.cancellation_reason = reason.map(str::to_string),
        _ => {}
    }
    Ok(record(appointment, to, reason, ctx))
}

/// Register the patient's arrival. Allowed from scheduled or confirmed, on the
/// appointment's own day only.
pub fn check_in(
    appointment: &mut Appointment,
    ctx: &TransitionContext<'_>,
) -> Result<StatusChange, ClinicError> {
    if !CHECK_IN_FROM.contains(&appointment.status) {
        return Err(ClinicError::InvalidOperation(format!(
            "Cannot check in an appointment that is {}",
            appointment.status
        )));
    }
    ensure_today(appointment, ctx)?;

    appointment.check_in_time = Some(ctx.now);
    Ok(record(appointment, CheckedIn, None, ctx))
}

pub fn start(
    appointment: &mut Appointment,
    ctx: &TransitionContext<'_>,
) -> Result<StatusChange, ClinicError> {
    if appointment.status != CheckedIn {
        return Err(ClinicError::InvalidTransition {
            from: appointment.status,
            to: InProgress,
        });
    }
    appointment.start_time = Some(ctx.now);
    Ok(record(appointment, InProgress, None, ctx))
}

/// Close the visit. Clinical notes, if given, are appended to the existing notes.
pub fn complete(
    appointment: &mut Appointment,
    clinical_notes: Option<&str>,
    ctx: &TransitionContext<'_>,
) -> Result<StatusChange, ClinicError> {
    if !COMPLETE_FROM.contains(&appointment.status) {
        return Err(ClinicError::InvalidTransition {
            from: appointment.status,
            to: Completed,
        });
    }

    if let Some(extra) = clinical_notes.map(str::trim).filter(|n| !n.is_empty()) {
        appointment.notes = Some(match appointment.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{extra}"),
            _ => extra.to_string(),
        });
    }
    appointment.end_time = Some(ctx.now);
    Ok(record(appointment, Completed, None, ctx))
}

/// Cancel from any non-terminal state.
pub fn cancel(
    appointment: &mut Appointment,
    reason: Option<&str>,
    ctx: &TransitionContext<'_>,
) -> Result<StatusChange, ClinicError> {
    match appointment.status {
        Cancelled => return Err(already_cancelled(appointment)),
        status if status.is_terminal() => {
            return Err(ClinicError::InvalidTransition {
                from: status,
                to: Cancelled,
            })
        }
        _ => {}
    }

    appointment.cancellation_reason = reason.map(str::to_string);
    Ok(record(appointment, Cancelled, reason, ctx))
}

pub fn mark_no_show(
    appointment: &mut Appointment,
    ctx: &TransitionContext<'_>,
) -> Result<StatusChange, ClinicError> {
    transition(appointment, NoShow, None, ctx)
}

/// Move the appointment to a new slot and put it back to `scheduled`.
///
/// The caller has already reserved the new slot and minted the token for the
/// new date. This is the only path that moves status backwards.
pub fn reschedule(
    appointment: &mut Appointment,
    date: NaiveDate,
    time_slot: &str,
    token_number: u32,
    reason: Option<&str>,
    ctx: &TransitionContext<'_>,
) -> Result<StatusChange, ClinicError> {
    ensure_reschedulable(appointment)?;

    let fallback = format!("Rescheduled to {date} {time_slot}");
    appointment.date = date;
    appointment.time_slot = time_slot.to_string();
    appointment.token_number = token_number;
    appointment.check_in_time = None;
    appointment.start_time = None;
    appointment.end_time = None;
    Ok(record(
        appointment,
        Scheduled,
        Some(reason.unwrap_or(fallback.as_str())),
        ctx,
    ))
}

pub fn ensure_reschedulable(appointment: &Appointment) -> Result<(), ClinicError> {
    if RESCHEDULE_BLOCKED.contains(&appointment.status) {
        return Err(ClinicError::InvalidOperation(format!(
            "Cannot reschedule an appointment that is {}",
            appointment.status
        )));
    }
    Ok(())
}

/// A plain edit may move an appointment only before the visit begins; once
/// the patient is in, moving it means `reschedule`.
pub fn ensure_movable(appointment: &Appointment) -> Result<(), ClinicError> {
    match appointment.status {
        Scheduled | Confirmed => Ok(()),
        other => Err(ClinicError::InvalidOperation(format!(
            "Appointment {} is {other}; reschedule it to change the date or slot",
            appointment.appointment_number
        ))),
    }
}

fn ensure_today(appointment: &Appointment, ctx: &TransitionContext<'_>) -> Result<(), ClinicError> {
    if appointment.date != ctx.today {
        return Err(ClinicError::InvalidOperation(format!(
            "Check-in is only possible on the appointment day ({})",
            appointment.date
        )));
    }
    Ok(())
}

fn already_cancelled(appointment: &Appointment) -> ClinicError {
    ClinicError::AlreadyCancelled(format!(
        "Appointment {} is already cancelled",
        appointment.appointment_number
    ))
}

fn default_reason(status: AppointmentStatus) -> &'static str {
    match status {
        Scheduled => "Appointment scheduled",
        Confirmed => "Appointment confirmed",
        CheckedIn => "Patient checked in",
        InProgress => "Consultation started",
        Completed => "Consultation completed",
        Cancelled => "Appointment cancelled",
        NoShow => "Patient did not attend",
    }
}

/// Set the status and append the matching history entry.
fn record(
    appointment: &mut Appointment,
    status: AppointmentStatus,
    reason: Option<&str>,
    ctx: &TransitionContext<'_>,
) -> StatusChange {
    let reason = reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(default_reason(status));
    let change = StatusChange {
        status,
        reason: reason.to_string(),
        changed_by: ctx.actor.to_string(),
        changed_at: ctx.now,
    };
    appointment.status = status;
    appointment.updated_at = ctx.now;
    appointment.status_history.push(change.clone());
    change
}

/// Build the first history entry for a freshly booked appointment.
pub fn initial_entry(ctx: &TransitionContext<'_>) -> StatusChange {
    StatusChange {
        status: Scheduled,
        reason: default_reason(Scheduled).to_string(),
        changed_by: ctx.actor.to_string(),
        changed_at: ctx.now,
    }
}
