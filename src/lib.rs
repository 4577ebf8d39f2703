//! Appointment scheduling and billing core for a dental clinic network.
//!
//! The crate is organised around two services:
//! - `scheduler::AppointmentService`: booking, rescheduling and the visit lifecycle
//! - `billing::BillingService`: invoices, payments, gateway orders and refunds
//!
//! Both persist through `db::Database`, a single SQLite connection whose write
//! transactions serialize slot reservation, numbering and payment capture.

pub mod allocator;
pub mod billing;
pub mod calendar;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod invoice;
pub mod lifecycle;
pub mod models;
pub mod payment;
pub mod scheduler;
pub mod sequence;

pub use billing::{BillingService, NewInvoice, PaymentReceipt, PaymentRequest, WebhookOutcome};
pub use config::Settings;
pub use db::Database;
pub use error::{ClinicError, ErrorKind};
pub use scheduler::{AppointmentService, BookingRequest};
