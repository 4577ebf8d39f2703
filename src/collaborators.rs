//! Interfaces to the systems this core consumes from, with in-process
//! implementations used by the binary and the tests.
//!
//! - membership plans: discount percentage for a patient
//! - clinic configuration: operating hours, holidays, clinic code
//! - payment gateway: order creation, signature verification, refunds

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::calendar::{ClinicCalendar, Holiday, WeeklyHours};
use crate::clock::Clock;
use crate::error::ClinicError;
use crate::payment;

pub trait MembershipLookup: Send + Sync {
    fn has_membership(&self, patient_id: &str) -> bool;

    /// Discount percentage of the patient's active plan, zero if none or expired.
    fn current_discount_percent(&self, patient_id: &str) -> Decimal;
}

pub trait ClinicDirectory: Send + Sync {
    fn operating_hours(&self, clinic_id: &str) -> Result<WeeklyHours, ClinicError>;

    fn holidays(&self, clinic_id: &str) -> Result<Vec<Holiday>, ClinicError>;

    fn clinic_code(&self, clinic_id: &str) -> Result<String, ClinicError>;

    fn slot_minutes(&self, clinic_id: &str) -> Result<u32, ClinicError>;

    /// Assemble the calendar for a clinic from its configuration.
    fn calendar(&self, clinic_id: &str) -> Result<ClinicCalendar, ClinicError> {
        ClinicCalendar::new(
            self.operating_hours(clinic_id)?,
            self.holidays(clinic_id)?,
            self.slot_minutes(clinic_id)?,
        )
    }
}

pub trait PaymentGateway: Send + Sync {
    fn create_order(
        &self,
        amount_minor_units: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<String, ClinicError>;

    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    fn refund(&self, gateway_payment_id: &str, amount_minor_units: i64)
        -> Result<String, ClinicError>;
}

// ─── Membership ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MembershipPlan {
    pub plan_code: String,
    pub discount_percent: Decimal,
    pub expires_on: NaiveDate,
}

/// Membership registry held in memory; expiry is judged against the clock.
pub struct InMemoryMemberships {
    plans: RwLock<HashMap<String, MembershipPlan>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMemberships {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InMemoryMemberships {
            plans: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn enroll(&self, patient_id: &str, plan: MembershipPlan) {
        if let Ok(mut plans) = self.plans.write() {
            plans.insert(patient_id.to_string(), plan);
        }
    }

    fn active_plan(&self, patient_id: &str) -> Option<MembershipPlan> {
        let today = self.clock.today();
        self.plans
            .read()
            .ok()?
            .get(patient_id)
            .filter(|plan| plan.expires_on >= today)
            .cloned()
    }
}

impl MembershipLookup for InMemoryMemberships {
    fn has_membership(&self, patient_id: &str) -> bool {
        self.active_plan(patient_id).is_some()
    }

    fn current_discount_percent(&self, patient_id: &str) -> Decimal {
        self.active_plan(patient_id)
            .map(|plan| plan.discount_percent)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Lookup for deployments without membership plans.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemberships;

impl MembershipLookup for NoMemberships {
    fn has_membership(&self, _patient_id: &str) -> bool {
        false
    }

    fn current_discount_percent(&self, _patient_id: &str) -> Decimal {
        Decimal::ZERO
    }
}

// ─── Clinic configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClinicProfile {
    pub clinic_id: String,
    pub code: String,
    pub name: String,
    pub hours: WeeklyHours,
    pub holidays: Vec<Holiday>,
    pub slot_minutes: u32,
}

#[derive(Default)]
pub struct InMemoryClinicDirectory {
    clinics: RwLock<HashMap<String, ClinicProfile>>,
}

impl InMemoryClinicDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a clinic. Clinic codes are unique across the directory.
    pub fn register(&self, profile: ClinicProfile) -> Result<(), ClinicError> {
        if profile.code.trim().is_empty() {
            return Err(ClinicError::InvalidInput(
                "Clinic code cannot be empty".to_string(),
            ));
        }
        let mut clinics = self
            .clinics
            .write()
            .map_err(|_| ClinicError::Internal("clinic directory lock poisoned".to_string()))?;
        let duplicate = clinics
            .values()
            .any(|c| c.code == profile.code && c.clinic_id != profile.clinic_id);
        if duplicate {
            return Err(ClinicError::Conflict(format!(
                "Clinic code '{}' is already in use",
                profile.code
            )));
        }
        clinics.insert(profile.clinic_id.clone(), profile);
        Ok(())
    }

    fn with_clinic<T>(
        &self,
        clinic_id: &str,
        f: impl FnOnce(&ClinicProfile) -> T,
    ) -> Result<T, ClinicError> {
        let clinics = self
            .clinics
            .read()
            .map_err(|_| ClinicError::Internal("clinic directory lock poisoned".to_string()))?;
        clinics
            .get(clinic_id)
            .map(f)
            .ok_or_else(|| ClinicError::NotFound(format!("Clinic {clinic_id}")))
    }
}

impl ClinicDirectory for InMemoryClinicDirectory {
    fn operating_hours(&self, clinic_id: &str) -> Result<WeeklyHours, ClinicError> {
        self.with_clinic(clinic_id, |c| c.hours.clone())
    }

    fn holidays(&self, clinic_id: &str) -> Result<Vec<Holiday>, ClinicError> {
        self.with_clinic(clinic_id, |c| c.holidays.clone())
    }

    fn clinic_code(&self, clinic_id: &str) -> Result<String, ClinicError> {
        self.with_clinic(clinic_id, |c| c.code.clone())
    }

    fn slot_minutes(&self, clinic_id: &str) -> Result<u32, ClinicError> {
        self.with_clinic(clinic_id, |c| c.slot_minutes)
    }
}

// ─── Payment gateway ──────────────────────────────────────────────────────────

/// Razorpay-style gateway whose signatures are HMAC-SHA256 over
/// `orderId|paymentId` with the shared key secret.
///
/// Orders and refunds are minted locally; the HTTP transport to the real
/// processor lives outside this crate.
pub struct SignedOrderGateway {
    key_secret: String,
}

impl SignedOrderGateway {
    pub fn new(key_secret: impl Into<String>) -> Self {
        SignedOrderGateway {
            key_secret: key_secret.into(),
        }
    }

    /// Produce the signature the gateway would attach to a captured payment.
    pub fn sign(&self, order_id: &str, payment_id: &str) -> Result<String, ClinicError> {
        payment::gateway_signature(&self.key_secret, order_id, payment_id)
    }
}

impl PaymentGateway for SignedOrderGateway {
    fn create_order(
        &self,
        amount_minor_units: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<String, ClinicError> {
        if amount_minor_units <= 0 {
            return Err(ClinicError::InvalidInput(
                "Order amount must be positive".to_string(),
            ));
        }
        tracing::debug!(amount_minor_units, currency, receipt, "gateway order created");
        Ok(format!("order_{}", Uuid::new_v4().simple()))
    }

    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        payment::verify_hmac(
            &self.key_secret,
            &payment::signature_payload(order_id, payment_id),
            signature,
        )
    }

    fn refund(
        &self,
        gateway_payment_id: &str,
        amount_minor_units: i64,
    ) -> Result<String, ClinicError> {
        if amount_minor_units <= 0 {
            return Err(ClinicError::InvalidInput(
                "Refund amount must be positive".to_string(),
            ));
        }
        tracing::debug!(gateway_payment_id, amount_minor_units, "gateway refund issued");
        Ok(format!("rfnd_{}", Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::Weekday;
    use rust_decimal_macros::dec;

    fn profile(id: &str, code: &str) -> ClinicProfile {
        ClinicProfile {
            clinic_id: id.to_string(),
            code: code.to_string(),
            name: "Smile Dental".to_string(),
            hours: WeeklyHours::uniform(&[Weekday::Mon], "09:00", "12:00").unwrap(),
            holidays: Vec::new(),
            slot_minutes: 30,
        }
    }

    #[test]
    fn membership_discount_respects_expiry() {
        let clock = Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2026, 11, 2).unwrap()));
        let memberships = InMemoryMemberships::new(clock.clone());
        memberships.enroll(
            "P1",
            MembershipPlan {
                plan_code: "GOLD".to_string(),
                discount_percent: dec!(15),
                expires_on: NaiveDate::from_ymd_opt(2026, 11, 30).unwrap(),
            },
        );
        assert!(memberships.has_membership("P1"));
        assert_eq!(memberships.current_discount_percent("P1"), dec!(15));
        assert_eq!(memberships.current_discount_percent("P2"), Decimal::ZERO);

        clock.set_date(NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
        assert!(!memberships.has_membership("P1"));
        assert_eq!(memberships.current_discount_percent("P1"), Decimal::ZERO);
    }

    #[test]
    fn clinic_codes_are_unique() {
        let directory = InMemoryClinicDirectory::new();
        directory.register(profile("c1", "SD")).unwrap();
        let err = directory.register(profile("c2", "SD")).unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
        assert_eq!(directory.clinic_code("c1").unwrap(), "SD");
        assert!(matches!(
            directory.clinic_code("missing"),
            Err(ClinicError::NotFound(_))
        ));
    }

    #[test]
    fn directory_builds_calendar() {
        let directory = InMemoryClinicDirectory::new();
        directory.register(profile("c1", "SD")).unwrap();
        let calendar = directory.calendar("c1").unwrap();
        let schedule = calendar.slots_for(NaiveDate::from_ymd_opt(2026, 11, 2).unwrap());
        assert_eq!(schedule.slots.len(), 6);
    }

    #[test]
    fn gateway_verifies_its_own_signatures() {
        let gateway = SignedOrderGateway::new("key_secret");
        let order = gateway.create_order(45_000, "INR", "PAY-2611-0001").unwrap();
        let signature = gateway.sign(&order, "pay_123").unwrap();
        assert!(gateway.verify_signature(&order, "pay_123", &signature));
        assert!(!gateway.verify_signature(&order, "pay_999", &signature));
    }
}
