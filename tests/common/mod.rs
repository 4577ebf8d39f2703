#![allow(dead_code)]

use std::sync::Arc;

use chrono::{NaiveDate, Weekday};
use clinicdesk::billing::BillingService;
use clinicdesk::calendar::WeeklyHours;
use clinicdesk::clock::FixedClock;
use clinicdesk::collaborators::{
    ClinicProfile, InMemoryClinicDirectory, InMemoryMemberships, SignedOrderGateway,
};
use clinicdesk::config::Settings;
use clinicdesk::db::Database;
use clinicdesk::scheduler::AppointmentService;

pub const CLINIC: &str = "clinic-sd";
pub const KEY_SECRET: &str = "rzp_test_key_secret";
pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub struct Harness {
    pub appointments: Arc<AppointmentService>,
    pub billing: Arc<BillingService>,
    pub gateway: Arc<SignedOrderGateway>,
    pub clock: Arc<FixedClock>,
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Monday 2026-11-02, the clinic's "today" in every test.
pub fn monday() -> NaiveDate {
    date(2026, 11, 2)
}

/// Smile Dental: Mon-Sat 09:00-20:00, 30 minute slots, closed Sunday.
pub fn harness() -> Harness {
    let settings = Settings {
        gateway_key_secret: KEY_SECRET.to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        ..Settings::default()
    };
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = Arc::new(FixedClock::on(monday()));
    let gateway = Arc::new(SignedOrderGateway::new(KEY_SECRET));

    let clinics = InMemoryClinicDirectory::new();
    clinics
        .register(ClinicProfile {
            clinic_id: CLINIC.to_string(),
            code: "SD".to_string(),
            name: "Smile Dental".to_string(),
            hours: WeeklyHours::uniform(
                &[
                    Weekday::Mon,
                    Weekday::Tue,
                    Weekday::Wed,
                    Weekday::Thu,
                    Weekday::Fri,
                    Weekday::Sat,
                ],
                "09:00",
                "20:00",
            )
            .unwrap(),
            holidays: Vec::new(),
            slot_minutes: 30,
        })
        .unwrap();

    Harness {
        appointments: Arc::new(AppointmentService::new(
            db.clone(),
            Arc::new(clinics),
            clock.clone(),
            &settings,
        )),
        billing: Arc::new(BillingService::new(
            db,
            Arc::new(InMemoryMemberships::new(clock.clone())),
            gateway.clone(),
            clock.clone(),
            &settings,
        )),
        gateway,
        clock,
    }
}

/// Slot labels of one clinic day, "09:00" through "19:30".
pub fn day_slots() -> Vec<String> {
    (9..20)
        .flat_map(|hour| [format!("{hour:02}:00"), format!("{hour:02}:30")])
        .collect()
}
