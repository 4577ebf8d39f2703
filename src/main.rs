/// Command-line interface for the clinic front desk.
///
/// This binary provides an interactive CLI for booking appointments,
/// running the day queue, and billing visits against a local SQLite store.
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Weekday};
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

use clinicdesk::billing::{BillingService, NewInvoice, PaymentRequest};
use clinicdesk::calendar::WeeklyHours;
use clinicdesk::clock::{Clock, SystemClock};
use clinicdesk::collaborators::{
    ClinicProfile, InMemoryClinicDirectory, InMemoryMemberships, SignedOrderGateway,
};
use clinicdesk::config::{Settings, APP_NAME, APP_VERSION};
use clinicdesk::db::Database;
use clinicdesk::error::ClinicError;
use clinicdesk::invoice::ItemInput;
use clinicdesk::models::{
    Appointment, AppointmentType, BilledEntity, Invoice, ItemType, Payment, PaymentMode,
    PaymentStatus,
};
use clinicdesk::scheduler::{AppointmentService, BookingRequest};

const DEMO_CLINIC: &str = "clinic-sd";
const FRONT_DESK: &str = "front-desk";

struct ClinicCLI {
    appointments: AppointmentService,
    billing: BillingService,
    clock: Arc<dyn Clock>,
    invoices: Vec<Invoice>,
    payments: Vec<Payment>,
    running: bool,
}

impl ClinicCLI {
    fn new(settings: &Settings) -> Result<Self, ClinicError> {
        let db = if settings.uses_memory_database() {
            Database::open_in_memory()?
        } else {
            Database::open(&settings.database_path)?
        };
        let db = Arc::new(db);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let clinics = InMemoryClinicDirectory::new();
        clinics.register(ClinicProfile {
            clinic_id: DEMO_CLINIC.to_string(),
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
            )?,
            holidays: Vec::new(),
            slot_minutes: settings.slot_minutes,
        })?;

        let appointments =
            AppointmentService::new(db.clone(), Arc::new(clinics), clock.clone(), settings);
        let billing = BillingService::new(
            db,
            Arc::new(InMemoryMemberships::new(clock.clone())),
            Arc::new(SignedOrderGateway::new(settings.gateway_key_secret.clone())),
            clock.clone(),
            settings,
        );

        Ok(ClinicCLI {
            appointments,
            billing,
            clock,
            invoices: Vec::new(),
            payments: Vec::new(),
            running: true,
        })
    }

    fn print_header(&self) {
        println!("\n{}", "=".repeat(60));
        println!("       {} {} - FRONT DESK", APP_NAME.to_uppercase(), APP_VERSION);
        println!("{}", "=".repeat(60));
    }

    fn print_menu(&self) {
        println!("\n--- Main Menu ---");
        println!("1. View available slots");
        println!("2. Book appointment");
        println!("3. View day queue");
        println!("4. Update appointment status");
        println!("5. Reschedule appointment");
        println!("6. Create invoice");
        println!("7. Record payment");
        println!("8. Refund payment");
        println!("9. Run demo");
        println!("10. Exit");
        println!("{}", "-".repeat(20));
    }

    /// Read one line. End of input stops the main loop.
    fn get_input(&mut self, prompt: &str, default: Option<&str>) -> String {
        if let Some(def) = default {
            print!("{} [{}]: ", prompt, def);
        } else {
            print!("{}: ", prompt);
        }
        let _ = io::stdout().flush();

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => {
                self.running = false;
                return default.unwrap_or("").to_string();
            }
            Ok(_) => {}
        }
        let input = input.trim();

        if input.is_empty() {
            default.unwrap_or("").to_string()
        } else {
            input.to_string()
        }
    }

    fn get_int_input(&mut self, prompt: &str, default: Option<i32>) -> i32 {
        loop {
            let default_str = default.map(|d| d.to_string());
            let input = self.get_input(prompt, default_str.as_deref());

            if let Ok(value) = input.parse::<i32>() {
                return value;
            }
            if !self.running {
                return default.unwrap_or(0);
            }
            println!("Please enter a valid number");
        }
    }

    fn get_date_input(&mut self, prompt: &str, default: NaiveDate) -> Option<NaiveDate> {
        let default_str = default.format("%Y-%m-%d").to_string();
        let input = self.get_input(prompt, Some(&default_str));
        match NaiveDate::parse_from_str(&input, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                println!("Dates are written as YYYY-MM-DD");
                None
            }
        }
    }

    fn get_amount_input(&mut self, prompt: &str, default: Option<Decimal>) -> Option<Decimal> {
        let default_str = default.map(|d| d.to_string());
        let input = self.get_input(prompt, default_str.as_deref());
        match input.parse::<Decimal>() {
            Ok(amount) => Some(amount),
            Err(_) => {
                println!("Please enter a valid amount");
                None
            }
        }
    }

    fn tomorrow(&self) -> NaiveDate {
        self.clock.today() + Duration::days(1)
    }

    /// Let the user pick one of the live appointments on a day.
    fn select_appointment(&mut self, title: &str) -> Option<Appointment> {
        let default = self.tomorrow();
        let date = self.get_date_input("Date", default)?;
        let queue = match self.appointments.day_queue(DEMO_CLINIC, date) {
            Ok(queue) => queue,
            Err(e) => {
                println!("\nError: {}", e);
                return None;
            }
        };
        if queue.is_empty() {
            println!("\nNo appointments on {}", date);
            return None;
        }

        println!("\n--- {} ---", title);
        for (i, apt) in queue.iter().enumerate() {
            println!(
                "  {}. #{:<3} {} {} ({})",
                i + 1,
                apt.token_number,
                apt.time_slot,
                apt.patient_id,
                apt.status
            );
        }
        let choice = self.get_int_input("Select appointment (0 to go back)", Some(0));
        if choice <= 0 || choice as usize > queue.len() {
            return None;
        }
        queue.into_iter().nth(choice as usize - 1)
    }

    fn view_available_slots(&mut self) {
        let default = self.tomorrow();
        let Some(date) = self.get_date_input("Date", default) else {
            return;
        };

        match self.appointments.available_slots(DEMO_CLINIC, date) {
            Ok(day) if !day.is_open => {
                println!(
                    "\nClinic closed on {}: {}",
                    date.format("%A, %Y-%m-%d"),
                    day.reason.unwrap_or_else(|| "closed".to_string())
                );
            }
            Ok(day) => {
                println!(
                    "\n--- {} ({} of {} free) ---",
                    date.format("%A, %Y-%m-%d"),
                    day.free_count(),
                    day.slots.len()
                );
                for row in day.slots.chunks(6) {
                    let line: Vec<String> = row
                        .iter()
                        .map(|s| {
                            let mark = if s.available { " " } else { "x" };
                            format!("{}{}", s.label, mark)
                        })
                        .collect();
                    println!("  {}", line.join("  "));
                }
                println!("\n(x = booked)");
            }
            Err(e) => println!("\nError: {}", e),
        }
    }

    fn book_appointment(&mut self) {
        println!("\n--- Book Appointment ---");

        let patient_id = self.get_input("Patient ID", None);
        let default = self.tomorrow();
        let Some(date) = self.get_date_input("Date", default) else {
            return;
        };
        let slot = self.get_input("Time slot (HH:MM)", Some("10:00"));
        let reason = self.get_input("Reason for visit", None);

        println!("\nAppointment types:");
        println!("  1. Regular");
        println!("  2. Follow-up");
        println!("  3. Emergency");
        let appointment_type = match self.get_int_input("Select type", Some(1)) {
            2 => AppointmentType::FollowUp,
            3 => AppointmentType::Emergency,
            _ => AppointmentType::Regular,
        };

        let request = BookingRequest::new(&patient_id, DEMO_CLINIC, date, &slot, &reason)
            .with_type(appointment_type)
            .by(FRONT_DESK);

        match self.appointments.book(&request) {
            Ok(apt) => {
                println!("\nBooked {} for {}", apt.appointment_number, apt.patient_id);
                println!("  {} at {}, token #{}", apt.date, apt.time_slot, apt.token_number);
                println!("  OPD fee: {}", apt.opd_fee);
            }
            Err(e) => println!("\nBooking failed: {}", e),
        }
    }

    fn view_day_queue(&mut self) {
        let default = self.clock.today();
        let Some(date) = self.get_date_input("Date", default) else {
            return;
        };

        match self.appointments.day_queue(DEMO_CLINIC, date) {
            Ok(queue) if queue.is_empty() => println!("\nNo appointments on {}", date),
            Ok(queue) => {
                println!("\n--- Queue for {} ({}) ---", date.format("%A, %Y-%m-%d"), queue.len());
                for apt in &queue {
                    println!(
                        "  #{:<3} {} {:12} {:11} {:10} fee {}{}",
                        apt.token_number,
                        apt.time_slot,
                        apt.appointment_number,
                        apt.status.as_str(),
                        apt.patient_id,
                        apt.opd_fee,
                        if apt.opd_fee_paid { " (paid)" } else { "" }
                    );
                }
            }
            Err(e) => println!("\nError: {}", e),
        }
    }

    fn update_status(&mut self) {
        let Some(apt) = self.select_appointment("Update Status") else {
            return;
        };

        println!("\nActions:");
        println!("  1. Confirm");
        println!("  2. Check in");
        println!("  3. Start consultation");
        println!("  4. Complete");
        println!("  5. Cancel");
        println!("  6. Mark no-show");
        let action = self.get_int_input("Select action", Some(0));

        let result = match action {
            1 => self.appointments.confirm(&apt.id, FRONT_DESK),
            2 => self.appointments.check_in(&apt.id, FRONT_DESK),
            3 => self.appointments.start(&apt.id, FRONT_DESK),
            4 => {
                let notes = self.get_input("Clinical notes", Some(""));
                let notes = (!notes.is_empty()).then_some(notes);
                self.appointments.complete(&apt.id, notes.as_deref(), FRONT_DESK)
            }
            5 => {
                let reason = self.get_input("Cancellation reason", Some("Patient request"));
                self.appointments.cancel(&apt.id, Some(&reason), FRONT_DESK)
            }
            6 => self.appointments.mark_no_show(&apt.id, FRONT_DESK),
            _ => return,
        };

        match result {
            Ok(updated) => println!(
                "\n{} is now {}",
                updated.appointment_number, updated.status
            ),
            Err(e) => println!("\nCould not update: {}", e),
        }
    }

    fn reschedule_appointment(&mut self) {
        let Some(apt) = self.select_appointment("Reschedule") else {
            return;
        };
        let Some(date) = self.get_date_input("New date", apt.date) else {
            return;
        };
        let slot = self.get_input("New time slot (HH:MM)", Some(apt.time_slot.as_str()));
        let reason = self.get_input("Reason", Some("Patient request"));

        match self
            .appointments
            .reschedule(&apt.id, date, &slot, Some(&reason), FRONT_DESK)
        {
            Ok(updated) => println!(
                "\n{} moved to {} at {} (token #{})",
                updated.appointment_number, updated.date, updated.time_slot, updated.token_number
            ),
            Err(e) => println!("\nCould not reschedule: {}", e),
        }
    }

    fn create_invoice(&mut self) {
        let Some(apt) = self.select_appointment("Invoice Visit") else {
            return;
        };

        let mut items = vec![ItemInput::new(
            ItemType::Consultation,
            "OPD consultation",
            1,
            apt.opd_fee,
        )
        .with_reference(BilledEntity::Appointment(apt.id))];

        loop {
            let description = self.get_input("Treatment (blank to finish)", Some(""));
            if description.is_empty() {
                break;
            }
            let Some(price) = self.get_amount_input("Unit price", None) else {
                continue;
            };
            let quantity = self.get_int_input("Quantity", Some(1)).max(1) as u32;
            items.push(ItemInput::new(ItemType::Treatment, &description, quantity, price));
        }

        let input = NewInvoice {
            patient_id: apt.patient_id.clone(),
            clinic_id: apt.clinic_id.clone(),
            appointment_id: Some(apt.id),
            items,
            created_by: FRONT_DESK.to_string(),
            ..NewInvoice::default()
        };

        let issued = self
            .billing
            .create_invoice(input)
            .and_then(|invoice| self.billing.issue_invoice(&invoice.id));
        match issued {
            Ok(invoice) => {
                println!("\nInvoice {} issued", invoice.invoice_number);
                for item in &invoice.items {
                    println!(
                        "  {:30} {:>3} x {:>8} = {:>9}",
                        item.description, item.quantity, item.unit_price, item.total
                    );
                }
                println!("  Subtotal: {}", invoice.subtotal);
                println!("  Tax:      {}", invoice.total_tax);
                println!("  Total:    {}", invoice.grand_total);
                self.invoices.push(invoice);
            }
            Err(e) => println!("\nCould not create invoice: {}", e),
        }
    }

    fn select_invoice(&mut self) -> Option<Invoice> {
        let open: Vec<Invoice> = self
            .invoices
            .iter()
            .filter_map(|inv| self.billing.get_invoice(&inv.id).ok())
            .collect();
        if open.is_empty() {
            println!("\nNo invoices in this session (option 6 creates one)");
            return None;
        }

        println!("\n--- Invoices ---");
        for (i, inv) in open.iter().enumerate() {
            println!(
                "  {}. {} {} total {} due {} ({})",
                i + 1,
                inv.invoice_number,
                inv.patient_id,
                inv.grand_total,
                inv.balance_due,
                inv.status
            );
        }
        let choice = self.get_int_input("Select invoice (0 to go back)", Some(0));
        if choice <= 0 || choice as usize > open.len() {
            return None;
        }
        open.into_iter().nth(choice as usize - 1)
    }

    fn record_payment(&mut self) {
        let Some(invoice) = self.select_invoice() else {
            return;
        };
        let Some(amount) = self.get_amount_input("Amount", Some(invoice.balance_due)) else {
            return;
        };

        println!("\nPayment modes:");
        println!("  1. Cash");
        println!("  2. Card");
        println!("  3. UPI");
        println!("  4. Online (gateway)");
        let mode = match self.get_int_input("Select mode", Some(1)) {
            2 => PaymentMode::Card,
            3 => PaymentMode::Upi,
            4 => PaymentMode::Razorpay,
            _ => PaymentMode::Cash,
        };
        let request = PaymentRequest::for_invoice(&invoice, amount, mode).by(FRONT_DESK);

        if mode.is_gateway() {
            match self.billing.create_gateway_order(&request) {
                Ok(payment) => {
                    let order = payment
                        .gateway
                        .as_ref()
                        .map(|g| g.order_id.as_str())
                        .unwrap_or("-");
                    println!("\nGateway order {} opened for {}", order, payment.payment_number);
                    println!("Payment stays pending until the gateway confirms capture");
                    self.payments.push(payment);
                }
                Err(e) => println!("\nCould not open gateway order: {}", e),
            }
            return;
        }

        match self.billing.record_payment(&request) {
            Ok(receipt) => {
                println!("\nPayment {} recorded", receipt.payment.payment_number);
                if let Some(inv) = &receipt.invoice {
                    println!(
                        "  {} paid {} of {}, balance {} ({})",
                        inv.invoice_number, inv.amount_paid, inv.grand_total, inv.balance_due, inv.status
                    );
                }
                self.payments.push(receipt.payment);
            }
            Err(e) => println!("\nPayment failed: {}", e),
        }
    }

    fn refund_payment(&mut self) {
        let paid: Vec<Payment> = self
            .payments
            .iter()
            .filter_map(|p| self.billing.get_payment(&p.id).ok())
            .filter(|p| p.status == PaymentStatus::Paid)
            .collect();
        if paid.is_empty() {
            println!("\nNo paid payments to refund");
            return;
        }

        println!("\n--- Refund Payment ---");
        for (i, p) in paid.iter().enumerate() {
            println!("  {}. {} {} ({})", i + 1, p.payment_number, p.amount, p.payment_mode);
        }
        let choice = self.get_int_input("Select payment (0 to go back)", Some(0));
        if choice <= 0 || choice as usize > paid.len() {
            return;
        }
        let payment = &paid[choice as usize - 1];
        let Some(amount) = self.get_amount_input("Refund amount", Some(payment.amount)) else {
            return;
        };
        let reason = self.get_input("Reason", None);

        match self
            .billing
            .refund_payment(&payment.id, Some(amount), &reason, FRONT_DESK)
        {
            Ok(receipt) => {
                println!("\nRefunded {} on {}", amount, receipt.payment.payment_number);
                if let Some(inv) = &receipt.invoice {
                    println!(
                        "  {} now paid {} of {} ({})",
                        inv.invoice_number, inv.amount_paid, inv.grand_total, inv.status
                    );
                }
            }
            Err(e) => println!("\nRefund failed: {}", e),
        }
    }

    /// First open clinic day after today.
    fn next_open_day(&self) -> Option<NaiveDate> {
        (1..=14)
            .map(|offset| self.clock.today() + Duration::days(offset))
            .find(|date| {
                self.appointments
                    .available_slots(DEMO_CLINIC, *date)
                    .map(|day| day.is_open && day.free_count() >= 4)
                    .unwrap_or(false)
            })
    }

    fn run_demo(&mut self) {
        println!("\n--- Running Demo ---");

        let Some(date) = self.next_open_day() else {
            println!("No open day with free slots in the next two weeks");
            return;
        };
        let free: Vec<String> = match self.appointments.available_slots(DEMO_CLINIC, date) {
            Ok(day) => day
                .slots
                .into_iter()
                .filter(|s| s.available)
                .map(|s| s.label)
                .collect(),
            Err(e) => {
                println!("Error: {}", e);
                return;
            }
        };
        let [first, second, third, ..] = free.as_slice() else {
            println!("Not enough free slots on {}", date);
            return;
        };
        println!("Booking on {} starting at {}", date.format("%A, %Y-%m-%d"), first);

        let requests = vec![
            BookingRequest::new("P001", DEMO_CLINIC, date, first, "Annual checkup").by(FRONT_DESK),
            BookingRequest::new("P002", DEMO_CLINIC, date, first, "Broken molar")
                .with_type(AppointmentType::Emergency)
                .by(FRONT_DESK),
            BookingRequest::new("P003", DEMO_CLINIC, date, second, "Root canal follow-up")
                .with_type(AppointmentType::FollowUp)
                .by(FRONT_DESK),
            BookingRequest::new("P004", DEMO_CLINIC, date, third, "Cleaning").by(FRONT_DESK),
        ];

        println!("\nSubmitting {} booking requests...", requests.len());
        println!("  - P001: Regular at {}", first);
        println!("  - P002: EMERGENCY at {}", first);
        println!("  - P003: Follow-up at {}", second);
        println!("  - P004: Regular at {}", third);

        let result = self.appointments.book_batch(requests);

        println!("\n--- Booking Results ---");
        println!("Success rate: {:.1}%", result.success_rate());
        for apt in &result.confirmed {
            println!(
                "  [{:9}] {:5} -> {} token #{} ({})",
                apt.appointment_type.as_str(),
                apt.patient_id,
                apt.time_slot,
                apt.token_number,
                apt.appointment_number
            );
        }
        for fail in &result.failed {
            println!("  - {}: {}", fail.request.patient_id, fail.message);
        }
        println!("\nNote: the emergency patient P002 took {},", first);
        println!("even though routine patient P001 asked for the same slot.");

        let Some(emergency) = result
            .confirmed
            .iter()
            .find(|a| a.appointment_type == AppointmentType::Emergency)
        else {
            return;
        };

        let invoice = NewInvoice {
            patient_id: emergency.patient_id.clone(),
            clinic_id: emergency.clinic_id.clone(),
            appointment_id: Some(emergency.id),
            items: vec![
                ItemInput::new(ItemType::Consultation, "Emergency OPD", 1, emergency.opd_fee)
                    .with_reference(BilledEntity::Appointment(emergency.id)),
                ItemInput::new(ItemType::Treatment, "Extraction", 1, Decimal::from(4500))
                    .with_tax_rate(Decimal::from(18)),
            ],
            created_by: FRONT_DESK.to_string(),
            ..NewInvoice::default()
        };
        let billed = self
            .billing
            .create_invoice(invoice)
            .and_then(|inv| self.billing.issue_invoice(&inv.id))
            .and_then(|inv| {
                let request = PaymentRequest::for_invoice(&inv, Decimal::from(2000), PaymentMode::Cash)
                    .by(FRONT_DESK);
                self.billing.record_payment(&request)
            });

        match billed {
            Ok(receipt) => {
                if let Some(inv) = &receipt.invoice {
                    println!(
                        "\nInvoice {} for P002: total {}, paid {}, balance {} ({})",
                        inv.invoice_number, inv.grand_total, inv.amount_paid, inv.balance_due, inv.status
                    );
                    self.invoices.push(inv.clone());
                }
                self.payments.push(receipt.payment);
            }
            Err(e) => println!("\nBilling failed: {}", e),
        }
    }

    fn run(&mut self) {
        self.print_header();

        while self.running {
            self.print_menu();

            let choice = self.get_int_input("Enter choice", Some(9));
            if !self.running {
                break;
            }

            match choice {
                1 => self.view_available_slots(),
                2 => self.book_appointment(),
                3 => self.view_day_queue(),
                4 => self.update_status(),
                5 => self.reschedule_appointment(),
                6 => self.create_invoice(),
                7 => self.record_payment(),
                8 => self.refund_payment(),
                9 => self.run_demo(),
                10 => self.running = false,
                _ => println!("Invalid choice"),
            }
        }
        println!("\nGoodbye!");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clinicdesk=info")),
        )
        .with_writer(io::stderr)
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(database = %settings.database_path.display(), "starting {}", APP_NAME);

    match ClinicCLI::new(&settings) {
        Ok(mut cli) => {
            cli.run();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Could not start {}: {}", APP_NAME, e);
            ExitCode::FAILURE
        }
    }
}
