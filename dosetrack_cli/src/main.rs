use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use dosetrack_core::*;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dosetrack")]
#[command(about = "Treatment scheduling and inventory reconciliation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Patient operations
    Patient {
        #[command(subcommand)]
        command: PatientCommands,
    },

    /// Reschedule a single dose (cascades the rest)
    Reschedule {
        patient_id: Uuid,
        dose_number: u32,
        /// New date (YYYY-MM-DD)
        date: String,
    },

    /// Sale operations
    Sale {
        #[command(subcommand)]
        command: SaleCommands,
    },

    /// Transition a delivery's status
    Delivery {
        sale_id: Uuid,
        dose_number: u32,
        /// Target status (agendamento, processamento, entregue)
        status: String,
        /// Delivery date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<String>,
    },

    /// Stock operations
    Stock {
        #[command(subcommand)]
        command: StockCommands,
    },

    /// Forecast the stock rupture date
    Forecast {
        /// Supplier lead time in days
        #[arg(long)]
        lead_time: Option<i64>,
    },

    /// Cash-flow operations
    Cashflow {
        #[command(subcommand)]
        command: CashflowCommands,
    },

    /// Show the business settings
    Settings,
}

#[derive(Subcommand)]
enum PatientCommands {
    /// Register a patient
    Add {
        name: String,
        /// Default dose strength in mg
        #[arg(long, default_value_t = 5.0)]
        dose_mg: f64,
        /// Default price per dose
        #[arg(long, default_value_t = 220.0)]
        price: f64,
        /// Treatment anchor date (YYYY-MM-DD); generates the schedule
        #[arg(long)]
        start: Option<String>,
        /// Phone number
        #[arg(long)]
        phone: Option<String>,
        /// Referring patient id (earns the referral bonus)
        #[arg(long)]
        referred_by: Option<Uuid>,
    },

    /// List patients
    List,

    /// Show one patient's schedule and points
    Show { patient_id: Uuid },

    /// Change the treatment anchor date (regenerates the schedule)
    SetStart {
        patient_id: Uuid,
        /// New anchor date (YYYY-MM-DD)
        date: String,
    },
}

#[derive(Subcommand)]
enum SaleCommands {
    /// Register a sale for a patient
    Add {
        patient_id: Uuid,
        /// Dose strength in mg
        #[arg(long)]
        dose_mg: f64,
        #[arg(long)]
        quantity: u32,
        #[arg(long)]
        price: f64,
        #[arg(long, default_value_t = 0.0)]
        discount: f64,
        #[arg(long, default_value_t = 0)]
        points_used: i64,
        /// Payment already settled
        #[arg(long)]
        paid: bool,
        /// Payment method (pix, cartao, dinheiro, boleto)
        #[arg(long)]
        method: Option<String>,
        #[arg(long, default_value_t = 1)]
        installments: u32,
        /// Base due date for installments (YYYY-MM-DD)
        #[arg(long)]
        due_date: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        operator_fee: f64,
        /// Doses handed over on the spot
        #[arg(long, default_value_t = 0)]
        deliver_now: u32,
    },

    /// List sales
    List,

    /// Delete a sale and its cash-flow projections
    Delete { sale_id: Uuid },
}

#[derive(Subcommand)]
enum StockCommands {
    /// Register a stock lot
    Add {
        /// Lot size in mg
        #[arg(long)]
        mg: f64,
        #[arg(long)]
        cost: f64,
        /// Purchase date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<String>,
    },

    /// Adjust a lot's remaining quantity
    Adjust {
        vial_id: Uuid,
        /// New remaining amount in mg
        #[arg(long)]
        remaining: f64,
        #[arg(long)]
        reason: String,
    },

    /// List stock lots
    List,
}

#[derive(Subcommand)]
enum CashflowCommands {
    /// Add a manual entry
    Add {
        description: String,
        #[arg(long)]
        amount: f64,
        /// Outbound entry (default is inbound)
        #[arg(long)]
        out: bool,
        #[arg(long)]
        paid: bool,
        #[arg(long, default_value_t = 1)]
        installments: u32,
        /// Base due date for installments (YYYY-MM-DD)
        #[arg(long)]
        due_date: Option<String>,
    },

    /// List entries (marks overdue first)
    List,

    /// Mark an entry paid
    Pay { entry_id: Uuid },

    /// Delete an entry
    Delete { entry_id: Uuid },

    /// Export the ledger to CSV
    Export {
        /// Output path; defaults to cashflow.csv in the data directory
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    dosetrack_core::logging::init();

    let cli = Cli::parse();

    let config = Config::load()?;
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    let store = JsonStore::new(&data_dir);
    let mut engine = Engine::open(store)?;

    match cli.command {
        Commands::Patient { command } => cmd_patient(&mut engine, command),
        Commands::Reschedule {
            patient_id,
            dose_number,
            date,
        } => {
            engine.reschedule_dose(patient_id, dose_number, parse_date(&date)?)?;
            println!("✓ Dose {} rescheduled to {}", dose_number, date);
            Ok(())
        }
        Commands::Sale { command } => cmd_sale(&mut engine, command),
        Commands::Delivery {
            sale_id,
            dose_number,
            status,
            date,
        } => {
            let status = parse_delivery_status(&status)?;
            let date = date.as_deref().map(parse_date).transpose()?;
            engine.update_delivery(sale_id, dose_number, status, date)?;
            println!("✓ Delivery for dose {} updated", dose_number);
            Ok(())
        }
        Commands::Stock { command } => cmd_stock(&mut engine, command),
        Commands::Forecast { lead_time } => {
            let lead_time = lead_time.unwrap_or(config.forecast.lead_time_days);
            cmd_forecast(&engine, lead_time)
        }
        Commands::Cashflow { command } => cmd_cashflow(&mut engine, command, &data_dir),
        Commands::Settings => {
            cmd_settings(&engine);
            Ok(())
        }
    }
}

fn cmd_patient(engine: &mut Engine<JsonStore>, command: PatientCommands) -> Result<()> {
    match command {
        PatientCommands::Add {
            name,
            dose_mg,
            price,
            start,
            phone,
            referred_by,
        } => {
            let treatment_start = start.as_deref().map(parse_date).transpose()?;
            let id = engine.create_patient(NewPatient {
                name: name.clone(),
                phone,
                treatment_start,
                default_dose_mg: dose_mg,
                default_price: price,
                referred_by,
                ..Default::default()
            })?;
            println!("✓ Patient registered: {} ({})", name, id);
        }

        PatientCommands::List => {
            for patient in engine.list_patients() {
                let pending = patient.pending_dose_numbers().len();
                println!(
                    "{}  {}  {} mg  {} pending dose(s)  {} points",
                    patient.id, patient.name, patient.default_dose_mg, pending, patient.points
                );
            }
        }

        PatientCommands::Show { patient_id } => {
            let patient = engine.patient(patient_id)?;
            println!("{} ({})", patient.name, patient.id);
            println!(
                "  Default: {} mg at {}",
                patient.default_dose_mg, patient.default_price
            );
            println!("  Points: {}", patient.points);
            println!("  Doses:");
            for dose in &patient.doses {
                println!(
                    "    #{:<2} {}  {:?}  payment {:?}",
                    dose.dose_number,
                    dose.date.format("%Y-%m-%d"),
                    dose.status,
                    dose.payment.status
                );
            }
        }

        PatientCommands::SetStart { patient_id, date } => {
            engine.update_patient(
                patient_id,
                PatientUpdate {
                    treatment_start: Some(parse_date(&date)?),
                    ..Default::default()
                },
            )?;
            println!("✓ Schedule regenerated from {}", date);
        }
    }
    Ok(())
}

fn cmd_sale(engine: &mut Engine<JsonStore>, command: SaleCommands) -> Result<()> {
    match command {
        SaleCommands::Add {
            patient_id,
            dose_mg,
            quantity,
            price,
            discount,
            points_used,
            paid,
            method,
            installments,
            due_date,
            operator_fee,
            deliver_now,
        } => {
            let sale_id = engine.add_sale(NewSale {
                patient_id,
                dose_mg,
                quantity,
                price,
                discount_per_dose: discount,
                points_used,
                payment_status: if paid {
                    PaymentStatus::Paid
                } else {
                    PaymentStatus::Pending
                },
                payment_method: method.as_deref().map(parse_payment_method).transpose()?,
                due_date: due_date.as_deref().map(parse_date).transpose()?,
                installments,
                operator_fee,
                deliver_immediately: deliver_now,
                bioimpedance: None,
                date: None,
            })?;
            let total = engine
                .list_sales()
                .iter()
                .find(|s| s.id == sale_id)
                .map(|s| s.total)
                .unwrap_or_default();
            println!("✓ Sale registered: {} (total {:.2})", sale_id, total);
        }

        SaleCommands::List => {
            for sale in engine.list_sales() {
                let delivered = sale
                    .deliveries
                    .iter()
                    .filter(|d| d.status == DeliveryStatus::Delivered)
                    .count();
                println!(
                    "{}  {}  {} x {} mg  total {:.2}  {}/{} delivered",
                    sale.id,
                    sale.date.format("%Y-%m-%d"),
                    sale.quantity,
                    sale.sold_dose_mg,
                    sale.total,
                    delivered,
                    sale.deliveries.len()
                );
            }
        }

        SaleCommands::Delete { sale_id } => {
            engine.delete_sale(sale_id)?;
            println!("✓ Sale {} deleted (cash-flow projections removed)", sale_id);
        }
    }
    Ok(())
}

fn cmd_stock(engine: &mut Engine<JsonStore>, command: StockCommands) -> Result<()> {
    match command {
        StockCommands::Add { mg, cost, date } => {
            let purchase_date = match date.as_deref() {
                Some(d) => parse_date(d)?,
                None => Utc::now(),
            };
            let ids = engine.add_stock(vec![NewVial {
                purchase_date,
                total_mg: mg,
                cost,
            }])?;
            println!("✓ Stock lot registered: {} ({} mg)", ids[0], mg);
        }

        StockCommands::Adjust {
            vial_id,
            remaining,
            reason,
        } => {
            engine.adjust_vial(vial_id, remaining, &reason)?;
            println!("✓ Lot {} adjusted to {} mg remaining", vial_id, remaining);
        }

        StockCommands::List => {
            for vial in engine.list_vials() {
                println!(
                    "{}  bought {}  {:.1}/{:.1} mg remaining  cost {:.2}",
                    vial.id,
                    vial.purchase_date.format("%Y-%m-%d"),
                    vial.remaining_mg,
                    vial.total_mg,
                    vial.cost
                );
            }
        }
    }
    Ok(())
}

fn cmd_forecast(engine: &Engine<JsonStore>, lead_time_days: i64) -> Result<()> {
    let fc = engine.forecast(lead_time_days, Utc::now());

    println!("Current stock: {:.1} mg", fc.current_stock_mg);
    println!("Pending demand: {:.1} mg", fc.total_pending_mg);
    match (fc.rupture_date, fc.purchase_deadline) {
        (Some(rupture), Some(deadline)) => {
            println!("Rupture date: {}", rupture.format("%Y-%m-%d"));
            println!(
                "Purchase deadline: {} (lead time {} days)",
                deadline.format("%Y-%m-%d"),
                lead_time_days
            );
        }
        _ => println!("No rupture against known demand."),
    }
    Ok(())
}

fn cmd_cashflow(
    engine: &mut Engine<JsonStore>,
    command: CashflowCommands,
    data_dir: &std::path::Path,
) -> Result<()> {
    match command {
        CashflowCommands::Add {
            description,
            amount,
            out,
            paid,
            installments,
            due_date,
        } => {
            let ids = engine.add_cash_flow(NewCashFlow {
                kind: if out { EntryKind::Outflow } else { EntryKind::Inflow },
                description,
                amount,
                status: if paid {
                    PaymentStatus::Paid
                } else {
                    PaymentStatus::Pending
                },
                method: None,
                date: Utc::now(),
                due_date: due_date.as_deref().map(parse_date).transpose()?,
                installments,
            })?;
            println!("✓ {} cash-flow entr(ies) added", ids.len());
        }

        CashflowCommands::List => {
            engine.mark_overdue_entries(Utc::now())?;
            for entry in engine.list_cash_flow() {
                let label = entry.installment.as_deref().unwrap_or("-");
                println!(
                    "{}  {:?}  {:?}  {:.2}  {}  {}",
                    entry.id,
                    entry.kind,
                    entry.status,
                    entry.amount,
                    entry.purchase_date.format("%Y-%m-%d"),
                    label
                );
            }
        }

        CashflowCommands::Pay { entry_id } => {
            engine.update_cash_flow(
                entry_id,
                CashFlowUpdate {
                    status: Some(CashFlowStatus::Paid),
                    ..Default::default()
                },
            )?;
            println!("✓ Entry {} marked paid", entry_id);
        }

        CashflowCommands::Delete { entry_id } => {
            engine.delete_cash_flow(entry_id)?;
            println!("✓ Entry {} deleted", entry_id);
        }

        CashflowCommands::Export { path } => {
            let path = path.unwrap_or_else(|| data_dir.join("cashflow.csv"));
            let count = cash_flow_to_csv(engine.list_cash_flow(), &path)?;
            println!("✓ Exported {} entries to {}", count, path.display());
        }
    }
    Ok(())
}

fn cmd_settings(engine: &Engine<JsonStore>) {
    let settings = engine.settings();
    println!("Dose prices:");
    for price in &settings.dose_prices {
        println!("  {:>5.1} mg  {:.2}", price.dose_mg, price.price);
    }
    println!("Rewards:");
    for reward in &settings.rewards.points_per_dose {
        println!("  {:>5.1} mg  {} points", reward.dose_mg, reward.points);
    }
    println!("  Points to BRL: {:.2}", settings.rewards.points_to_brl);
    println!(
        "  Referral bonus: {} points",
        settings.rewards.referral_bonus_points
    );
    println!("Daily late fee: {:.2}", settings.daily_late_fee);
}

/// Parse a YYYY-MM-DD date into a UTC timestamp at 09:00
fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::Validation(format!("Invalid date '{}': {}", s, e)))?;
    let time = date.and_hms_opt(9, 0, 0).ok_or_else(|| {
        Error::Validation(format!("Invalid date '{}'", s))
    })?;
    Ok(Utc.from_utc_datetime(&time))
}

fn parse_delivery_status(s: &str) -> Result<DeliveryStatus> {
    match s.to_lowercase().as_str() {
        "agendamento" | "em agendamento" => Ok(DeliveryStatus::Scheduling),
        "processamento" | "em processamento" => Ok(DeliveryStatus::Processing),
        "entregue" => Ok(DeliveryStatus::Delivered),
        other => Err(Error::Validation(format!(
            "Unknown delivery status '{}'",
            other
        ))),
    }
}

fn parse_payment_method(s: &str) -> Result<PaymentMethod> {
    match s.to_lowercase().as_str() {
        "pix" => Ok(PaymentMethod::Pix),
        "cartao" | "cartão" => Ok(PaymentMethod::Card),
        "dinheiro" => Ok(PaymentMethod::Cash),
        "boleto" => Ok(PaymentMethod::Boleto),
        other => Err(Error::Validation(format!(
            "Unknown payment method '{}'",
            other
        ))),
    }
}
