//! Stock-rupture forecasting.
//!
//! Projects future depletion of the vial stock against the scheduled
//! pending demand across all patients. Pure function: `today` is passed
//! in explicitly so forecasts are reproducible in tests.

use crate::inventory::total_remaining_mg;
use crate::types::{DoseStatus, Patient, Vial};
use chrono::{DateTime, Duration, Utc};

/// Result of a rupture forecast
#[derive(Clone, Debug, PartialEq)]
pub struct StockForecast {
    /// First scheduled date at which stock runs out; None when known
    /// demand never exhausts the stock
    pub rupture_date: Option<DateTime<Utc>>,
    /// Latest purchase date that still beats the rupture
    pub purchase_deadline: Option<DateTime<Utc>>,
    /// Total mg of pending demand considered
    pub total_pending_mg: f64,
    /// Current stock across all lots
    pub current_stock_mg: f64,
}

/// Forecast the stock rupture date against scheduled demand
///
/// Demand is every pending dose dated today or later, each contributing
/// its explicit `administered_mg` when set, else the patient's default
/// strength, walked ascending by date against the current stock total.
/// A stock already at or below zero ruptures at the earliest demand date.
pub fn forecast_rupture(
    vials: &[Vial],
    patients: &[Patient],
    lead_time_days: i64,
    today: DateTime<Utc>,
) -> StockForecast {
    let current_stock_mg = total_remaining_mg(vials);

    // (date, expected mg) per pending future dose, ascending by date
    let mut demand: Vec<(DateTime<Utc>, f64)> = patients
        .iter()
        .flat_map(|p| {
            p.doses
                .iter()
                .filter(|d| d.status == DoseStatus::Pending && d.date >= today)
                .map(|d| (d.date, d.administered_mg.unwrap_or(p.default_dose_mg)))
        })
        .collect();
    demand.sort_by_key(|(date, _)| *date);

    let total_pending_mg: f64 = demand.iter().map(|(_, mg)| mg).sum();

    let rupture_date = if current_stock_mg <= 0.0 {
        demand.first().map(|(date, _)| *date)
    } else {
        let mut running = current_stock_mg;
        let mut rupture = None;
        for (date, mg) in &demand {
            running -= mg;
            if running <= 0.0 {
                rupture = Some(*date);
                break;
            }
        }
        rupture
    };

    let purchase_deadline = rupture_date.map(|d| d - Duration::days(lead_time_days));

    tracing::info!(
        "Forecast: stock {} mg, pending demand {} mg, rupture {:?}",
        current_stock_mg,
        total_pending_mg,
        rupture_date
    );

    StockForecast {
        rupture_date,
        purchase_deadline,
        total_pending_mg,
        current_stock_mg,
    }
}
