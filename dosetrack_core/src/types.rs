//! Core domain types for the Dosetrack system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Patients, their dose schedules and bioimpedance evolutions
//! - Sales, deliveries and vial usage
//! - Stock lots (vials)
//! - Cash-flow entries
//! - Reward settings and the persisted dataset
//!
//! Status enums carry the Portuguese wire vocabulary of the persisted
//! dataset via `#[serde(rename)]`; Rust identifiers stay English.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Patient and Dose Types
// ============================================================================

/// A patient enrolled in a multi-week treatment program
///
/// The patient exclusively owns its dose list; all schedule mutations
/// go through the engine so the dose-order invariant holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    /// Anchor date for the dose schedule
    pub treatment_start: Option<DateTime<Utc>>,
    pub default_dose_mg: f64,
    pub default_price: f64,
    pub doses: Vec<Dose>,
    pub evolutions: Vec<Evolution>,
    /// Cached balance; must always equal the sum of `point_history`
    pub points: i64,
    pub point_history: Vec<PointTransaction>,
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Patient {
    /// Dose numbers of pending doses, ascending
    pub fn pending_dose_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .doses
            .iter()
            .filter(|d| d.status == DoseStatus::Pending)
            .map(|d| d.dose_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Look up a dose by its number
    pub fn dose_mut(&mut self, dose_number: u32) -> Option<&mut Dose> {
        self.doses.iter_mut().find(|d| d.dose_number == dose_number)
    }
}

/// Lifecycle status of a scheduled dose
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DoseStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "administered")]
    Administered,
}

/// One scheduled dose in a patient's treatment program
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dose {
    pub id: Uuid,
    /// 1-based, unique per patient; sorting by number must yield
    /// non-decreasing dates
    pub dose_number: u32,
    pub date: DateTime<Utc>,
    pub status: DoseStatus,
    /// mg actually given; set when the dose is administered
    pub administered_mg: Option<f64>,
    pub payment: PaymentInfo,
}

/// Payment snapshot attached to a dose by sale fulfillment
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PaymentInfo {
    pub status: PaymentStatus,
    pub method: Option<PaymentMethod>,
    pub amount: Option<f64>,
    pub date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub installments: Option<u32>,
}

/// Payment status of a dose or sale
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PaymentStatus {
    #[serde(rename = "pago")]
    Paid,
    #[default]
    #[serde(rename = "pendente")]
    Pending,
}

/// Accepted payment methods
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentMethod {
    #[serde(rename = "pix")]
    Pix,
    #[serde(rename = "cartao")]
    Card,
    #[serde(rename = "dinheiro")]
    Cash,
    #[serde(rename = "boleto")]
    Boleto,
}

/// Bioimpedance snapshot recorded alongside a consultation or sale
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evolution {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub weight_kg: Option<f64>,
    pub body_fat_pct: Option<f64>,
    pub muscle_mass_kg: Option<f64>,
    pub visceral_fat: Option<f64>,
    pub notes: Option<String>,
}

/// An immutable entry in a patient's points ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointTransaction {
    pub date: DateTime<Utc>,
    pub description: String,
    /// Signed: positive for earnings, negative for redemptions
    pub points: i64,
}

// ============================================================================
// Sale and Delivery Types
// ============================================================================

/// A commercial transaction covering N doses
///
/// Immutable history once created, except delivery status transitions
/// and `vial_usage` accumulation. `deliveries` is the single source of
/// truth for delivery state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub date: DateTime<Utc>,
    pub quantity: u32,
    /// mg strength sold per dose
    pub sold_dose_mg: f64,
    pub price: f64,
    pub discount_per_dose: f64,
    pub points_used: i64,
    pub total: f64,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub due_date: Option<DateTime<Utc>>,
    pub installments: u32,
    pub operator_fee: f64,
    /// One entry per dose number covered by the sale
    pub deliveries: Vec<Delivery>,
    /// Inventory draw per vial, merged by vial id
    pub vial_usage: Vec<VialUsage>,
}

impl Sale {
    /// Look up a delivery by its dose number
    pub fn delivery_mut(&mut self, dose_number: u32) -> Option<&mut Delivery> {
        self.deliveries
            .iter_mut()
            .find(|d| d.dose_number == dose_number)
    }

    /// Merge an allocation into `vial_usage`, accumulating by vial id
    pub fn record_vial_usage(&mut self, usage: VialUsage) {
        match self
            .vial_usage
            .iter_mut()
            .find(|u| u.vial_id == usage.vial_id)
        {
            Some(existing) => existing.mg_used += usage.mg_used,
            None => self.vial_usage.push(usage),
        }
    }
}

/// Delivery status for one dose of a sale
///
/// `Delivered` is terminal: once entered it cannot be left, and
/// re-entering it must not deduct inventory again.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    #[serde(rename = "em agendamento")]
    Scheduling,
    #[serde(rename = "em processamento")]
    Processing,
    #[serde(rename = "entregue")]
    Delivered,
}

/// Delivery state for one dose number within a sale
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delivery {
    pub dose_number: u32,
    pub status: DeliveryStatus,
    pub delivery_date: Option<DateTime<Utc>>,
}

/// mg drawn from a single vial for a sale
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VialUsage {
    pub vial_id: Uuid,
    pub mg_used: f64,
}

// ============================================================================
// Inventory Types
// ============================================================================

/// A physical stock lot of raw material
///
/// Invariant: `remaining_mg + sold_mg == total_mg` and
/// `remaining_mg >= 0` at all times.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vial {
    pub id: Uuid,
    pub purchase_date: DateTime<Utc>,
    pub total_mg: f64,
    pub cost: f64,
    pub remaining_mg: f64,
    pub sold_mg: f64,
}

impl Vial {
    /// Check the lot accounting invariant (f64 tolerance)
    pub fn invariant_holds(&self) -> bool {
        (self.remaining_mg + self.sold_mg - self.total_mg).abs() < 1e-6
            && self.remaining_mg >= -1e-6
    }
}

// ============================================================================
// Cash-Flow Types
// ============================================================================

/// Direction of a cash-flow entry
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    #[serde(rename = "entrada")]
    Inflow,
    #[serde(rename = "saida")]
    Outflow,
}

/// Settlement status of a cash-flow entry
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CashFlowStatus {
    #[serde(rename = "pago")]
    Paid,
    #[serde(rename = "pendente")]
    Pending,
    #[serde(rename = "vencido")]
    Overdue,
}

/// A single cash-flow ledger entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CashFlowEntry {
    pub id: Uuid,
    pub kind: EntryKind,
    pub description: String,
    pub amount: f64,
    pub status: CashFlowStatus,
    pub purchase_date: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    /// Installment label, e.g. "3/10"
    pub installment: Option<String>,
    pub method: Option<PaymentMethod>,
    /// Originating sale, if any; deleting that sale removes every entry
    /// carrying its id
    pub sale_id: Option<Uuid>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Price table entry for one dose strength
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DosePrice {
    pub dose_mg: f64,
    pub price: f64,
}

/// Reward points awarded per dose of one strength
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DosePoints {
    pub dose_mg: f64,
    pub points: i64,
}

/// Loyalty reward configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RewardSettings {
    pub points_per_dose: Vec<DosePoints>,
    /// Conversion rate when points are spent on a sale
    pub points_to_brl: f64,
    pub referral_bonus_points: i64,
}

/// Persisted business configuration read by the reconciler
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub dose_prices: Vec<DosePrice>,
    pub rewards: RewardSettings,
    pub daily_late_fee: f64,
}

// ============================================================================
// Dataset Type
// ============================================================================

/// The whole shared dataset: one flat collection per entity type
///
/// Every engine operation is a read-modify-write over this aggregate;
/// the store commits it as a single unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub patients: Vec<Patient>,
    pub sales: Vec<Sale>,
    pub vials: Vec<Vial>,
    pub cash_flow: Vec<CashFlowEntry>,
    pub settings: Settings,
}

impl Default for Dataset {
    fn default() -> Self {
        Self {
            patients: Vec::new(),
            sales: Vec::new(),
            vials: Vec::new(),
            cash_flow: Vec::new(),
            settings: crate::settings::default_settings().clone(),
        }
    }
}

impl Dataset {
    pub fn patient(&self, id: Uuid) -> Option<&Patient> {
        self.patients.iter().find(|p| p.id == id)
    }

    pub fn patient_mut(&mut self, id: Uuid) -> Option<&mut Patient> {
        self.patients.iter_mut().find(|p| p.id == id)
    }

    pub fn sale(&self, id: Uuid) -> Option<&Sale> {
        self.sales.iter().find(|s| s.id == id)
    }

    pub fn sale_mut(&mut self, id: Uuid) -> Option<&mut Sale> {
        self.sales.iter_mut().find(|s| s.id == id)
    }

    pub fn vial_mut(&mut self, id: Uuid) -> Option<&mut Vial> {
        self.vials.iter_mut().find(|v| v.id == id)
    }
}
