//! The sale fulfillment reconciler and entity operations.
//!
//! `Engine` owns the in-memory dataset and the store. Every mutating
//! operation runs as a whole-dataset transaction: the dataset is cloned,
//! the clone is mutated, the store commits it, and only then does the
//! clone replace the in-memory copy. A failure at any step leaves both
//! memory and disk exactly as they were.
//!
//! `&mut self` on every mutating operation serializes callers; there is
//! no concurrency inside the engine.

use crate::cashflow::{self, PaymentPlan};
use crate::forecast::{forecast_rupture, StockForecast};
use crate::inventory::deplete_fifo;
use crate::points;
use crate::schedule::{self, DEFAULT_TOTAL_DOSES};
use crate::store::Store;
use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

// ============================================================================
// Operation Inputs
// ============================================================================

/// Input for creating a patient
#[derive(Clone, Debug, Default)]
pub struct NewPatient {
    pub name: String,
    pub phone: Option<String>,
    pub birth_date: Option<chrono::NaiveDate>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    /// Anchor date; when set, a full schedule is generated
    pub treatment_start: Option<DateTime<Utc>>,
    pub default_dose_mg: f64,
    pub default_price: f64,
    pub total_doses: Option<u32>,
    /// Referring patient; earns the configured referral bonus
    pub referred_by: Option<Uuid>,
}

/// Partial patient update; `None` leaves a field untouched
#[derive(Clone, Debug, Default)]
pub struct PatientUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub default_dose_mg: Option<f64>,
    pub default_price: Option<f64>,
    /// New anchor date; regenerates the schedule around the
    /// administered prefix
    pub treatment_start: Option<DateTime<Utc>>,
}

/// Bioimpedance measurements accompanying a sale or consultation
#[derive(Clone, Debug, Default)]
pub struct Bioimpedance {
    pub weight_kg: Option<f64>,
    pub body_fat_pct: Option<f64>,
    pub muscle_mass_kg: Option<f64>,
    pub visceral_fat: Option<f64>,
    pub notes: Option<String>,
}

/// Input for creating a sale
#[derive(Clone, Debug)]
pub struct NewSale {
    pub patient_id: Uuid,
    pub dose_mg: f64,
    pub quantity: u32,
    pub price: f64,
    pub discount_per_dose: f64,
    pub points_used: i64,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub due_date: Option<DateTime<Utc>>,
    pub installments: u32,
    pub operator_fee: f64,
    /// How many of the sale's doses are delivered on the spot
    pub deliver_immediately: u32,
    pub bioimpedance: Option<Bioimpedance>,
    /// Sale date; defaults to now
    pub date: Option<DateTime<Utc>>,
}

/// Input for registering a stock lot
#[derive(Clone, Debug)]
pub struct NewVial {
    pub purchase_date: DateTime<Utc>,
    pub total_mg: f64,
    pub cost: f64,
}

/// Input for a manual cash-flow entry
#[derive(Clone, Debug)]
pub struct NewCashFlow {
    pub kind: EntryKind,
    pub description: String,
    pub amount: f64,
    pub status: PaymentStatus,
    pub method: Option<PaymentMethod>,
    pub date: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub installments: u32,
}

/// Partial cash-flow entry update; `None` leaves a field untouched
#[derive(Clone, Debug, Default)]
pub struct CashFlowUpdate {
    pub status: Option<CashFlowStatus>,
    pub amount: Option<f64>,
    pub due_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

// ============================================================================
// Engine
// ============================================================================

/// Single-writer business engine over the shared dataset
pub struct Engine<S: Store> {
    store: S,
    dataset: Dataset,
}

impl<S: Store> Engine<S> {
    /// Open the engine, loading the dataset from the store
    pub fn open(store: S) -> Result<Self> {
        let dataset = store.load()?;
        tracing::info!(
            "Engine opened: {} patients, {} sales, {} vials, {} cash-flow entries",
            dataset.patients.len(),
            dataset.sales.len(),
            dataset.vials.len(),
            dataset.cash_flow.len()
        );
        Ok(Self { store, dataset })
    }

    /// Run a mutation as a whole-dataset transaction
    ///
    /// The closure mutates a clone; the clone only replaces the live
    /// dataset after the store commits it. Failure anywhere leaves
    /// memory and disk untouched.
    fn with_txn<T>(&mut self, f: impl FnOnce(&mut Dataset) -> Result<T>) -> Result<T> {
        let mut draft = self.dataset.clone();
        let value = f(&mut draft)?;
        self.store.commit(&draft)?;
        self.dataset = draft;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Patients
    // ------------------------------------------------------------------

    /// Create a patient, generating the dose schedule when an anchor
    /// date is given and crediting the referrer's bonus if any
    pub fn create_patient(&mut self, new: NewPatient) -> Result<Uuid> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("Patient name must not be empty".into()));
        }
        if new.default_dose_mg <= 0.0 || !new.default_dose_mg.is_finite() {
            return Err(Error::Validation(format!(
                "Invalid default dose {} mg",
                new.default_dose_mg
            )));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        self.with_txn(|data| {
            let total_doses = new.total_doses.unwrap_or(DEFAULT_TOTAL_DOSES);
            let doses = match new.treatment_start {
                Some(anchor) => schedule::generate_schedule(anchor, total_doses, 1, &[]),
                None => Vec::new(),
            };

            if let Some(referrer_id) = new.referred_by {
                let bonus = data.settings.rewards.referral_bonus_points;
                let referrer = data.patient_mut(referrer_id).ok_or(Error::NotFound {
                    entity: "patient",
                    id: referrer_id.to_string(),
                })?;
                points::earn(referrer, bonus, &format!("Indicação de {}", new.name), now)?;
            }

            data.patients.push(Patient {
                id,
                name: new.name.clone(),
                phone: new.phone.clone(),
                birth_date: new.birth_date,
                height_cm: new.height_cm,
                weight_kg: new.weight_kg,
                treatment_start: new.treatment_start,
                default_dose_mg: new.default_dose_mg,
                default_price: new.default_price,
                doses,
                evolutions: Vec::new(),
                points: 0,
                point_history: Vec::new(),
                referred_by: new.referred_by,
                created_at: now,
            });

            tracing::info!("Created patient {} ({})", new.name, id);
            Ok(id)
        })
    }

    /// Fetch a patient by id
    pub fn patient(&self, id: Uuid) -> Result<&Patient> {
        self.dataset.patient(id).ok_or(Error::NotFound {
            entity: "patient",
            id: id.to_string(),
        })
    }

    /// All patients
    pub fn list_patients(&self) -> &[Patient] {
        &self.dataset.patients
    }

    /// Apply a partial update; an anchor-date change regenerates the
    /// schedule with the administered prefix kept fixed
    pub fn update_patient(&mut self, id: Uuid, update: PatientUpdate) -> Result<()> {
        self.with_txn(|data| {
            let patient = data.patient_mut(id).ok_or(Error::NotFound {
                entity: "patient",
                id: id.to_string(),
            })?;

            if let Some(name) = update.name {
                patient.name = name;
            }
            if let Some(phone) = update.phone {
                patient.phone = Some(phone);
            }
            if let Some(height) = update.height_cm {
                patient.height_cm = Some(height);
            }
            if let Some(weight) = update.weight_kg {
                patient.weight_kg = Some(weight);
            }
            if let Some(dose) = update.default_dose_mg {
                if dose <= 0.0 || !dose.is_finite() {
                    return Err(Error::Validation(format!("Invalid default dose {} mg", dose)));
                }
                patient.default_dose_mg = dose;
            }
            if let Some(price) = update.default_price {
                if price < 0.0 || !price.is_finite() {
                    return Err(Error::Validation(format!("Invalid default price {}", price)));
                }
                patient.default_price = price;
            }

            if let Some(anchor) = update.treatment_start {
                let total = patient.doses.len().max(DEFAULT_TOTAL_DOSES as usize) as u32;
                patient.doses = schedule::regenerate_pending(&patient.doses, anchor, total);
                patient.treatment_start = Some(anchor);
                tracing::info!("Regenerated schedule for patient {} from {}", id, anchor);
            }

            Ok(())
        })
    }

    /// Move a single dose to a new date and cascade the rest
    pub fn reschedule_dose(
        &mut self,
        patient_id: Uuid,
        dose_number: u32,
        new_date: DateTime<Utc>,
    ) -> Result<()> {
        self.with_txn(|data| {
            let patient = data.patient_mut(patient_id).ok_or(Error::NotFound {
                entity: "patient",
                id: patient_id.to_string(),
            })?;

            let dose = patient.dose_mut(dose_number).ok_or(Error::NotFound {
                entity: "dose",
                id: format!("{}#{}", patient_id, dose_number),
            })?;
            dose.date = new_date;

            schedule::cascade_after(&mut patient.doses, dose_number);
            Ok(())
        })
    }

    /// Record a bioimpedance evolution for a patient
    pub fn record_evolution(
        &mut self,
        patient_id: Uuid,
        bio: Bioimpedance,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let evolution_id = Uuid::new_v4();
        self.with_txn(|data| {
            let patient = data.patient_mut(patient_id).ok_or(Error::NotFound {
                entity: "patient",
                id: patient_id.to_string(),
            })?;
            patient.evolutions.push(Evolution {
                id: evolution_id,
                date: at,
                weight_kg: bio.weight_kg,
                body_fat_pct: bio.body_fat_pct,
                muscle_mass_kg: bio.muscle_mass_kg,
                visceral_fat: bio.visceral_fat,
                notes: bio.notes.clone(),
            });
            Ok(evolution_id)
        })
    }

    /// Delete a bioimpedance evolution
    pub fn delete_evolution(&mut self, patient_id: Uuid, evolution_id: Uuid) -> Result<()> {
        self.with_txn(|data| {
            let patient = data.patient_mut(patient_id).ok_or(Error::NotFound {
                entity: "patient",
                id: patient_id.to_string(),
            })?;
            let before = patient.evolutions.len();
            patient.evolutions.retain(|e| e.id != evolution_id);
            if patient.evolutions.len() == before {
                return Err(Error::NotFound {
                    entity: "evolution",
                    id: evolution_id.to_string(),
                });
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Sales
    // ------------------------------------------------------------------

    /// Create a sale and reconcile schedule, points and cash-flow
    ///
    /// The whole creation is one transaction: insufficient points, an
    /// allocation shortfall or an immediate-delivery stock failure abort
    /// with no partial state persisted.
    pub fn add_sale(&mut self, new: NewSale) -> Result<Uuid> {
        if new.quantity == 0 {
            return Err(Error::Validation("Sale quantity must be at least 1".into()));
        }
        if new.deliver_immediately > new.quantity {
            return Err(Error::Validation(format!(
                "Cannot deliver {} doses of a {}-dose sale immediately",
                new.deliver_immediately, new.quantity
            )));
        }
        for (label, value) in [
            ("price", new.price),
            ("discount", new.discount_per_dose),
            ("operator fee", new.operator_fee),
            ("dose strength", new.dose_mg),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Validation(format!("Invalid {}: {}", label, value)));
            }
        }
        if new.points_used < 0 {
            return Err(Error::Validation(format!(
                "Invalid points amount: {}",
                new.points_used
            )));
        }

        let sale_id = Uuid::new_v4();
        let sale_date = new.date.unwrap_or_else(Utc::now);

        self.with_txn(|data| {
            let points_to_brl = data.settings.rewards.points_to_brl;
            let points_earned =
                data.settings.points_for_dose(new.dose_mg) * new.quantity as i64;

            let patient = data.patient_mut(new.patient_id).ok_or(Error::NotFound {
                entity: "patient",
                id: new.patient_id.to_string(),
            })?;
            let patient_name = patient.name.clone();

            let total = cashflow::round2(
                ((new.price - new.discount_per_dose) * new.quantity as f64
                    - new.points_used as f64 * points_to_brl)
                    .max(0.0),
            );
            let per_dose = cashflow::round2(total / new.quantity as f64);

            if let Some(bio) = &new.bioimpedance {
                patient.evolutions.push(Evolution {
                    id: Uuid::new_v4(),
                    date: sale_date,
                    weight_kg: bio.weight_kg,
                    body_fat_pct: bio.body_fat_pct,
                    muscle_mass_kg: bio.muscle_mass_kg,
                    visceral_fat: bio.visceral_fat,
                    notes: bio.notes.clone(),
                });
            }

            // Fulfillment targets the oldest open doses first
            let pending = patient.pending_dose_numbers();
            if (pending.len() as u32) < new.quantity {
                return Err(Error::Validation(format!(
                    "Patient has {} pending dose(s), sale covers {}",
                    pending.len(),
                    new.quantity
                )));
            }
            let allocated: Vec<u32> = pending
                .into_iter()
                .take(new.quantity as usize)
                .collect();

            for &number in &allocated {
                let dose = patient.dose_mut(number).ok_or(Error::NotFound {
                    entity: "dose",
                    id: format!("{}#{}", new.patient_id, number),
                })?;
                dose.payment = PaymentInfo {
                    status: new.payment_status,
                    method: new.payment_method,
                    amount: Some(per_dose),
                    date: Some(sale_date),
                    due_date: new.due_date,
                    installments: Some(new.installments),
                };
            }

            // Points: redemption first (may abort the whole sale)
            if new.points_used > 0 {
                points::redeem(
                    patient,
                    new.points_used,
                    "Resgate de pontos na venda",
                    sale_date,
                )?;
            }
            points::earn(
                patient,
                points_earned,
                &format!("Compra de {} dose(s) de {} mg", new.quantity, new.dose_mg),
                sale_date,
            )?;

            data.sales.push(Sale {
                id: sale_id,
                patient_id: new.patient_id,
                date: sale_date,
                quantity: new.quantity,
                sold_dose_mg: new.dose_mg,
                price: new.price,
                discount_per_dose: new.discount_per_dose,
                points_used: new.points_used,
                total,
                payment_status: new.payment_status,
                payment_method: new.payment_method,
                due_date: new.due_date,
                installments: new.installments,
                operator_fee: new.operator_fee,
                deliveries: allocated
                    .iter()
                    .map(|&number| Delivery {
                        dose_number: number,
                        status: DeliveryStatus::Scheduling,
                        delivery_date: None,
                    })
                    .collect(),
                vial_usage: Vec::new(),
            });

            // Immediate deliveries run the full administration path
            for &number in allocated.iter().take(new.deliver_immediately as usize) {
                deliver_dose(data, sale_id, number, sale_date)?;
            }

            // Cash flow for the net amount
            let plan = PaymentPlan {
                kind: EntryKind::Inflow,
                description: format!("Venda para {}", patient_name),
                amount: total,
                operator_fee: new.operator_fee,
                status: new.payment_status,
                method: new.payment_method,
                date: sale_date,
                due_date: new.due_date,
                installments: new.installments,
                sale_id: Some(sale_id),
            };
            data.cash_flow.extend(cashflow::project(&plan));

            tracing::info!(
                "Sale {} created for patient {}: {} x {} mg, total {}",
                sale_id,
                new.patient_id,
                new.quantity,
                new.dose_mg,
                total
            );
            Ok(sale_id)
        })
    }

    /// Delete a sale, removing its cash-flow projections
    ///
    /// Administered doses stay administered and inventory is not
    /// restocked; only the derived projections go.
    pub fn delete_sale(&mut self, sale_id: Uuid) -> Result<()> {
        self.with_txn(|data| {
            let before = data.sales.len();
            data.sales.retain(|s| s.id != sale_id);
            if data.sales.len() == before {
                return Err(Error::NotFound {
                    entity: "sale",
                    id: sale_id.to_string(),
                });
            }
            data.cash_flow.retain(|e| e.sale_id != Some(sale_id));
            tracing::info!("Deleted sale {} and its cash-flow entries", sale_id);
            Ok(())
        })
    }

    /// All sales
    pub fn list_sales(&self) -> &[Sale] {
        &self.dataset.sales
    }

    /// Transition a delivery's status
    ///
    /// Transition to delivered runs the administration path: FIFO stock
    /// depletion, dose administration and the reschedule cascade.
    /// Re-entering delivered is a no-op (inventory is deducted exactly
    /// once); leaving it is rejected.
    pub fn update_delivery(
        &mut self,
        sale_id: Uuid,
        dose_number: u32,
        status: DeliveryStatus,
        delivery_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_txn(|data| {
            let sale = data.sale(sale_id).ok_or(Error::NotFound {
                entity: "sale",
                id: sale_id.to_string(),
            })?;
            let current = sale
                .deliveries
                .iter()
                .find(|d| d.dose_number == dose_number)
                .ok_or(Error::NotFound {
                    entity: "delivery",
                    id: format!("{}#{}", sale_id, dose_number),
                })?
                .status;

            if current == DeliveryStatus::Delivered {
                if status == DeliveryStatus::Delivered {
                    tracing::debug!(
                        "Delivery {}#{} already delivered, ignoring",
                        sale_id,
                        dose_number
                    );
                    return Ok(());
                }
                return Err(Error::Validation(
                    "Delivered is a terminal delivery status".into(),
                ));
            }

            if status == DeliveryStatus::Delivered {
                let date = delivery_date.unwrap_or_else(Utc::now);
                deliver_dose(data, sale_id, dose_number, date)?;
            } else {
                let sale = data.sale_mut(sale_id).ok_or(Error::NotFound {
                    entity: "sale",
                    id: sale_id.to_string(),
                })?;
                let delivery = sale.delivery_mut(dose_number).ok_or(Error::NotFound {
                    entity: "delivery",
                    id: format!("{}#{}", sale_id, dose_number),
                })?;
                delivery.status = status;
                delivery.delivery_date = delivery_date;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------

    /// Register stock lots, with a paired outbound cash-flow entry for
    /// the batch cost
    pub fn add_stock(&mut self, lots: Vec<NewVial>) -> Result<Vec<Uuid>> {
        if lots.is_empty() {
            return Err(Error::Validation("No stock lots given".into()));
        }
        for lot in &lots {
            if lot.total_mg <= 0.0 || !lot.total_mg.is_finite() {
                return Err(Error::Validation(format!(
                    "Invalid lot size {} mg",
                    lot.total_mg
                )));
            }
            if lot.cost < 0.0 || !lot.cost.is_finite() {
                return Err(Error::Validation(format!("Invalid lot cost {}", lot.cost)));
            }
        }

        self.with_txn(|data| {
            let total_cost: f64 = lots.iter().map(|l| l.cost).sum();
            let total_mg: f64 = lots.iter().map(|l| l.total_mg).sum();
            let earliest = lots
                .iter()
                .map(|l| l.purchase_date)
                .min()
                .unwrap_or_else(Utc::now);

            let ids: Vec<Uuid> = lots
                .iter()
                .map(|lot| {
                    let id = Uuid::new_v4();
                    data.vials.push(Vial {
                        id,
                        purchase_date: lot.purchase_date,
                        total_mg: lot.total_mg,
                        cost: lot.cost,
                        remaining_mg: lot.total_mg,
                        sold_mg: 0.0,
                    });
                    id
                })
                .collect();

            data.cash_flow.push(CashFlowEntry {
                id: Uuid::new_v4(),
                kind: EntryKind::Outflow,
                description: format!("Compra de estoque ({} mg)", total_mg),
                amount: cashflow::round2(total_cost),
                status: CashFlowStatus::Paid,
                purchase_date: earliest,
                due_date: None,
                installment: None,
                method: None,
                sale_id: None,
            });

            tracing::info!("Added {} stock lot(s), {} mg total", ids.len(), total_mg);
            Ok(ids)
        })
    }

    /// Adjust a lot's remaining quantity with a reason
    ///
    /// Shrinks or grows `total_mg` together with `remaining_mg` so the
    /// lot invariant holds, and records a compensating cash-flow entry
    /// sized by the lot's proportional cost.
    pub fn adjust_vial(&mut self, vial_id: Uuid, new_remaining_mg: f64, reason: &str) -> Result<()> {
        if new_remaining_mg < 0.0 || !new_remaining_mg.is_finite() {
            return Err(Error::Validation(format!(
                "Invalid remaining amount {} mg",
                new_remaining_mg
            )));
        }

        self.with_txn(|data| {
            let vial = data.vial_mut(vial_id).ok_or(Error::NotFound {
                entity: "vial",
                id: vial_id.to_string(),
            })?;

            let delta_mg = new_remaining_mg - vial.remaining_mg;
            if delta_mg.abs() < 1e-9 {
                return Ok(());
            }

            let unit_cost = if vial.total_mg > 0.0 {
                vial.cost / vial.total_mg
            } else {
                0.0
            };
            let compensation = cashflow::round2(delta_mg.abs() * unit_cost);

            vial.remaining_mg = new_remaining_mg;
            vial.total_mg += delta_mg;
            debug_assert!(vial.invariant_holds());

            data.cash_flow.push(CashFlowEntry {
                id: Uuid::new_v4(),
                kind: if delta_mg < 0.0 {
                    EntryKind::Outflow
                } else {
                    EntryKind::Inflow
                },
                description: format!("Ajuste de estoque: {}", reason),
                amount: compensation,
                status: CashFlowStatus::Paid,
                purchase_date: Utc::now(),
                due_date: None,
                installment: None,
                method: None,
                sale_id: None,
            });

            tracing::info!(
                "Adjusted vial {} by {} mg ({})",
                vial_id,
                delta_mg,
                reason
            );
            Ok(())
        })
    }

    /// All stock lots
    pub fn list_vials(&self) -> &[Vial] {
        &self.dataset.vials
    }

    /// Forecast the stock rupture against scheduled demand
    pub fn forecast(&self, lead_time_days: i64, today: DateTime<Utc>) -> StockForecast {
        forecast_rupture(
            &self.dataset.vials,
            &self.dataset.patients,
            lead_time_days,
            today,
        )
    }

    // ------------------------------------------------------------------
    // Cash flow
    // ------------------------------------------------------------------

    /// Add a manual cash-flow entry, expanding installments
    pub fn add_cash_flow(&mut self, new: NewCashFlow) -> Result<Vec<Uuid>> {
        if new.amount < 0.0 || !new.amount.is_finite() {
            return Err(Error::Validation(format!("Invalid amount {}", new.amount)));
        }

        self.with_txn(|data| {
            let plan = PaymentPlan {
                kind: new.kind,
                description: new.description.clone(),
                amount: new.amount,
                operator_fee: 0.0,
                status: new.status,
                method: new.method,
                date: new.date,
                due_date: new.due_date,
                installments: new.installments,
                sale_id: None,
            };
            let entries = cashflow::project(&plan);
            let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
            data.cash_flow.extend(entries);
            Ok(ids)
        })
    }

    /// Apply a partial update to a cash-flow entry
    pub fn update_cash_flow(&mut self, entry_id: Uuid, update: CashFlowUpdate) -> Result<()> {
        self.with_txn(|data| {
            let entry = data
                .cash_flow
                .iter_mut()
                .find(|e| e.id == entry_id)
                .ok_or(Error::NotFound {
                    entity: "cash-flow entry",
                    id: entry_id.to_string(),
                })?;

            if let Some(status) = update.status {
                entry.status = status;
            }
            if let Some(amount) = update.amount {
                if amount < 0.0 || !amount.is_finite() {
                    return Err(Error::Validation(format!("Invalid amount {}", amount)));
                }
                entry.amount = amount;
            }
            if let Some(due) = update.due_date {
                entry.due_date = Some(due);
            }
            if let Some(description) = update.description {
                entry.description = description;
            }
            Ok(())
        })
    }

    /// Delete a single cash-flow entry
    pub fn delete_cash_flow(&mut self, entry_id: Uuid) -> Result<()> {
        self.with_txn(|data| {
            let before = data.cash_flow.len();
            data.cash_flow.retain(|e| e.id != entry_id);
            if data.cash_flow.len() == before {
                return Err(Error::NotFound {
                    entity: "cash-flow entry",
                    id: entry_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// All cash-flow entries
    pub fn list_cash_flow(&self) -> &[CashFlowEntry] {
        &self.dataset.cash_flow
    }

    /// Persist the overdue status of pendente entries past their due
    /// date; returns how many were flipped
    pub fn mark_overdue_entries(&mut self, today: DateTime<Utc>) -> Result<usize> {
        self.with_txn(|data| {
            let mut count = 0;
            for entry in &mut data.cash_flow {
                if entry.status == CashFlowStatus::Pending
                    && cashflow::effective_status(entry, today) == CashFlowStatus::Overdue
                {
                    entry.status = CashFlowStatus::Overdue;
                    count += 1;
                }
            }
            if count > 0 {
                tracing::info!("Marked {} cash-flow entries overdue", count);
            }
            Ok(count)
        })
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Current business settings
    pub fn settings(&self) -> &Settings {
        &self.dataset.settings
    }

    /// Replace the business settings (validated first)
    pub fn update_settings(&mut self, settings: Settings) -> Result<()> {
        let errors = settings.validate();
        if !errors.is_empty() {
            return Err(Error::Validation(format!(
                "Invalid settings: {}",
                errors.join("; ")
            )));
        }
        self.with_txn(|data| {
            data.settings = settings.clone();
            Ok(())
        })
    }
}

/// Administer one dose of a sale: deplete stock, mark the patient dose
/// administered at the delivery date, cascade the remaining schedule and
/// record the delivery transition
///
/// Runs inside a transaction; an `InsufficientStock` failure propagates
/// before any of those writes become visible.
fn deliver_dose(
    data: &mut Dataset,
    sale_id: Uuid,
    dose_number: u32,
    delivery_date: DateTime<Utc>,
) -> Result<()> {
    let (patient_id, sold_dose_mg) = {
        let sale = data.sale(sale_id).ok_or(Error::NotFound {
            entity: "sale",
            id: sale_id.to_string(),
        })?;
        (sale.patient_id, sale.sold_dose_mg)
    };

    let allocations = deplete_fifo(&mut data.vials, sold_dose_mg)?;
    let mg_consumed: f64 = allocations.iter().map(|a| a.mg_used).sum();

    let sale = data.sale_mut(sale_id).ok_or(Error::NotFound {
        entity: "sale",
        id: sale_id.to_string(),
    })?;
    for usage in allocations {
        sale.record_vial_usage(usage);
    }
    let delivery = sale.delivery_mut(dose_number).ok_or(Error::NotFound {
        entity: "delivery",
        id: format!("{}#{}", sale_id, dose_number),
    })?;
    delivery.status = DeliveryStatus::Delivered;
    delivery.delivery_date = Some(delivery_date);

    let patient = data.patient_mut(patient_id).ok_or(Error::NotFound {
        entity: "patient",
        id: patient_id.to_string(),
    })?;
    let dose = patient.dose_mut(dose_number).ok_or(Error::NotFound {
        entity: "dose",
        id: format!("{}#{}", patient_id, dose_number),
    })?;
    dose.status = DoseStatus::Administered;
    dose.date = delivery_date;
    dose.administered_mg = Some(mg_consumed);

    schedule::cascade_after(&mut patient.doses, dose_number);

    tracing::info!(
        "Delivered dose {} of sale {} ({} mg consumed)",
        dose_number,
        sale_id,
        mg_consumed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::balance_from_history;
    use crate::store::MemStore;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn engine() -> Engine<MemStore> {
        Engine::open(MemStore::new()).unwrap()
    }

    fn add_patient(engine: &mut Engine<MemStore>, anchor: DateTime<Utc>) -> Uuid {
        engine
            .create_patient(NewPatient {
                name: "Maria Silva".into(),
                treatment_start: Some(anchor),
                default_dose_mg: 5.0,
                default_price: 220.0,
                ..Default::default()
            })
            .unwrap()
    }

    fn add_vial(engine: &mut Engine<MemStore>, day: u32, mg: f64) -> Uuid {
        engine
            .add_stock(vec![NewVial {
                purchase_date: date(2024, 1, day),
                total_mg: mg,
                cost: mg * 20.0,
            }])
            .unwrap()[0]
    }

    fn basic_sale(patient_id: Uuid) -> NewSale {
        NewSale {
            patient_id,
            dose_mg: 5.0,
            quantity: 3,
            price: 220.0,
            discount_per_dose: 20.0,
            points_used: 0,
            payment_status: PaymentStatus::Paid,
            payment_method: Some(PaymentMethod::Pix),
            due_date: None,
            installments: 1,
            operator_fee: 0.0,
            deliver_immediately: 0,
            bioimpedance: None,
            date: Some(date(2024, 2, 1)),
        }
    }

    #[test]
    fn test_create_patient_generates_schedule() {
        let mut engine = engine();
        let id = add_patient(&mut engine, date(2024, 1, 1));

        let patient = engine.patient(id).unwrap();
        assert_eq!(patient.doses.len(), 12);
        assert_eq!(patient.doses[0].date, date(2024, 1, 1));
        assert_eq!(patient.doses[1].date, date(2024, 1, 8));
    }

    #[test]
    fn test_referral_credits_bonus_to_referrer() {
        let mut engine = engine();
        let referrer = add_patient(&mut engine, date(2024, 1, 1));

        engine
            .create_patient(NewPatient {
                name: "João".into(),
                default_dose_mg: 5.0,
                default_price: 220.0,
                referred_by: Some(referrer),
                ..Default::default()
            })
            .unwrap();

        let referrer = engine.patient(referrer).unwrap();
        assert_eq!(referrer.points, 120);
        assert_eq!(referrer.points, balance_from_history(referrer));
    }

    #[test]
    fn test_sale_total_and_even_split() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        // (220 - 20) * 3 = 600, 200 per dose
        engine.add_sale(basic_sale(patient_id)).unwrap();

        let sale = &engine.list_sales()[0];
        assert_eq!(sale.total, 600.0);

        let patient = engine.patient(patient_id).unwrap();
        let paid: Vec<&Dose> = patient
            .doses
            .iter()
            .filter(|d| d.payment.amount.is_some())
            .collect();
        assert_eq!(paid.len(), 3);
        // Oldest open doses first
        assert_eq!(
            paid.iter().map(|d| d.dose_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for dose in paid {
            assert_eq!(dose.payment.amount, Some(200.0));
            assert_eq!(dose.payment.status, PaymentStatus::Paid);
        }
    }

    #[test]
    fn test_sale_earns_points_and_creates_cash_flow() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        engine.add_sale(basic_sale(patient_id)).unwrap();

        // 15 points per 5 mg dose x 3
        let patient = engine.patient(patient_id).unwrap();
        assert_eq!(patient.points, 45);

        let entries = engine.list_cash_flow();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 600.0);
        assert_eq!(entries[0].kind, EntryKind::Inflow);
        assert!(entries[0].sale_id.is_some());
    }

    #[test]
    fn test_sale_with_points_redemption() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        // Seed a balance
        engine.add_sale(basic_sale(patient_id)).unwrap();
        let balance = engine.patient(patient_id).unwrap().points;
        assert_eq!(balance, 45);

        let mut sale = basic_sale(patient_id);
        sale.points_used = 40;
        engine.add_sale(sale).unwrap();

        // (220-20)*3 - 40*1.0 = 560
        assert_eq!(engine.list_sales()[1].total, 560.0);
        let patient = engine.patient(patient_id).unwrap();
        // 45 - 40 + 45 earned
        assert_eq!(patient.points, 50);
        assert_eq!(patient.points, balance_from_history(patient));
    }

    #[test]
    fn test_sale_insufficient_points_aborts_whole_creation() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        let mut sale = basic_sale(patient_id);
        sale.points_used = 500;
        let err = engine.add_sale(sale).unwrap_err();
        assert!(matches!(err, Error::InsufficientPoints { .. }));

        // No partial state: no sale, no cash flow, no payment snapshots
        assert!(engine.list_sales().is_empty());
        assert!(engine.list_cash_flow().is_empty());
        let patient = engine.patient(patient_id).unwrap();
        assert!(patient.doses.iter().all(|d| d.payment.amount.is_none()));
        assert!(patient.evolutions.is_empty());
    }

    #[test]
    fn test_delivery_administers_and_cascades() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));
        add_vial(&mut engine, 1, 100.0);
        let sale_id = engine.add_sale(basic_sale(patient_id)).unwrap();

        // Deliver dose 1 three days late
        engine
            .update_delivery(sale_id, 1, DeliveryStatus::Delivered, Some(date(2024, 1, 4)))
            .unwrap();

        let patient = engine.patient(patient_id).unwrap();
        assert_eq!(patient.doses[0].status, DoseStatus::Administered);
        assert_eq!(patient.doses[0].date, date(2024, 1, 4));
        assert_eq!(patient.doses[0].administered_mg, Some(5.0));
        // Cascade: dose 2 follows the late delivery
        assert_eq!(patient.doses[1].date, date(2024, 1, 11));
        assert_eq!(patient.doses[2].date, date(2024, 1, 18));

        let sale = &engine.list_sales()[0];
        assert_eq!(sale.deliveries[0].status, DeliveryStatus::Delivered);
        assert_eq!(sale.vial_usage.len(), 1);
        assert_eq!(sale.vial_usage[0].mg_used, 5.0);
    }

    #[test]
    fn test_delivery_is_idempotent() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));
        add_vial(&mut engine, 1, 100.0);
        let sale_id = engine.add_sale(basic_sale(patient_id)).unwrap();

        engine
            .update_delivery(sale_id, 1, DeliveryStatus::Delivered, Some(date(2024, 1, 1)))
            .unwrap();
        engine
            .update_delivery(sale_id, 1, DeliveryStatus::Delivered, Some(date(2024, 1, 2)))
            .unwrap();

        // Inventory deducted exactly once
        let vials = engine.list_vials();
        assert_eq!(vials[0].remaining_mg, 95.0);
        assert_eq!(engine.list_sales()[0].vial_usage[0].mg_used, 5.0);
        // Leaving the terminal state is rejected
        let err = engine
            .update_delivery(sale_id, 1, DeliveryStatus::Processing, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_delivery_insufficient_stock_rolls_back() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));
        // 10 mg in stock, sale needs 20 mg per dose
        let vial_id = engine
            .add_stock(vec![NewVial {
                purchase_date: date(2024, 1, 1),
                total_mg: 10.0,
                cost: 200.0,
            }])
            .unwrap()[0];

        let mut sale = basic_sale(patient_id);
        sale.dose_mg = 20.0;
        let sale_id = engine.add_sale(sale).unwrap();

        let err = engine
            .update_delivery(sale_id, 1, DeliveryStatus::Delivered, Some(date(2024, 2, 2)))
            .unwrap_err();
        match err {
            Error::InsufficientStock { shortfall_mg } => {
                assert!((shortfall_mg - 10.0).abs() < 1e-9)
            }
            other => panic!("Expected InsufficientStock, got {:?}", other),
        }

        // Dose still pending, lot untouched, delivery not transitioned
        let patient = engine.patient(patient_id).unwrap();
        assert_eq!(patient.doses[0].status, DoseStatus::Pending);
        let vial = engine
            .list_vials()
            .iter()
            .find(|v| v.id == vial_id)
            .unwrap();
        assert_eq!(vial.remaining_mg, 10.0);
        assert_eq!(
            engine.list_sales()[0].deliveries[0].status,
            DeliveryStatus::Scheduling
        );
    }

    #[test]
    fn test_immediate_delivery_spans_lots_and_merges_usage() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));
        // Older lot 7 mg, newer lot 50 mg; two immediate 5 mg doses
        let a = add_vial(&mut engine, 5, 7.0);
        let b = add_vial(&mut engine, 20, 50.0);

        let mut sale = basic_sale(patient_id);
        sale.deliver_immediately = 2;
        engine.add_sale(sale).unwrap();

        let sale = &engine.list_sales()[0];
        // First dose: 5 from A. Second dose: 2 from A + 3 from B, merged
        assert_eq!(
            sale.vial_usage,
            vec![
                VialUsage { vial_id: a, mg_used: 7.0 },
                VialUsage { vial_id: b, mg_used: 3.0 },
            ]
        );
        let vials = engine.list_vials();
        assert_eq!(vials.iter().find(|v| v.id == a).unwrap().remaining_mg, 0.0);
        assert_eq!(vials.iter().find(|v| v.id == b).unwrap().remaining_mg, 47.0);
        assert!(vials.iter().all(|v| v.invariant_holds()));
    }

    #[test]
    fn test_immediate_delivery_failure_aborts_sale() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));
        add_vial(&mut engine, 1, 4.0); // not enough for one 5 mg dose

        let mut sale = basic_sale(patient_id);
        sale.deliver_immediately = 1;
        let err = engine.add_sale(sale).unwrap_err();
        assert!(matches!(err, Error::InsufficientStock { .. }));

        // The whole sale creation rolled back
        assert!(engine.list_sales().is_empty());
        let patient = engine.patient(patient_id).unwrap();
        assert_eq!(patient.points, 0);
        assert!(patient.doses.iter().all(|d| d.payment.amount.is_none()));
        assert_eq!(engine.list_vials()[0].remaining_mg, 4.0);
        // Only the stock purchase entry remains
        assert_eq!(engine.list_cash_flow().len(), 1);
    }

    #[test]
    fn test_sale_installments_expand() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        let mut sale = basic_sale(patient_id);
        sale.payment_status = PaymentStatus::Pending;
        sale.installments = 3;
        sale.due_date = Some(date(2024, 3, 1));
        let sale_id = engine.add_sale(sale).unwrap();

        let entries: Vec<&CashFlowEntry> = engine
            .list_cash_flow()
            .iter()
            .filter(|e| e.sale_id == Some(sale_id))
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].amount, 200.0);
        assert_eq!(entries[1].due_date, Some(date(2024, 4, 1)));
        assert_eq!(entries[2].installment.as_deref(), Some("3/3"));
    }

    #[test]
    fn test_delete_sale_removes_all_its_projections() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        let mut sale = basic_sale(patient_id);
        sale.payment_status = PaymentStatus::Pending;
        sale.installments = 4;
        sale.due_date = Some(date(2024, 3, 1));
        let sale_id = engine.add_sale(sale).unwrap();

        engine
            .add_cash_flow(NewCashFlow {
                kind: EntryKind::Outflow,
                description: "Aluguel".into(),
                amount: 1500.0,
                status: PaymentStatus::Paid,
                method: None,
                date: date(2024, 2, 1),
                due_date: None,
                installments: 1,
            })
            .unwrap();

        engine.delete_sale(sale_id).unwrap();

        // All four installments gone, the manual entry stays
        assert!(engine.list_sales().is_empty());
        let entries = engine.list_cash_flow();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].description, "Aluguel");
    }

    #[test]
    fn test_sale_bioimpedance_recorded_as_evolution() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        let mut sale = basic_sale(patient_id);
        sale.bioimpedance = Some(Bioimpedance {
            weight_kg: Some(82.0),
            body_fat_pct: Some(28.5),
            ..Default::default()
        });
        engine.add_sale(sale).unwrap();

        let patient = engine.patient(patient_id).unwrap();
        assert_eq!(patient.evolutions.len(), 1);
        assert_eq!(patient.evolutions[0].weight_kg, Some(82.0));
        assert_eq!(patient.evolutions[0].date, date(2024, 2, 1));
    }

    #[test]
    fn test_anchor_change_regenerates_around_administered() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));
        add_vial(&mut engine, 1, 100.0);
        let sale_id = engine.add_sale(basic_sale(patient_id)).unwrap();
        engine
            .update_delivery(sale_id, 1, DeliveryStatus::Delivered, Some(date(2024, 1, 2)))
            .unwrap();

        engine
            .update_patient(
                patient_id,
                PatientUpdate {
                    treatment_start: Some(date(2024, 3, 1)),
                    ..Default::default()
                },
            )
            .unwrap();

        let patient = engine.patient(patient_id).unwrap();
        assert_eq!(patient.doses.len(), 12);
        // Administered dose untouched, pending hangs off it
        assert_eq!(patient.doses[0].status, DoseStatus::Administered);
        assert_eq!(patient.doses[0].date, date(2024, 1, 2));
        assert_eq!(patient.doses[1].date, date(2024, 1, 9));
    }

    #[test]
    fn test_reschedule_dose_cascades() {
        let mut engine = engine();
        let patient_id = add_patient(&mut engine, date(2024, 1, 1));

        engine
            .reschedule_dose(patient_id, 2, date(2024, 1, 10))
            .unwrap();

        let patient = engine.patient(patient_id).unwrap();
        assert_eq!(patient.doses[1].date, date(2024, 1, 10));
        assert_eq!(patient.doses[2].date, date(2024, 1, 17));
        // Non-decreasing date invariant
        for pair in patient.doses.windows(2) {
            assert!(pair[0].date <= pair[1].date);
        }
    }

    #[test]
    fn test_adjust_vial_keeps_invariant_and_compensates() {
        let mut engine = engine();
        let vial_id = engine
            .add_stock(vec![NewVial {
                purchase_date: date(2024, 1, 1),
                total_mg: 100.0,
                cost: 2000.0,
            }])
            .unwrap()[0];

        // Write off 20 mg (breakage)
        engine.adjust_vial(vial_id, 80.0, "frasco quebrado").unwrap();

        let vial = &engine.list_vials()[0];
        assert_eq!(vial.remaining_mg, 80.0);
        assert_eq!(vial.total_mg, 80.0);
        assert!(vial.invariant_holds());

        // Purchase entry + compensating write-off at proportional cost
        let entries = engine.list_cash_flow();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, EntryKind::Outflow);
        assert_eq!(entries[1].amount, 400.0);
    }

    #[test]
    fn test_add_stock_creates_outbound_entry() {
        let mut engine = engine();
        engine
            .add_stock(vec![
                NewVial {
                    purchase_date: date(2024, 1, 1),
                    total_mg: 50.0,
                    cost: 1000.0,
                },
                NewVial {
                    purchase_date: date(2024, 1, 2),
                    total_mg: 50.0,
                    cost: 1100.0,
                },
            ])
            .unwrap();

        assert_eq!(engine.list_vials().len(), 2);
        let entries = engine.list_cash_flow();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Outflow);
        assert_eq!(entries[0].amount, 2100.0);
    }

    #[test]
    fn test_mark_overdue_entries() {
        let mut engine = engine();
        engine
            .add_cash_flow(NewCashFlow {
                kind: EntryKind::Inflow,
                description: "Parcelado".into(),
                amount: 300.0,
                status: PaymentStatus::Pending,
                method: None,
                date: date(2024, 1, 1),
                due_date: Some(date(2024, 1, 10)),
                installments: 3,
            })
            .unwrap();

        // Only the first installment (due Jan 10) is past Feb 1
        let flipped = engine.mark_overdue_entries(date(2024, 2, 1)).unwrap();
        assert_eq!(flipped, 1);
        let overdue: Vec<&CashFlowEntry> = engine
            .list_cash_flow()
            .iter()
            .filter(|e| e.status == CashFlowStatus::Overdue)
            .collect();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].installment.as_deref(), Some("1/3"));
    }

    #[test]
    fn test_update_settings_validates() {
        let mut engine = engine();
        let mut settings = engine.settings().clone();
        settings.daily_late_fee = -5.0;
        assert!(matches!(
            engine.update_settings(settings),
            Err(Error::Validation(_))
        ));

        let mut settings = engine.settings().clone();
        settings.rewards.referral_bonus_points = 200;
        engine.update_settings(settings).unwrap();
        assert_eq!(engine.settings().rewards.referral_bonus_points, 200);
    }

    #[test]
    fn test_sale_for_unknown_patient_fails() {
        let mut engine = engine();
        let err = engine.add_sale(basic_sale(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "patient", .. }));
    }

    #[test]
    fn test_sale_rejects_more_doses_than_pending() {
        let mut engine = engine();
        let patient_id = engine
            .create_patient(NewPatient {
                name: "Sem agenda".into(),
                default_dose_mg: 5.0,
                default_price: 220.0,
                ..Default::default()
            })
            .unwrap();

        let err = engine.add_sale(basic_sale(patient_id)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_forecast_through_engine() {
        let mut engine = engine();
        add_patient(&mut engine, date(2024, 2, 5));
        add_vial(&mut engine, 1, 12.0);

        let fc = engine.forecast(10, date(2024, 2, 1));
        // 12 mg against weekly 5 mg doses ruptures at the third
        assert_eq!(fc.rupture_date, Some(date(2024, 2, 19)));
        assert_eq!(fc.purchase_deadline, Some(date(2024, 2, 9)));
    }
}
