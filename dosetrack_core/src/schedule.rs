//! Dose schedule generation and the reschedule cascade.
//!
//! Both operations are pure functions over dose lists: the generator
//! builds a timeline from an anchor date, the cascade re-dates pending
//! doses after an edit. Administered doses are never moved by either.

use crate::types::{Dose, DoseStatus, PaymentInfo};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Days between consecutive doses
pub const DOSE_INTERVAL_DAYS: i64 = 7;

/// Default program length in doses
pub const DEFAULT_TOTAL_DOSES: u32 = 12;

/// Generate a dose timeline from an anchor date
///
/// ## Rules
///
/// 1. If `administered` is non-empty, those doses are preserved verbatim
///    and pending doses resume from the latest administered one: the next
///    pending dose lands 7 days after it, numbered one past it.
/// 2. Otherwise pending doses run from `start_number` at `anchor` in
///    7-day steps, payment defaulted to pendente.
/// 3. Output is always sorted ascending by `dose_number`.
///
/// Pure function: same inputs always produce the same dose dates.
/// (Dose ids are fresh v4 uuids; everything else is deterministic.)
pub fn generate_schedule(
    anchor: DateTime<Utc>,
    total_doses: u32,
    start_number: u32,
    administered: &[Dose],
) -> Vec<Dose> {
    let mut doses: Vec<Dose> = administered.to_vec();
    doses.sort_by_key(|d| d.dose_number);

    let (mut next_number, mut next_date) = match doses.last() {
        Some(last) => (
            last.dose_number + 1,
            last.date + Duration::days(DOSE_INTERVAL_DAYS),
        ),
        None => (start_number, anchor),
    };

    while next_number <= total_doses {
        doses.push(Dose {
            id: Uuid::new_v4(),
            dose_number: next_number,
            date: next_date,
            status: DoseStatus::Pending,
            administered_mg: None,
            payment: PaymentInfo::default(),
        });
        next_number += 1;
        next_date += Duration::days(DOSE_INTERVAL_DAYS);
    }

    tracing::debug!(
        "Generated schedule: {} doses ({} administered preserved)",
        doses.len(),
        administered.len()
    );

    doses
}

/// Cascade re-dating of pending doses after an edit
///
/// Sorts by `dose_number`, then for every dose past the edited one whose
/// status is pending, sets its date 7 days after its predecessor.
/// Administered doses are never shifted; each acts as a fixed point for
/// whatever follows it.
pub fn cascade_after(doses: &mut Vec<Dose>, edited_dose_number: u32) {
    doses.sort_by_key(|d| d.dose_number);

    let Some(edited_index) = doses
        .iter()
        .position(|d| d.dose_number == edited_dose_number)
    else {
        tracing::warn!(
            "Cascade requested for unknown dose number {}",
            edited_dose_number
        );
        return;
    };

    for i in (edited_index + 1)..doses.len() {
        if doses[i].status == DoseStatus::Pending {
            doses[i].date = doses[i - 1].date + Duration::days(DOSE_INTERVAL_DAYS);
        }
    }

    tracing::debug!("Cascaded schedule after dose {}", edited_dose_number);
}

/// Rebuild a schedule around a new anchor date
///
/// Used when the patient's anchor changes while some doses are already
/// administered: the administered subset becomes the fixed prefix and the
/// pending remainder is regenerated from it (or from the new anchor when
/// nothing was administered yet).
pub fn regenerate_pending(
    doses: &[Dose],
    anchor: DateTime<Utc>,
    total_doses: u32,
) -> Vec<Dose> {
    let administered: Vec<Dose> = doses
        .iter()
        .filter(|d| d.status == DoseStatus::Administered)
        .cloned()
        .collect();

    generate_schedule(anchor, total_doses, 1, &administered)
}
