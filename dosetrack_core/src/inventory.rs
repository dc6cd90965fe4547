//! FIFO depletion across stock lots.
//!
//! Depletion is all-or-nothing: allocations are planned across the lots
//! first and applied only when the full requirement is covered. A failed
//! call leaves every lot untouched.

use crate::types::{Vial, VialUsage};
use crate::{Error, Result};

/// Deplete `required_mg` across the given lots, oldest purchase first
///
/// ## Contract
///
/// - Lots are consumed ascending by `purchase_date` (FIFO), each giving
///   `min(remaining, still_needed)`.
/// - If the lots cannot cover the requirement, fails with
///   `InsufficientStock` carrying the shortfall and **no lot is mutated**.
/// - On success each touched lot's `remaining_mg`/`sold_mg` are updated
///   and the allocations are returned in consumption order.
///
/// The lot accounting invariant (`remaining + sold == total`) is
/// re-checked for every touched lot before the call returns.
pub fn deplete_fifo(vials: &mut [Vial], required_mg: f64) -> Result<Vec<VialUsage>> {
    if !required_mg.is_finite() || required_mg <= 0.0 {
        return Err(Error::Validation(format!(
            "Depletion requires a positive mg amount, got {}",
            required_mg
        )));
    }

    // Plan phase: walk lots in FIFO order without mutating anything
    let mut order: Vec<usize> = (0..vials.len()).collect();
    order.sort_by_key(|&i| vials[i].purchase_date);

    let mut still_needed = required_mg;
    let mut plan: Vec<(usize, f64)> = Vec::new();

    for &i in &order {
        if still_needed <= 0.0 {
            break;
        }
        let take = vials[i].remaining_mg.min(still_needed);
        if take > 0.0 {
            plan.push((i, take));
            still_needed -= take;
        }
    }

    if still_needed > 1e-9 {
        tracing::warn!(
            "Insufficient stock: required {} mg, short {} mg",
            required_mg,
            still_needed
        );
        return Err(Error::InsufficientStock {
            shortfall_mg: still_needed,
        });
    }

    // Apply phase: full coverage confirmed, commit the plan
    let mut allocations = Vec::with_capacity(plan.len());
    for (i, take) in plan {
        let vial = &mut vials[i];
        vial.remaining_mg -= take;
        vial.sold_mg += take;

        debug_assert!(vial.invariant_holds());
        if !vial.invariant_holds() {
            return Err(Error::State(format!(
                "Vial {} accounting broken after depletion",
                vial.id
            )));
        }

        allocations.push(VialUsage {
            vial_id: vial.id,
            mg_used: take,
        });
    }

    tracing::debug!(
        "Depleted {} mg across {} lot(s)",
        required_mg,
        allocations.len()
    );

    Ok(allocations)
}

/// Total mg remaining across all lots
pub fn total_remaining_mg(vials: &[Vial]) -> f64 {
    vials.iter().map(|v| v.remaining_mg).sum()
}
