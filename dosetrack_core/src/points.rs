//! Append-only loyalty points ledger.
//!
//! The patient's `points` field is a cached balance: it is only ever
//! updated together with a ledger append, so it always equals the sum
//! of `point_history`.

use crate::types::{Patient, PointTransaction};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Credit points to a patient
///
/// `points` must be non-negative; zero is accepted and appends nothing.
pub fn earn(
    patient: &mut Patient,
    points: i64,
    description: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    if points < 0 {
        return Err(Error::Validation(format!(
            "Cannot earn a negative amount of points ({})",
            points
        )));
    }
    if points == 0 {
        return Ok(());
    }

    patient.point_history.push(PointTransaction {
        date: at,
        description: description.to_string(),
        points,
    });
    patient.points += points;

    tracing::debug!(
        "Patient {} earned {} points (balance {})",
        patient.id,
        points,
        patient.points
    );
    Ok(())
}

/// Debit points from a patient
///
/// Fails with `InsufficientPoints` when the balance cannot cover the
/// redemption; nothing is appended on failure.
pub fn redeem(
    patient: &mut Patient,
    points: i64,
    description: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    if points <= 0 {
        return Err(Error::Validation(format!(
            "Redemption requires a positive amount of points ({})",
            points
        )));
    }
    if points > patient.points {
        return Err(Error::InsufficientPoints {
            required: points,
            available: patient.points,
        });
    }

    patient.point_history.push(PointTransaction {
        date: at,
        description: description.to_string(),
        points: -points,
    });
    patient.points -= points;

    tracing::debug!(
        "Patient {} redeemed {} points (balance {})",
        patient.id,
        points,
        patient.points
    );
    Ok(())
}

/// Recompute the balance from history (for invariant checks)
pub fn balance_from_history(patient: &Patient) -> i64 {
    patient.point_history.iter().map(|t| t.points).sum()
}
