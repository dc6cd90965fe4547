//! Cash-flow projection.
//!
//! Expands a payment into one ledger entry or an installment series.
//! Pure functions: the engine decides when to append the results to the
//! dataset's cash-flow collection.

use crate::types::{CashFlowEntry, CashFlowStatus, EntryKind, PaymentMethod, PaymentStatus};
use chrono::{DateTime, Datelike, Duration, Months, Utc, Weekday};
use uuid::Uuid;

/// How a payment expands into cash-flow entries
#[derive(Clone, Debug)]
pub struct PaymentPlan {
    pub kind: EntryKind,
    pub description: String,
    /// Gross amount before the operator fee
    pub amount: f64,
    pub operator_fee: f64,
    pub status: PaymentStatus,
    pub method: Option<PaymentMethod>,
    /// Sale/payment date anchoring the entries
    pub date: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub installments: u32,
    pub sale_id: Option<Uuid>,
}

/// Round a monetary amount to 2 decimals
pub fn round2(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Next business day strictly after `date` (weekends skipped)
///
/// Card settlements land on the first weekday after the sale.
pub fn next_business_day(date: DateTime<Utc>) -> DateTime<Utc> {
    let mut next = date + Duration::days(1);
    while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
        next += Duration::days(1);
    }
    next
}

/// Offset a date by whole calendar months
pub fn add_months(date: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    date.checked_add_months(Months::new(months)).unwrap_or(date)
}

/// Expand a payment plan into cash-flow entries
///
/// - Single payment: one entry. Card payments are dated at the next
///   business day after the sale; everything else at the payment date.
///   The entry's status mirrors the payment's.
/// - Installments (`installments > 1` with a base due date): one entry
///   of `net / n` per installment, due dates offset by whole months,
///   each individually pendente and labeled `"i/n"`.
pub fn project(plan: &PaymentPlan) -> Vec<CashFlowEntry> {
    let net = round2(plan.amount - plan.operator_fee);

    if plan.installments > 1 {
        if let Some(base_due) = plan.due_date {
            let per_installment = round2(net / plan.installments as f64);
            return (0..plan.installments)
                .map(|i| CashFlowEntry {
                    id: Uuid::new_v4(),
                    kind: plan.kind,
                    description: plan.description.clone(),
                    amount: per_installment,
                    status: CashFlowStatus::Pending,
                    purchase_date: plan.date,
                    due_date: Some(add_months(base_due, i)),
                    installment: Some(format!("{}/{}", i + 1, plan.installments)),
                    method: plan.method,
                    sale_id: plan.sale_id,
                })
                .collect();
        }
        tracing::warn!(
            "Installment plan without a due date, projecting a single entry"
        );
    }

    let entry_date = match plan.method {
        Some(PaymentMethod::Card) => next_business_day(plan.date),
        _ => plan.date,
    };

    vec![CashFlowEntry {
        id: Uuid::new_v4(),
        kind: plan.kind,
        description: plan.description.clone(),
        amount: net,
        status: match plan.status {
            PaymentStatus::Paid => CashFlowStatus::Paid,
            PaymentStatus::Pending => CashFlowStatus::Pending,
        },
        purchase_date: entry_date,
        due_date: plan.due_date,
        installment: None,
        method: plan.method,
        sale_id: plan.sale_id,
    }]
}

/// Status of an entry as of `today` (pendente past due reads as vencido)
pub fn effective_status(entry: &CashFlowEntry, today: DateTime<Utc>) -> CashFlowStatus {
    match (entry.status, entry.due_date) {
        (CashFlowStatus::Pending, Some(due)) if due < today => CashFlowStatus::Overdue,
        (status, _) => status,
    }
}

/// Accumulated late fee for an overdue entry
pub fn late_fee(entry: &CashFlowEntry, daily_late_fee: f64, today: DateTime<Utc>) -> f64 {
    match entry.due_date {
        Some(due) if entry.status != CashFlowStatus::Paid && due < today => {
            let days_overdue = (today - due).num_days().max(0);
            round2(days_overdue as f64 * daily_late_fee)
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    fn base_plan() -> PaymentPlan {
        PaymentPlan {
            kind: EntryKind::Inflow,
            description: "Venda de doses".into(),
            amount: 600.0,
            operator_fee: 0.0,
            status: PaymentStatus::Paid,
            method: Some(PaymentMethod::Pix),
            date: date(2024, 3, 6), // a Wednesday
            due_date: None,
            installments: 1,
            sale_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn test_single_entry_mirrors_payment() {
        let plan = base_plan();
        let entries = project(&plan);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 600.0);
        assert_eq!(entries[0].status, CashFlowStatus::Paid);
        assert_eq!(entries[0].purchase_date, plan.date);
        assert!(entries[0].installment.is_none());
    }

    #[test]
    fn test_card_shifts_to_next_business_day() {
        let mut plan = base_plan();
        plan.method = Some(PaymentMethod::Card);
        plan.date = date(2024, 3, 8); // Friday

        let entries = project(&plan);
        // Friday sale settles Monday
        assert_eq!(entries[0].purchase_date, date(2024, 3, 11));
    }

    #[test]
    fn test_next_business_day_skips_weekend() {
        assert_eq!(next_business_day(date(2024, 3, 8)), date(2024, 3, 11)); // Fri -> Mon
        assert_eq!(next_business_day(date(2024, 3, 9)), date(2024, 3, 11)); // Sat -> Mon
        assert_eq!(next_business_day(date(2024, 3, 6)), date(2024, 3, 7)); // Wed -> Thu
    }

    #[test]
    fn test_installments_expand_by_month() {
        let mut plan = base_plan();
        plan.amount = 1000.0;
        plan.operator_fee = 100.0;
        plan.installments = 3;
        plan.due_date = Some(date(2024, 1, 15));
        plan.status = PaymentStatus::Pending;

        let entries = project(&plan);

        assert_eq!(entries.len(), 3);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.amount, 300.0);
            assert_eq!(entry.status, CashFlowStatus::Pending);
            assert_eq!(
                entry.installment.as_deref(),
                Some(format!("{}/3", i + 1).as_str())
            );
        }
        assert_eq!(entries[0].due_date, Some(date(2024, 1, 15)));
        assert_eq!(entries[1].due_date, Some(date(2024, 2, 15)));
        assert_eq!(entries[2].due_date, Some(date(2024, 3, 15)));
    }

    #[test]
    fn test_installment_entries_share_sale_id() {
        let mut plan = base_plan();
        plan.installments = 4;
        plan.due_date = Some(date(2024, 5, 1));

        let entries = project(&plan);
        assert!(entries.iter().all(|e| e.sale_id == plan.sale_id));
    }

    #[test]
    fn test_operator_fee_reduces_net() {
        let mut plan = base_plan();
        plan.amount = 600.0;
        plan.operator_fee = 18.5;

        let entries = project(&plan);
        assert_eq!(entries[0].amount, 581.5);
    }

    #[test]
    fn test_effective_status_overdue_view() {
        let plan = base_plan();
        let mut entry = project(&plan).remove(0);
        entry.status = CashFlowStatus::Pending;
        entry.due_date = Some(date(2024, 3, 1));

        assert_eq!(
            effective_status(&entry, date(2024, 3, 10)),
            CashFlowStatus::Overdue
        );
        assert_eq!(
            effective_status(&entry, date(2024, 2, 20)),
            CashFlowStatus::Pending
        );

        entry.status = CashFlowStatus::Paid;
        assert_eq!(
            effective_status(&entry, date(2024, 3, 10)),
            CashFlowStatus::Paid
        );
    }

    #[test]
    fn test_late_fee_accrues_daily() {
        let plan = base_plan();
        let mut entry = project(&plan).remove(0);
        entry.status = CashFlowStatus::Pending;
        entry.due_date = Some(date(2024, 3, 1));

        assert_eq!(late_fee(&entry, 2.5, date(2024, 3, 11)), 25.0);
        assert_eq!(late_fee(&entry, 2.5, date(2024, 2, 20)), 0.0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(600.0 / 3.0), 200.0);
        assert_eq!(round2(100.0 / 3.0), 33.33);
        assert_eq!(round2(600.0 / 7.0), 85.71);
    }
}
