//! CSV export of the cash-flow ledger.
//!
//! Appends entries to a CSV file with headers written once, synced to
//! disk before returning. Intended for accountant handoff.

use crate::types::{CashFlowEntry, CashFlowStatus, EntryKind};
use crate::Result;
use std::fs::OpenOptions;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    kind: &'static str,
    description: String,
    amount: f64,
    status: &'static str,
    date: String,
    due_date: Option<String>,
    installment: Option<String>,
    sale_id: Option<String>,
}

impl From<&CashFlowEntry> for CsvRow {
    fn from(entry: &CashFlowEntry) -> Self {
        CsvRow {
            id: entry.id.to_string(),
            kind: match entry.kind {
                EntryKind::Inflow => "entrada",
                EntryKind::Outflow => "saida",
            },
            description: entry.description.clone(),
            amount: entry.amount,
            status: match entry.status {
                CashFlowStatus::Paid => "pago",
                CashFlowStatus::Pending => "pendente",
                CashFlowStatus::Overdue => "vencido",
            },
            date: entry.purchase_date.to_rfc3339(),
            due_date: entry.due_date.map(|d| d.to_rfc3339()),
            installment: entry.installment.clone(),
            sale_id: entry.sale_id.map(|id| id.to_string()),
        }
    }
}

/// Append cash-flow entries to a CSV file
///
/// Creates the file with headers if needed; fsyncs before returning.
/// Returns the number of rows written.
pub fn cash_flow_to_csv(entries: &[CashFlowEntry], csv_path: &Path) -> Result<usize> {
    if entries.is_empty() {
        tracing::info!("No cash-flow entries to export");
        return Ok(0);
    }

    // Ensure parent directory exists
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;

    // Headers only when the file is empty
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    for entry in entries {
        writer.serialize(CsvRow::from(entry))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} cash-flow entries to CSV", entries.len());
    Ok(entries.len())
}
