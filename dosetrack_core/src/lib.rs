#![forbid(unsafe_code)]

//! Core domain model and business logic for the Dosetrack system.
//!
//! This crate provides:
//! - Domain types (patients, doses, sales, vials, cash flow)
//! - Schedule generation and the reschedule cascade
//! - FIFO inventory depletion
//! - The loyalty points ledger
//! - Sale fulfillment reconciliation
//! - Cash-flow projection and stock forecasting
//! - Persistence (JSON dataset store, CSV export)

pub mod types;
pub mod error;
pub mod settings;
pub mod config;
pub mod logging;
pub mod schedule;
pub mod inventory;
pub mod points;
pub mod cashflow;
pub mod forecast;
pub mod store;
pub mod export;
pub mod engine;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use settings::{build_default_settings, default_settings};
pub use schedule::{generate_schedule, DEFAULT_TOTAL_DOSES, DOSE_INTERVAL_DAYS};
pub use inventory::deplete_fifo;
pub use cashflow::PaymentPlan;
pub use forecast::StockForecast;
pub use store::{JsonStore, MemStore, Store};
pub use export::cash_flow_to_csv;
pub use engine::{
    Bioimpedance, CashFlowUpdate, Engine, NewCashFlow, NewPatient, NewSale, NewVial,
    PatientUpdate,
};
