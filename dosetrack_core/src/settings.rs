//! Default business settings.
//!
//! Provides the built-in dose price table and reward configuration used
//! when a dataset is created for the first time, plus validation for
//! administrative updates.

use crate::types::{DosePoints, DosePrice, RewardSettings, Settings};
use once_cell::sync::Lazy;

/// Cached default settings - built once and reused across all operations
static DEFAULT_SETTINGS: Lazy<Settings> = Lazy::new(build_default_settings);

/// Get a reference to the cached default settings
pub fn default_settings() -> &'static Settings {
    &DEFAULT_SETTINGS
}

/// Builds the default settings with the built-in price and reward tables
pub fn build_default_settings() -> Settings {
    Settings {
        dose_prices: vec![
            DosePrice { dose_mg: 2.5, price: 180.0 },
            DosePrice { dose_mg: 5.0, price: 220.0 },
            DosePrice { dose_mg: 7.5, price: 260.0 },
            DosePrice { dose_mg: 10.0, price: 300.0 },
            DosePrice { dose_mg: 12.5, price: 340.0 },
            DosePrice { dose_mg: 15.0, price: 380.0 },
        ],
        rewards: RewardSettings {
            points_per_dose: vec![
                DosePoints { dose_mg: 2.5, points: 10 },
                DosePoints { dose_mg: 5.0, points: 15 },
                DosePoints { dose_mg: 7.5, points: 20 },
                DosePoints { dose_mg: 10.0, points: 25 },
                DosePoints { dose_mg: 12.5, points: 30 },
                DosePoints { dose_mg: 15.0, points: 35 },
            ],
            points_to_brl: 1.0,
            referral_bonus_points: 120,
        },
        daily_late_fee: 2.0,
    }
}

impl Settings {
    /// Points earned for one dose of the given strength (0 if unlisted)
    pub fn points_for_dose(&self, dose_mg: f64) -> i64 {
        self.rewards
            .points_per_dose
            .iter()
            .find(|p| (p.dose_mg - dose_mg).abs() < 1e-6)
            .map(|p| p.points)
            .unwrap_or(0)
    }

    /// Listed price for one dose of the given strength
    pub fn price_for_dose(&self, dose_mg: f64) -> Option<f64> {
        self.dose_prices
            .iter()
            .find(|p| (p.dose_mg - dose_mg).abs() < 1e-6)
            .map(|p| p.price)
    }

    /// Validate the settings, returning a list of problems
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.dose_prices.is_empty() {
            errors.push("Settings have no dose prices".to_string());
        }
        for price in &self.dose_prices {
            if price.dose_mg <= 0.0 || !price.dose_mg.is_finite() {
                errors.push(format!("Invalid dose strength {} mg", price.dose_mg));
            }
            if price.price < 0.0 || !price.price.is_finite() {
                errors.push(format!(
                    "Invalid price {} for {} mg dose",
                    price.price, price.dose_mg
                ));
            }
        }
        for reward in &self.rewards.points_per_dose {
            if reward.points < 0 {
                errors.push(format!(
                    "Negative reward points for {} mg dose",
                    reward.dose_mg
                ));
            }
        }
        if self.rewards.points_to_brl < 0.0 || !self.rewards.points_to_brl.is_finite() {
            errors.push(format!(
                "Invalid points-to-BRL rate {}",
                self.rewards.points_to_brl
            ));
        }
        if self.rewards.referral_bonus_points < 0 {
            errors.push(format!(
                "Negative referral bonus {}",
                self.rewards.referral_bonus_points
            ));
        }
        if self.daily_late_fee < 0.0 || !self.daily_late_fee.is_finite() {
            errors.push(format!("Invalid daily late fee {}", self.daily_late_fee));
        }

        errors
    }
}
