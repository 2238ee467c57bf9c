//! Syringe catalogue.
use serde::Serialize;

use crate::error::{Result, RewardError};

/// Inner diameter (cm) and nominal volume (mL) per catalogue key.
const CATALOGUE: &[(&str, f64, f64)] = &[
    ("BD1mL", 0.478, 1.0),
    ("BD3mL", 0.8586, 3.0),
    ("BD5mL", 1.207, 5.0),
    ("BD10mL", 1.45, 10.0),
    ("BD30mL", 2.17, 30.0),
    ("BD60mL", 2.669, 60.0),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Syringe {
    pub key: &'static str,
    /// cm
    pub inner_diameter: f64,
    /// mL
    pub volume: f64,
}

impl Syringe {
    pub fn from_key(key: &str) -> Result<Self> {
        CATALOGUE
            .iter()
            .find(|(k, _, _)| *k == key)
            .map(|&(key, inner_diameter, volume)| Self {
                key,
                inner_diameter,
                volume,
            })
            .ok_or_else(|| RewardError::MissingResource(format!("syringe type '{key}'")))
    }

    pub fn keys() -> impl Iterator<Item = &'static str> {
        CATALOGUE.iter().map(|(k, _, _)| *k)
    }

    /// Volume per cm of carriage travel.
    pub fn ml_per_cm(&self) -> f64 {
        let r = self.inner_diameter / 2.0;
        std::f64::consts::PI * r * r
    }

    /// Carriage travel from empty to full, in cm.
    pub fn max_pos(&self) -> f64 {
        self.volume / self.ml_per_cm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_matches_config_keys() {
        let ours: Vec<_> = Syringe::keys().collect();
        assert_eq!(ours, reward_config::SYRINGE_KEYS);
    }

    #[test]
    fn bd5_geometry() {
        let s = Syringe::from_key("BD5mL").unwrap();
        assert!((s.ml_per_cm() - 1.1442).abs() < 1e-3);
        assert!((s.max_pos() * s.ml_per_cm() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn unknown_key_is_missing_resource() {
        let err = Syringe::from_key("BD2mL").unwrap_err();
        assert_eq!(err.kind(), "MissingResource");
    }
}
