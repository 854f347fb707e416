use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use utoipa::ToSchema;

lazy_static! {
    static ref SLUG_SEPARATORS: Regex = Regex::new(r"[^\p{Alphabetic}\p{N}]+").unwrap();
}

/// Lowest and highest slave address a meter may use on the bus
pub const MIN_METER_ADDRESS: u8 = 1;
pub const MAX_METER_ADDRESS: u8 = 247;

/// Supported Eastron SDM meter families
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
pub enum MeterModel {
    SDM120,
    SDM220,
    SDM230,
    SDM630,
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown meter model '{0}'")]
pub struct UnknownModel(pub String);

impl FromStr for MeterModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SDM120" => Ok(MeterModel::SDM120),
            "SDM220" => Ok(MeterModel::SDM220),
            "SDM230" => Ok(MeterModel::SDM230),
            "SDM630" => Ok(MeterModel::SDM630),
            _ => Err(UnknownModel(s.to_string())),
        }
    }
}

impl MeterModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterModel::SDM120 => "SDM120",
            MeterModel::SDM220 => "SDM220",
            MeterModel::SDM230 => "SDM230",
            MeterModel::SDM630 => "SDM630",
        }
    }

    pub fn is_three_phase(&self) -> bool {
        *self == MeterModel::SDM630
    }

    pub fn phase_count(&self) -> u8 {
        if self.is_three_phase() { 3 } else { 1 }
    }
}

impl fmt::Display for MeterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turn a display name into something safe for MQTT topics and URLs.
///
/// Lowercases, collapses every run of non-alphanumeric characters into a
/// single hyphen and strips hyphens from both ends.
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let slug = SLUG_SEPARATORS.replace_all(&lower, "-");
    return slug.trim_matches('-').to_string();
}

/// One configured meter on the bus
#[derive(Debug, Clone, Serialize, PartialEq, Eq, ToSchema)]
pub struct MeterConfig {
    pub model: MeterModel,
    /// Modbus slave address, 1-247
    pub address: u8,
    pub display_name: String,
    pub slug: String,
}

impl MeterConfig {
    /// Build a meter config, falling back to "MODEL ADDRESS" when no name is given.
    /// Address range checks live in the configuration layer.
    pub fn new(model: MeterModel, address: u8, display_name: Option<String>) -> Self {
        let display_name = match display_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => format!("{} {}", model, address),
        };
        let slug = slugify(&display_name);

        return MeterConfig {
            model,
            address,
            display_name,
            slug,
        };
    }
}

/// Result of polling one meter once.
///
/// A failed poll is represented by `ok == false`; `values` then only holds
/// what was actually read in this cycle, older values are never carried over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Reading {
    pub meter_address: u8,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reading {
    pub fn new(meter_address: u8) -> Self {
        Reading {
            meter_address,
            timestamp: Utc::now(),
            values: BTreeMap::new(),
            ok: true,
            error: None,
        }
    }

    /// A reading for a meter that could not be polled at all
    pub fn failed(meter_address: u8, error: String) -> Self {
        Reading {
            meter_address,
            timestamp: Utc::now(),
            values: BTreeMap::new(),
            ok: false,
            error: Some(error),
        }
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}
