//! PM2.5 to Vietnamese AQI category mapping.
//!
//! | Range (μg/m³) | Category                       | Index                          |
//! |---------------|--------------------------------|--------------------------------|
//! | <= 25         | Good                           | 2·c                            |
//! | <= 50         | Moderate                       | 50 + 2·(c − 25)                |
//! | <= 90         | Unhealthy for Sensitive Groups | 100 + 1.25·(c − 50)            |
//! | <= 150        | Unhealthy                      | 150 + (5/6)·(c − 90)           |
//! | <= 250        | Very Unhealthy                 | 200 + (c − 150)                |
//! | > 250         | Hazardous                      | 300 + 0.8·min(c − 250, 250)    |
//!
//! Each index is truncated to an integer and clipped at 500. A value on a
//! boundary belongs to the lower tier.

use serde::Serialize;

use crate::error::{NowcastError, Result};

/// Upper bound of the top of the index scale.
pub const MAX_AQI: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AqiCategory {
    #[serde(rename = "Good")]
    Good,
    #[serde(rename = "Moderate")]
    Moderate,
    #[serde(rename = "Unhealthy for Sensitive Groups")]
    UnhealthyForSensitiveGroups,
    #[serde(rename = "Unhealthy")]
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    #[serde(rename = "Hazardous")]
    Hazardous,
}

impl AqiCategory {
    pub const ALL: [AqiCategory; 6] = [
        AqiCategory::Good,
        AqiCategory::Moderate,
        AqiCategory::UnhealthyForSensitiveGroups,
        AqiCategory::Unhealthy,
        AqiCategory::VeryUnhealthy,
        AqiCategory::Hazardous,
    ];

    /// Tier for a concentration. Values on a boundary keep the lower tier.
    pub fn classify(pm25: f64) -> Self {
        match pm25 {
            c if c <= 25.0 => Self::Good,
            c if c <= 50.0 => Self::Moderate,
            c if c <= 90.0 => Self::UnhealthyForSensitiveGroups,
            c if c <= 150.0 => Self::Unhealthy,
            c if c <= 250.0 => Self::VeryUnhealthy,
            _ => Self::Hazardous,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Moderate => "Moderate",
            Self::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            Self::Unhealthy => "Unhealthy",
            Self::VeryUnhealthy => "Very Unhealthy",
            Self::Hazardous => "Hazardous",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }

    /// Inclusive upper concentration bound, `None` for the open top tier.
    pub fn upper_bound(self) -> Option<f64> {
        match self {
            Self::Good => Some(25.0),
            Self::Moderate => Some(50.0),
            Self::UnhealthyForSensitiveGroups => Some(90.0),
            Self::Unhealthy => Some(150.0),
            Self::VeryUnhealthy => Some(250.0),
            Self::Hazardous => None,
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Self::Good => "#00E400",
            Self::Moderate => "#FFFF00",
            Self::UnhealthyForSensitiveGroups => "#FF7E00",
            Self::Unhealthy => "#FF0000",
            Self::VeryUnhealthy => "#8F3F97",
            Self::Hazardous => "#7E0023",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Good => "😊",
            Self::Moderate => "😐",
            Self::UnhealthyForSensitiveGroups => "😷",
            Self::Unhealthy => "⚠️",
            Self::VeryUnhealthy => "🚨",
            Self::Hazardous => "☠️",
        }
    }

    pub fn health_advisory(self) -> &'static str {
        match self {
            Self::Good => "Air quality is good. Ideal for outdoor activities.",
            Self::Moderate => {
                "Air quality is acceptable. Sensitive individuals should consider reducing prolonged outdoor exertion."
            }
            Self::UnhealthyForSensitiveGroups => {
                "Sensitive groups (children, elderly, people with respiratory conditions) should reduce prolonged outdoor activities."
            }
            Self::Unhealthy => {
                "Everyone should reduce prolonged outdoor exertion. Sensitive groups should avoid outdoor activities."
            }
            Self::VeryUnhealthy => {
                "Health alert! Everyone should avoid prolonged outdoor activities. Wear masks if going outside."
            }
            Self::Hazardous => {
                "Health emergency! Everyone should avoid all outdoor activities. Stay indoors with air purifiers."
            }
        }
    }

    /// Index within this tier, before clipping.
    fn raw_index(self, c: f64) -> i64 {
        let value = match self {
            Self::Good => (50.0 / 25.0) * c,
            Self::Moderate => 50.0 + ((50.0 / 25.0) * (c - 25.0)),
            Self::UnhealthyForSensitiveGroups => 100.0 + ((50.0 / 40.0) * (c - 50.0)),
            Self::Unhealthy => 150.0 + ((50.0 / 60.0) * (c - 90.0)),
            Self::VeryUnhealthy => 200.0 + ((100.0 / 100.0) * (c - 150.0)),
            Self::Hazardous => 300.0 + ((200.0 / 250.0) * (c - 250.0).min(250.0)),
        };
        value as i64
    }
}

impl std::fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A concentration together with its index, tier and display attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AqiReading {
    pub pm25: f64,
    pub aqi: u16,
    pub category: AqiCategory,
    pub color: &'static str,
    pub health_advisory: &'static str,
    pub icon: &'static str,
}

impl AqiReading {
    /// Maps a PM2.5 concentration (μg/m³) to its reading.
    ///
    /// Negative concentrations are treated as zero.
    ///
    /// # Errors
    ///
    /// Returns [`NowcastError::InvalidData`] for NaN or infinite input.
    pub fn from_pm25(pm25: f64) -> Result<Self> {
        if !pm25.is_finite() {
            return Err(NowcastError::InvalidData(format!(
                "PM2.5 concentration must be finite, got {pm25}"
            )));
        }
        let c = pm25.max(0.0);
        let category = AqiCategory::classify(c);
        let aqi = category.raw_index(c).clamp(0, MAX_AQI as i64) as u16;

        Ok(Self {
            pm25: (c * 100.0).round() / 100.0,
            aqi,
            category,
            color: category.color(),
            health_advisory: category.health_advisory(),
            icon: category.icon(),
        })
    }
}
