//! Health guidance and forecast alerts built on top of [`AqiCategory`].

use serde::Serialize;

use crate::aqi::{AqiCategory, AqiReading};
use crate::error::Result;
use crate::models::ForecastResult;

/// Forecast concentration above which an alert is raised.
pub const ALERT_THRESHOLD: f64 = 90.0;
/// Next-hour concentration above which sensitive groups are advised.
pub const ADVISORY_THRESHOLD: f64 = 50.0;

/// Guidance for the general population and for sensitive groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecommendations {
    pub general: &'static str,
    pub sensitive: &'static str,
    pub activities: &'static [&'static str],
}

impl HealthRecommendations {
    pub fn for_category(category: AqiCategory) -> Self {
        match category {
            AqiCategory::Good => Self {
                general: "Perfect day for outdoor activities!",
                sensitive: "No restrictions for sensitive groups.",
                activities: &[
                    "✅ Running, cycling, outdoor sports",
                    "✅ Open windows for ventilation",
                    "✅ All outdoor activities recommended",
                ],
            },
            AqiCategory::Moderate => Self {
                general: "Air quality is acceptable for most people.",
                sensitive: "Unusually sensitive individuals may experience minor symptoms.",
                activities: &[
                    "✅ Most outdoor activities OK",
                    "⚠️ Sensitive groups: limit prolonged exertion",
                    "✅ Normal outdoor activities for most",
                ],
            },
            AqiCategory::UnhealthyForSensitiveGroups => Self {
                general: "General public can enjoy outdoor activities.",
                sensitive: "Children, elderly, and people with heart/lung disease should reduce outdoor activities.",
                activities: &[
                    "⚠️ Sensitive groups: limit outdoor time",
                    "⚠️ Consider moving strenuous activities indoors",
                    "✅ General public: outdoor activities OK with awareness",
                ],
            },
            AqiCategory::Unhealthy => Self {
                general: "Everyone may experience health effects.",
                sensitive: "Sensitive groups may experience more serious effects. Avoid outdoor activities.",
                activities: &[
                    "❌ Sensitive groups: stay indoors",
                    "⚠️ General public: reduce prolonged outdoor exertion",
                    "🏠 Consider indoor alternatives for exercise",
                    "😷 Wear N95 masks if going outside",
                ],
            },
            AqiCategory::VeryUnhealthy => Self {
                general: "Health alert! Everyone should limit outdoor activities.",
                sensitive: "Sensitive groups should stay indoors and keep activity levels low.",
                activities: &[
                    "❌ Avoid all prolonged outdoor activities",
                    "🏠 Stay indoors with windows closed",
                    "😷 Wear N95/KF94 masks if must go outside",
                    "💨 Use air purifiers indoors",
                    "⚠️ Cancel outdoor events",
                ],
            },
            AqiCategory::Hazardous => Self {
                general: "Health emergency! Everyone should avoid outdoor activities.",
                sensitive: "Everyone should stay indoors and avoid all physical activities outdoors.",
                activities: &[
                    "🚨 STAY INDOORS - Health Emergency!",
                    "❌ Cancel all outdoor activities",
                    "😷 Wear N95 masks even for brief outdoor exposure",
                    "💨 Use air purifiers at maximum setting",
                    "🪟 Seal windows and doors",
                    "🏥 Seek medical attention if experiencing symptoms",
                ],
            },
        }
    }
}

/// Alert level derived from a forecast.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum ForecastAlert {
    /// Some forecast hour exceeds [`ALERT_THRESHOLD`].
    Alert {
        first_unhealthy_hour: usize,
        peak_pm25: f64,
        peak_category: AqiCategory,
    },
    /// The next hour exceeds [`ADVISORY_THRESHOLD`].
    Advisory,
    Clear,
}

impl ForecastAlert {
    pub fn from_forecast(forecast: &ForecastResult) -> Result<Self> {
        let means: Vec<f64> = forecast.points.iter().map(|p| p.mean).collect();

        if let Some(first) = means.iter().position(|&v| v > ALERT_THRESHOLD) {
            let peak = means
                .iter()
                .copied()
                .filter(|&v| v > ALERT_THRESHOLD)
                .fold(f64::MIN, f64::max);
            return Ok(Self::Alert {
                first_unhealthy_hour: first + 1,
                peak_pm25: peak,
                peak_category: AqiReading::from_pm25(peak)?.category,
            });
        }

        match means.first() {
            Some(&next) if next > ADVISORY_THRESHOLD => Ok(Self::Advisory),
            _ => Ok(Self::Clear),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Alert {
                first_unhealthy_hour,
                peak_pm25,
                peak_category,
            } => format!(
                "Air Quality Alert! Unhealthy conditions expected in {first_unhealthy_hour} hour(s). \
                 Peak forecast: {peak_pm25:.1} μg/m³ ({peak_category}). Plan indoor activities."
            ),
            Self::Advisory => "Advisory Notice: air quality may affect sensitive groups. \
                 Monitor conditions if you're in a sensitive group."
                .to_string(),
            Self::Clear => "No air quality alerts. Conditions are favorable!".to_string(),
        }
    }
}

/// A horizontal guide line on the forecast chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdLine {
    pub value: f64,
    pub label: &'static str,
    pub color: &'static str,
}

/// Category boundaries drawn on the forecast chart.
pub fn threshold_lines() -> Vec<ThresholdLine> {
    vec![
        ThresholdLine {
            value: 25.0,
            label: "Good/Moderate",
            color: "green",
        },
        ThresholdLine {
            value: 50.0,
            label: "Moderate/USG",
            color: "yellow",
        },
        ThresholdLine {
            value: 90.0,
            label: "USG/Unhealthy",
            color: "orange",
        },
        ThresholdLine {
            value: 150.0,
            label: "Unhealthy/Very Unhealthy",
            color: "red",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ForecastPoint, ModelKind, ModelOrigin};
    use chrono::{TimeDelta, TimeZone, Utc};

    fn forecast(means: &[f64]) -> ForecastResult {
        let start = Utc.with_ymd_and_hms(2025, 12, 7, 0, 0, 0).unwrap();
        ForecastResult {
            model: ModelKind::Ets,
            origin: ModelOrigin::Pretrained,
            confidence_level: 0.95,
            points: means
                .iter()
                .enumerate()
                .map(|(i, &mean)| ForecastPoint {
                    timestamp: start + TimeDelta::hours(i as i64 + 1),
                    mean,
                    lower: mean - 5.0,
                    upper: mean + 5.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_alert_reports_first_hour_and_peak() {
        let alert = ForecastAlert::from_forecast(&forecast(&[60.0, 95.0, 160.0, 120.0])).unwrap();
        assert_eq!(
            alert,
            ForecastAlert::Alert {
                first_unhealthy_hour: 2,
                peak_pm25: 160.0,
                peak_category: AqiCategory::VeryUnhealthy,
            }
        );
        assert!(alert.message().contains("in 2 hour(s)"));
    }

    #[test]
    fn test_advisory_when_next_hour_moderate() {
        let alert = ForecastAlert::from_forecast(&forecast(&[55.0, 40.0])).unwrap();
        assert_eq!(alert, ForecastAlert::Advisory);
    }

    #[test]
    fn test_clear_conditions() {
        let alert = ForecastAlert::from_forecast(&forecast(&[20.0, 30.0, 90.0])).unwrap();
        assert_eq!(alert, ForecastAlert::Clear);
        assert_eq!(
            ForecastAlert::from_forecast(&forecast(&[])).unwrap(),
            ForecastAlert::Clear
        );
    }

    #[test]
    fn test_recommendations_per_category() {
        let good = HealthRecommendations::for_category(AqiCategory::Good);
        assert_eq!(good.general, "Perfect day for outdoor activities!");

        let hazardous = HealthRecommendations::for_category(AqiCategory::Hazardous);
        assert_eq!(hazardous.activities.len(), 6);
        for category in AqiCategory::ALL {
            assert!(!HealthRecommendations::for_category(category).sensitive.is_empty());
        }
    }

    #[test]
    fn test_threshold_lines_match_category_bounds() {
        let lines = threshold_lines();
        let bounds: Vec<f64> = AqiCategory::ALL[..4]
            .iter()
            .filter_map(|c| c.upper_bound())
            .collect();
        let values: Vec<f64> = lines.iter().map(|l| l.value).collect();
        assert_eq!(values, bounds);
    }

    #[test]
    fn test_alert_serialization_is_tagged() {
        let json = serde_json::to_value(ForecastAlert::Advisory).unwrap();
        assert_eq!(json["level"], "advisory");
    }
}
