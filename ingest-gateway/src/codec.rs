//! Device payload codec.
//!
//! Decodes the JSON bodies bin controllers publish into [`NormalizedReading`]s.
//! Two wire shapes are in the field; a deployment speaks exactly one of them,
//! so the parser is picked once at startup through [`parser_for`].
//!
//! * `array`:  `{"DISTANCE":[d0,d1,d2,d3],"WEIGHT":w}`, one compartment per
//!   topic, category taken from the third topic segment.
//! * `legacy`: `{"org":{"v":..,"w":..},"an":{..},"re":{..}}` (firmware also
//!   spells the keys `ano`/`res`), all compartments of a bin in one message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use telemetry_model::{Category, NormalizedReading, MAX_SENSORS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Array,
    #[serde(alias = "object")]
    Legacy,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("topic '{0}' has no location segment")]
    MissingLocation(String),
    #[error("DISTANCE carries {0} values, at most 4 are supported")]
    TooManySensors(usize),
    #[error("payload carries no known compartment")]
    NoCompartments,
}

// ------------------------------------------------------------------ //
//  Fill computation                                                   //
// ------------------------------------------------------------------ //

/// Converts raw ultrasonic distances into fill levels.
///
/// A distance is valid when it is finite, non-negative and strictly below
/// `error_threshold_cm`; anything else is a faulted sensor and is left out
/// of the average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillSettings {
    pub error_threshold_cm: f64,
    /// Distance from the sensor to the bin floor, i.e. the reading of an
    /// empty bin.
    pub bin_depth_cm: f64,
}

impl Default for FillSettings {
    fn default() -> Self {
        Self {
            error_threshold_cm: 2000.0,
            bin_depth_cm: 100.0,
        }
    }
}

impl FillSettings {
    pub fn is_valid(&self, distance: f64) -> bool {
        distance.is_finite() && distance >= 0.0 && distance < self.error_threshold_cm
    }

    /// Mean of the valid distances, `None` when every sensor is faulted.
    pub fn average_valid(&self, distances: &[f64]) -> Option<f64> {
        let valid: Vec<f64> = distances.iter().copied().filter(|d| self.is_valid(*d)).collect();
        if valid.is_empty() {
            None
        } else {
            Some(valid.iter().sum::<f64>() / valid.len() as f64)
        }
    }

    pub fn fill_percentage(&self, average_distance_cm: f64) -> f64 {
        let fill = (self.bin_depth_cm - average_distance_cm) / self.bin_depth_cm * 100.0;
        fill.clamp(0.0, 100.0)
    }

    /// `(average_distance_cm, fill_percentage)`. A bin with no valid sensor
    /// reports 0 for both instead of failing.
    pub fn summarize(&self, distances: &[f64]) -> (f64, f64) {
        match self.average_valid(distances) {
            Some(avg) => (avg, self.fill_percentage(avg)),
            None => (0.0, 0.0),
        }
    }
}

// ------------------------------------------------------------------ //
//  Parsers                                                            //
// ------------------------------------------------------------------ //

pub trait PayloadParser: Send + Sync {
    fn format(&self) -> PayloadFormat;

    /// Decode one message. An empty `Ok` never happens; a message either
    /// yields at least one reading or fails.
    fn parse(
        &self,
        topic: &str,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<NormalizedReading>, DecodeError>;
}

pub fn parser_for(format: PayloadFormat, fill: FillSettings) -> Box<dyn PayloadParser> {
    match format {
        PayloadFormat::Array => Box::new(ArrayParser { fill }),
        PayloadFormat::Legacy => Box::new(LegacyParser { fill }),
    }
}

/// Second topic segment: `CapsE6/KantinSGLC/organic` -> `KantinSGLC`.
fn location_of(topic: &str) -> Result<String, DecodeError> {
    topic
        .split('/')
        .nth(1)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| DecodeError::MissingLocation(topic.to_string()))
}

/// Third topic segment resolved through the category aliases. Topics without
/// a recognisable segment are treated as organic.
fn category_of(topic: &str) -> Category {
    topic
        .split('/')
        .nth(2)
        .and_then(Category::from_alias)
        .unwrap_or(Category::Organic)
}

fn reading(
    fill: &FillSettings,
    location: &str,
    category: Category,
    sensor_distances: Vec<f64>,
    weight_grams: f64,
    timestamp: DateTime<Utc>,
) -> NormalizedReading {
    let (average_distance_cm, average_fill_percentage) = fill.summarize(&sensor_distances);
    NormalizedReading {
        location: location.to_string(),
        category,
        sensor_distances,
        average_distance_cm,
        average_fill_percentage,
        weight_grams,
        timestamp,
    }
}

#[derive(Debug, Deserialize)]
struct ArrayPayload {
    /// `null` entries are kept positionally and count as faulted.
    #[serde(rename = "DISTANCE", default)]
    distance: Vec<Option<f64>>,
    #[serde(rename = "WEIGHT", default)]
    weight: Option<f64>,
}

pub struct ArrayParser {
    fill: FillSettings,
}

impl PayloadParser for ArrayParser {
    fn format(&self) -> PayloadFormat {
        PayloadFormat::Array
    }

    fn parse(
        &self,
        topic: &str,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<NormalizedReading>, DecodeError> {
        let location = location_of(topic)?;
        let payload: ArrayPayload = serde_json::from_slice(body)?;
        if payload.distance.len() > MAX_SENSORS {
            return Err(DecodeError::TooManySensors(payload.distance.len()));
        }

        let distances = payload
            .distance
            .into_iter()
            .map(|d| d.unwrap_or(f64::NAN))
            .collect();

        Ok(vec![reading(
            &self.fill,
            &location,
            category_of(topic),
            distances,
            payload.weight.unwrap_or(0.0),
            received_at,
        )])
    }
}

#[derive(Debug, Default, Deserialize)]
struct Compartment {
    #[serde(default)]
    v: Option<f64>,
    #[serde(default)]
    w: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LegacyPayload {
    org: Option<Compartment>,
    #[serde(alias = "ano")]
    an: Option<Compartment>,
    #[serde(alias = "res")]
    re: Option<Compartment>,
}

pub struct LegacyParser {
    fill: FillSettings,
}

impl PayloadParser for LegacyParser {
    fn format(&self) -> PayloadFormat {
        PayloadFormat::Legacy
    }

    fn parse(
        &self,
        topic: &str,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<NormalizedReading>, DecodeError> {
        let location = location_of(topic)?;
        let payload: LegacyPayload = serde_json::from_slice(body)?;

        let compartments = [
            (Category::Organic, payload.org),
            (Category::Inorganic, payload.an),
            (Category::Residual, payload.re),
        ];

        let readings: Vec<NormalizedReading> = compartments
            .into_iter()
            .filter_map(|(category, c)| c.map(|c| (category, c)))
            .map(|(category, c)| {
                let distances = vec![c.v.unwrap_or(0.0)];
                reading(
                    &self.fill,
                    &location,
                    category,
                    distances,
                    c.w.unwrap_or(0.0),
                    received_at,
                )
            })
            .collect();

        if readings.is_empty() {
            return Err(DecodeError::NoCompartments);
        }
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn array() -> Box<dyn PayloadParser> {
        parser_for(PayloadFormat::Array, FillSettings::default())
    }

    #[test]
    fn array_payload_averages_all_sensors() {
        let body = br#"{"DISTANCE":[40,50,60,70],"WEIGHT":120}"#;
        let out = array().parse("CapsE6/KantinSGLC/organic", body, now()).unwrap();
        assert_eq!(out.len(), 1);
        let r = &out[0];
        assert_eq!(r.location, "KantinSGLC");
        assert_eq!(r.category, Category::Organic);
        assert_eq!(r.average_distance_cm, 55.0);
        assert_eq!(r.average_fill_percentage, 45.0);
        assert_eq!(r.weight_grams, 120.0);
        assert_eq!(r.timestamp, now());
    }

    #[test]
    fn faulted_sensor_is_excluded() {
        let body = br#"{"DISTANCE":[40,2500,60],"WEIGHT":0}"#;
        let out = array().parse("CapsE6/Lt2SGLC/anorganic", body, now()).unwrap();
        assert_eq!(out[0].category, Category::Inorganic);
        assert_eq!(out[0].average_distance_cm, 50.0);
        assert_eq!(out[0].sensor_distances, vec![40.0, 2500.0, 60.0]);
    }

    #[test]
    fn two_segment_topic_reads_as_organic() {
        let out = array().parse("X/KantinSGLC", br#"{"DISTANCE":[60,59,75,73]}"#, now()).unwrap();
        assert_eq!(out[0].location, "KantinSGLC");
        assert_eq!(out[0].category, Category::Organic);
        assert_eq!(out[0].average_distance_cm, 66.75);
    }

    #[test]
    fn hardware_fault_sentinel_is_ignored() {
        let out = array()
            .parse("X/KantinSGLC", br#"{"DISTANCE":[65535,59,75,73]}"#, now())
            .unwrap();
        assert_eq!(out[0].average_distance_cm, 69.0);
        assert_eq!(out[0].average_fill_percentage, 31.0);
    }

    #[test]
    fn threshold_itself_is_invalid() {
        let fill = FillSettings::default();
        assert!(fill.is_valid(1999.9));
        assert!(!fill.is_valid(2000.0));
        assert!(!fill.is_valid(-1.0));
        assert!(fill.is_valid(0.0));
    }

    #[test]
    fn all_sensors_faulted_yields_zero() {
        let body = br#"{"DISTANCE":[2000,3000,-5,null]}"#;
        let out = array().parse("CapsE6/Lt2SGLC/residue", body, now()).unwrap();
        assert_eq!(out[0].average_distance_cm, 0.0);
        assert_eq!(out[0].average_fill_percentage, 0.0);
        assert_eq!(out[0].weight_grams, 0.0);
        assert_eq!(out[0].category, Category::Residual);
    }

    #[test]
    fn fill_is_clamped() {
        let fill = FillSettings { error_threshold_cm: 2000.0, bin_depth_cm: 100.0 };
        assert_eq!(fill.fill_percentage(150.0), 0.0);
        assert_eq!(fill.fill_percentage(0.0), 100.0);
    }

    #[test]
    fn unknown_category_segment_defaults_to_organic() {
        let out = array().parse("CapsE6/Lt2SGLC", br#"{"DISTANCE":[10]}"#, now()).unwrap();
        assert_eq!(out[0].category, Category::Organic);
        let out = array().parse("CapsE6/Lt2SGLC/glass", br#"{"DISTANCE":[10]}"#, now()).unwrap();
        assert_eq!(out[0].category, Category::Organic);
    }

    #[test]
    fn topic_without_location_is_rejected() {
        let err = array().parse("CapsE6", br#"{"DISTANCE":[10]}"#, now()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingLocation(_)));
    }

    #[test]
    fn more_than_four_sensors_is_rejected() {
        let err = array()
            .parse("CapsE6/Lt2SGLC/organic", br#"{"DISTANCE":[1,2,3,4,5]}"#, now())
            .unwrap_err();
        assert!(matches!(err, DecodeError::TooManySensors(5)));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = array().parse("CapsE6/Lt2SGLC/organic", b"not json", now()).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn legacy_payload_yields_one_reading_per_compartment() {
        let parser = parser_for(PayloadFormat::Legacy, FillSettings::default());
        let body = br#"{"org":{"v":30,"w":500},"re":{"v":80,"w":20}}"#;
        let out = parser.parse("CapsE6/KantinSGLC", body, now()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].category, Category::Organic);
        assert_eq!(out[0].average_fill_percentage, 70.0);
        assert_eq!(out[0].weight_grams, 500.0);
        assert_eq!(out[1].category, Category::Residual);
        assert_eq!(out[1].average_distance_cm, 80.0);
    }

    #[test]
    fn legacy_payload_accepts_long_compartment_keys() {
        let parser = parser_for(PayloadFormat::Legacy, FillSettings::default());
        let body = br#"{"org":{"v":30,"w":5},"ano":{"v":40,"w":10},"res":{"v":50,"w":15}}"#;
        let out = parser.parse("CapsE6/KantinSGLC", body, now()).unwrap();
        let categories: Vec<Category> = out.iter().map(|r| r.category).collect();
        assert_eq!(categories, vec![Category::Organic, Category::Inorganic, Category::Residual]);
        assert_eq!(out[1].weight_grams, 10.0);
        assert_eq!(out[2].average_distance_cm, 50.0);

        let only_ano = parser
            .parse("CapsE6/KantinSGLC", br#"{"ano":{"v":40,"w":10}}"#, now())
            .unwrap();
        assert_eq!(only_ano.len(), 1);
        assert_eq!(only_ano[0].category, Category::Inorganic);
        assert_eq!(only_ano[0].average_fill_percentage, 60.0);
    }

    #[test]
    fn legacy_payload_without_compartments_is_rejected() {
        let parser = parser_for(PayloadFormat::Legacy, FillSettings::default());
        let err = parser.parse("CapsE6/KantinSGLC", br#"{}"#, now()).unwrap_err();
        assert!(matches!(err, DecodeError::NoCompartments));
    }

    #[test]
    fn format_accepts_object_alias() {
        let f: PayloadFormat = serde_json::from_str(r#""object""#).unwrap();
        assert_eq!(f, PayloadFormat::Legacy);
    }
}
