use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A single CSV cell after the numeric-or-text decision made at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) => Some(*value),
            FieldValue::Text(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Text(text) if text.is_empty())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(value) => write!(f, "{value}"),
            FieldValue::Text(text) => f.write_str(text),
        }
    }
}

/// One validated CSV row.
///
/// The required columns are lifted out when the sample is built: `track_id` as an opaque
/// identifier, the rest as plain numbers. Every column also stays in `fields` under its header
/// name so extra columns survive ingestion untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSample {
    pub track_id: FieldValue,
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl TrackSample {
    /// Build a sample from a parsed row, or `None` if the row fails validation.
    ///
    /// A row is valid when `track_id` is present and non-empty, and `timestamp`, `x` and `y`
    /// are finite numbers. Nothing else about the row is checked.
    pub fn from_fields(fields: BTreeMap<String, FieldValue>) -> Option<Self> {
        let track_id = fields
            .get("track_id")
            .filter(|value| !value.is_empty())
            .cloned()?;
        let timestamp = finite(&fields, "timestamp")?;
        let x = finite(&fields, "x")?;
        let y = finite(&fields, "y")?;

        Some(Self {
            track_id,
            timestamp,
            x,
            y,
            fields,
        })
    }

    pub fn doppler(&self) -> Option<f64> {
        self.fields.get("doppler").and_then(FieldValue::as_f64)
    }

    pub fn range(&self) -> Option<f64> {
        self.fields.get("range").and_then(FieldValue::as_f64)
    }

    pub fn class(&self) -> Option<String> {
        self.fields
            .get("class")
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    }

    pub fn field(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }
}

fn finite(fields: &BTreeMap<String, FieldValue>, column: &str) -> Option<f64> {
    fields
        .get(column)
        .and_then(FieldValue::as_f64)
        .filter(|value| value.is_finite())
}

/// What the radar display receives for each sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub track_id: FieldValue,
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub velocity: Option<f64>,
    pub doppler: Option<f64>,
    pub range: Option<f64>,
    pub class: Option<String>,
}

impl From<&TrackSample> for Target {
    fn from(sample: &TrackSample) -> Self {
        let doppler = sample.doppler();
        Self {
            track_id: sample.track_id.clone(),
            timestamp: sample.timestamp,
            x: sample.x,
            y: sample.y,
            velocity: doppler.map(f64::abs),
            doppler,
            range: sample.range(),
            class: sample.class(),
        }
    }
}

/// Playback position as reported to the display, in both modes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    pub current_timestamp: f64,
    pub total_timestamps: usize,
    pub current_index: usize,
    pub is_playing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn num(value: f64) -> FieldValue {
        FieldValue::Number(value)
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    #[test]
    fn accepts_row_with_required_columns_only() {
        let sample = TrackSample::from_fields(row(&[
            ("track_id", num(7.0)),
            ("timestamp", num(1.5)),
            ("x", num(-2.0)),
            ("y", num(4.0)),
        ]))
        .expect("valid row");

        assert_eq!(sample.track_id, num(7.0));
        assert_eq!(sample.timestamp, 1.5);
        assert_eq!(sample.doppler(), None);
        assert_eq!(sample.class(), None);
    }

    #[test]
    fn rejects_missing_or_textual_required_columns() {
        let base = [
            ("track_id", num(1.0)),
            ("timestamp", num(1.0)),
            ("x", num(1.0)),
            ("y", num(1.0)),
        ];
        for column in ["track_id", "timestamp", "x", "y"] {
            let missing: Vec<_> = base.iter().filter(|(n, _)| *n != column).cloned().collect();
            assert!(TrackSample::from_fields(row(&missing)).is_none(), "{column} missing");
        }

        for column in ["timestamp", "x", "y"] {
            let textual: Vec<_> = base
                .iter()
                .map(|(n, v)| if *n == column { (*n, text("abc")) } else { (*n, v.clone()) })
                .collect();
            assert!(TrackSample::from_fields(row(&textual)).is_none(), "{column} textual");
        }
    }

    #[test]
    fn textual_track_id_is_kept_as_is() {
        let sample = TrackSample::from_fields(row(&[
            ("track_id", text("T7")),
            ("timestamp", num(1.0)),
            ("x", num(1.0)),
            ("y", num(1.0)),
        ]))
        .expect("valid row");

        assert_eq!(sample.track_id, text("T7"));
        let json = serde_json::to_value(Target::from(&sample)).expect("serialize");
        assert_eq!(json["track_id"], "T7");
    }

    #[test]
    fn rejects_empty_track_id() {
        assert!(TrackSample::from_fields(row(&[
            ("track_id", text("")),
            ("timestamp", num(1.0)),
            ("x", num(1.0)),
            ("y", num(1.0)),
        ]))
        .is_none());
    }

    #[test]
    fn target_velocity_is_absolute_doppler() {
        for doppler in [-3.25, -0.0, 0.0, 2.5] {
            let sample = TrackSample::from_fields(row(&[
                ("track_id", num(1.0)),
                ("timestamp", num(1.0)),
                ("x", num(0.0)),
                ("y", num(0.0)),
                ("doppler", num(doppler)),
                ("range", num(12.0)),
                ("class", text("Human")),
            ]))
            .expect("valid row");

            let target = Target::from(&sample);
            assert_eq!(target.doppler, Some(doppler));
            assert_eq!(target.velocity, Some(doppler.abs()));
            assert_eq!(target.range, Some(12.0));
            assert_eq!(target.class.as_deref(), Some("Human"));
        }
    }

    #[test]
    fn numeric_class_is_rendered_as_text() {
        let sample = TrackSample::from_fields(row(&[
            ("track_id", num(1.0)),
            ("timestamp", num(1.0)),
            ("x", num(0.0)),
            ("y", num(0.0)),
            ("class", num(3.0)),
        ]))
        .expect("valid row");
        assert_eq!(Target::from(&sample).class.as_deref(), Some("3"));
    }

    #[test]
    fn playback_info_serializes_camel_case() {
        let info = PlaybackInfo {
            current_timestamp: 2.5,
            total_timestamps: 4,
            current_index: 1,
            is_playing: true,
        };
        let json = serde_json::to_value(info).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "currentTimestamp": 2.5,
                "totalTimestamps": 4,
                "currentIndex": 1,
                "isPlaying": true,
            })
        );
    }
}
