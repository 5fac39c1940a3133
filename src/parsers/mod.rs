//! CSV row parsing shared by both ingestion engines.
//!
//! The parser works on already-split text lines and a header captured when the source was
//! loaded. Every line is handled on its own: a malformed line is logged and skipped, it never
//! aborts the rest of the batch.

pub mod utils;

use crate::track::{FieldValue, TrackSample};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use utils::{is_blank, line_preview, parse_field};

/// Columns a row must carry for it to become a [`TrackSample`].
pub const REQUIRED_COLUMNS: [&str; 4] = ["track_id", "timestamp", "x", "y"];

/// Ordered column names from the first line of a CSV source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvHeader {
    columns: Vec<String>,
}

impl CsvHeader {
    /// Parse a header line. Returns `None` when the line names no columns at all.
    pub fn parse(line: &str) -> Option<Self> {
        let columns: Vec<String> = line.split(',').map(|name| name.trim().to_string()).collect();
        if columns.iter().all(String::is_empty) {
            return None;
        }
        Some(Self { columns })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Required columns that this header does not name.
    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|required| !self.columns.iter().any(|column| column == required))
            .collect()
    }
}

/// Result of parsing a batch of lines.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub samples: Vec<TrackSample>,
    /// Non-blank lines that failed validation.
    pub rejected: usize,
}

impl ParseOutcome {
    pub fn accepted(&self) -> usize {
        self.samples.len()
    }
}

/// Parse every line against `header`, keeping only valid samples.
pub fn parse_rows<'a, I>(lines: I, header: &CsvHeader) -> ParseOutcome
where
    I: IntoIterator<Item = &'a str>,
{
    let mut outcome = ParseOutcome::default();

    for line in lines {
        if is_blank(line) {
            continue;
        }

        match parse_row(line, header) {
            Some(sample) => outcome.samples.push(sample),
            None => {
                outcome.rejected += 1;
                warn!(line = line_preview(line), "skipping invalid CSV row");
            }
        }
    }

    if outcome.rejected > 0 {
        debug!(
            accepted = outcome.accepted(),
            rejected = outcome.rejected,
            "parsed CSV batch with rejected rows"
        );
    }

    outcome
}

/// Parse one line into a sample, or `None` if it is blank or invalid.
///
/// Values are matched to header columns by position. Values past the end of the header are
/// ignored, and columns without a value in a short row are simply absent.
pub fn parse_row(line: &str, header: &CsvHeader) -> Option<TrackSample> {
    if is_blank(line) {
        return None;
    }

    let fields: BTreeMap<String, FieldValue> = header
        .columns()
        .iter()
        .zip(line.split(','))
        .map(|(column, raw)| (column.clone(), parse_field(raw)))
        .collect();

    TrackSample::from_fields(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_HEADER: &str = "track_id,timestamp,Radar id,time_from_start,num assoc,range,doppler,x,y,z,vx,vy,vz,calc_dopp,is assoc,assoc_timestamp,assoc_x,assoc_y,assoc_z,assoc_dopp,z var,class";
    const FULL_ROW: &str =
        "1,1.0,0,1.0,10,5.0,-0.5,2.0,4.0,0.0,0.0,1.0,0.0,0.5,1,1.0,2.0,4.0,0.0,-0.5,1.0,Human";

    fn header(line: &str) -> CsvHeader {
        CsvHeader::parse(line).expect("header")
    }

    #[test]
    fn header_trims_names_and_reports_missing_columns() {
        let header = header("track_id , timestamp,x\r");
        assert_eq!(header.columns(), ["track_id", "timestamp", "x"]);
        assert_eq!(header.missing_required(), vec!["y"]);
    }

    #[test]
    fn header_without_names_is_rejected() {
        assert!(CsvHeader::parse("").is_none());
        assert!(CsvHeader::parse(" , ,\r").is_none());
    }

    #[test]
    fn parses_full_recording_row_and_keeps_extra_columns() {
        let header = header(FULL_HEADER);
        let sample = parse_row(FULL_ROW, &header).expect("valid row");

        assert_eq!(sample.track_id, FieldValue::Number(1.0));
        assert_eq!(sample.timestamp, 1.0);
        assert_eq!(sample.x, 2.0);
        assert_eq!(sample.y, 4.0);
        assert_eq!(sample.doppler(), Some(-0.5));
        assert_eq!(sample.range(), Some(5.0));
        assert_eq!(sample.class().as_deref(), Some("Human"));
        assert_eq!(sample.field("z var"), Some(&FieldValue::Number(1.0)));
        assert_eq!(sample.fields.len(), header.len());
    }

    #[test]
    fn strips_carriage_returns_before_typing() {
        let header = header("track_id,timestamp,x,y,class\r");
        let sample = parse_row("3,2.5,1.0,-1.0,Vehicle\r", &header).expect("valid row");
        assert_eq!(sample.class().as_deref(), Some("Vehicle"));
        assert_eq!(sample.y, -1.0);
    }

    #[test]
    fn skips_blank_and_invalid_lines_without_aborting() {
        let header = header("track_id,timestamp,x,y");
        let lines = [
            "1,1.0,2.0,3.0",
            "",
            "   \r",
            "2,not-a-time,2.0,3.0",
            ",1.0,2.0,3.0",
            "3,1.0,2.0",
            "4,2.0,NaN,1.0",
            "5,2.0,1.0,1.0",
        ];

        let outcome = parse_rows(lines, &header);
        let ids: Vec<String> = outcome.samples.iter().map(|s| s.track_id.to_string()).collect();
        assert_eq!(ids, vec!["1", "5"]);
        assert_eq!(outcome.rejected, 4);
    }

    #[test]
    fn required_columns_are_found_by_name_in_any_order() {
        let header = header("class,y,x,timestamp,track_id");
        let sample = parse_row("Bird,9,8,7,6", &header).expect("valid row");
        assert_eq!(sample.track_id, FieldValue::Number(6.0));
        assert_eq!((sample.timestamp, sample.x, sample.y), (7.0, 8.0, 9.0));
    }

    #[test]
    fn every_parsed_sample_satisfies_validity() {
        let header = header("track_id,timestamp,x,y,doppler");
        let lines = [
            "1,0.1,1,1,0.5",
            "x,0.1,1,1,0.5",
            " ,0.1,1,1,0.5",
            "2,inf,1,1,0.5",
            "3,0.2,,1,0.5",
            "4,0.2,1,1e400,0.5",
            "5,0.3,1,1,",
        ];
        let outcome = parse_rows(lines, &header);
        assert_eq!(outcome.accepted(), 3);
        for sample in &outcome.samples {
            assert!(!sample.track_id.is_empty());
            assert!(sample.timestamp.is_finite());
            assert!(sample.x.is_finite());
            assert!(sample.y.is_finite());
        }
    }

    #[test]
    fn textual_track_ids_are_accepted() {
        let header = header("track_id,timestamp,x,y,doppler");
        let outcome = parse_rows(["T7,1.0,2.0,3.0,-0.5", "abc-12,1.0,2.0,3.0,0.5"], &header);

        assert_eq!(outcome.accepted(), 2);
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.samples[0].track_id, FieldValue::Text("T7".into()));
        assert_eq!(outcome.samples[1].track_id, FieldValue::Text("abc-12".into()));
    }
}
