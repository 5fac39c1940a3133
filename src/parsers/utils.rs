use crate::track::FieldValue;

pub const LINE_PREVIEW_LIMIT: usize = 100;

/// Type a single CSV cell.
///
/// Surrounding whitespace (including the `\r` left behind by CRLF files) is stripped first.
/// Non-empty text that parses as a finite number becomes a number; anything else, including
/// `NaN` and `inf`, is kept as trimmed text. A leading number is not salvaged from mixed
/// text: `12abc` stays text rather than becoming 12.
pub fn parse_field(raw: &str) -> FieldValue {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        if let Ok(value) = trimmed.parse::<f64>() {
            if value.is_finite() {
                return FieldValue::Number(value);
            }
        }
    }
    FieldValue::Text(trimmed.to_string())
}

/// Truncate a line for log output without splitting a UTF-8 character.
pub(crate) fn line_preview(line: &str) -> &str {
    if line.len() <= LINE_PREVIEW_LIMIT {
        return line;
    }
    let mut end = LINE_PREVIEW_LIMIT;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

pub(crate) fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}
