//! Flow-card price input: accepts either an array of 24 numbers or a
//! string-keyed `hour -> price` mapping, in strict JSON or single-quoted
//! pseudo-JSON with trailing commas - handled via an explicit validator,
//! not pattern guessing.

use serde_json::Value;

use crate::price::errors::PriceError;

/// Parses a flow price payload into an hour-indexed vector (index 0..23,
/// or more on a DST day). Missing hours are reported by `storeFlowPriceData`
/// as `None` entries rather than rejected outright.
///
/// # Arguments
///
/// * 'raw' - the raw payload string, possibly non-strict JSON
/// * 'hours_in_day' - expected bucket count for the target local day
pub fn parse_flow_payload(raw: &str, hours_in_day: usize) -> Result<Vec<Option<f64>>, PriceError> {
    let value = parse_lenient(raw)?;

    match value {
        Value::Array(items) => {
            let mut out = vec![None; hours_in_day];
            for (i, item) in items.iter().enumerate().take(hours_in_day) {
                out[i] = item.as_f64();
            }
            Ok(out)
        }
        Value::Object(map) => {
            let mut out = vec![None; hours_in_day];
            for (key, v) in map {
                if let Ok(hour) = key.parse::<usize>() {
                    if hour < hours_in_day {
                        out[hour] = v.as_f64();
                    }
                }
            }
            Ok(out)
        }
        other => Err(PriceError::InvalidFlowPayload(format!("expected array or object, got {}", other))),
    }
}

/// Tries strict JSON first, then re-parses after normalizing single quotes
/// to double quotes and stripping trailing commas before `]`/`}`.
fn parse_lenient(raw: &str) -> Result<Value, PriceError> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Ok(v);
    }

    let normalized = normalize_pseudo_json(raw);
    serde_json::from_str::<Value>(&normalized).map_err(|e| PriceError::InvalidFlowPayload(e.to_string()))
}

fn normalize_pseudo_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' if !in_string => {
                out.push('"');
            }
            '\'' if in_string => {
                out.push('"');
                in_string = false;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            _ => out.push(c),
        }
        i += 1;
    }

    strip_trailing_commas(&out)
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == ']' || chars[j] == '}') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Missing-hour report used by `storeFlowPriceData`.
pub fn missing_hours(prices_by_hour: &[Option<f64>]) -> Vec<usize> {
    prices_by_hour.iter().enumerate().filter_map(|(i, v)| if v.is_none() { Some(i) } else { None }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strict_json_array() {
        let raw = "[1.0, 2.0, 3.0]";
        let parsed = parse_flow_payload(raw, 24).unwrap();
        assert_eq!(parsed[0], Some(1.0));
        assert_eq!(parsed[2], Some(3.0));
        assert_eq!(parsed[3], None);
    }

    #[test]
    fn parses_single_quoted_trailing_comma_object() {
        let raw = "{'0': 1.1, '1': 2.2, }";
        let parsed = parse_flow_payload(raw, 24).unwrap();
        assert_eq!(parsed[0], Some(1.1));
        assert_eq!(parsed[1], Some(2.2));
    }

    #[test]
    fn reports_missing_hours() {
        let parsed = vec![Some(1.0), None, Some(3.0), None];
        assert_eq!(missing_hours(&parsed), vec![1, 3]);
    }

    #[test]
    fn round_trips_build_flow_entries() {
        let raw = "[1.0,2.0,3.0,4.0]";
        let parsed = parse_flow_payload(raw, 4).unwrap();
        let rebuilt: Vec<Option<f64>> = (0..4).map(|h| parsed[h]).collect();
        assert_eq!(parsed, rebuilt);
    }
}
