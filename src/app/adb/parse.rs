use std::collections::HashMap;

/// One line of a `host:track-devices-l` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedLine {
    pub serial: String,
    pub state: String,
    pub product: String,
    pub model: String,
    pub device: String,
    pub transport_id: String,
}

/// Parses one snapshot payload. Lines are whitespace-separated token lists:
/// `serial state [product:X] [model:X] [device:X] [transport_id:X]`.
/// Unknown tokens are ignored; a line without a state is skipped.
pub fn parse_track_snapshot(payload: &str) -> Vec<TrackedLine> {
    payload
        .lines()
        .filter_map(parse_track_line)
        .collect()
}

fn parse_track_line(line: &str) -> Option<TrackedLine> {
    let mut tokens = line.split_whitespace();
    let serial = tokens.next()?.to_string();
    let state = tokens.next()?.to_string();

    let mut parsed = TrackedLine {
        serial,
        state,
        ..TrackedLine::default()
    };
    for token in tokens {
        if let Some(value) = token.strip_prefix("product:") {
            parsed.product = value.to_string();
        } else if let Some(value) = token.strip_prefix("model:") {
            parsed.model = value.to_string();
        } else if let Some(value) = token.strip_prefix("device:") {
            parsed.device = value.to_string();
        } else if let Some(value) = token.strip_prefix("transport_id:") {
            parsed.transport_id = value.to_string();
        }
    }
    Some(parsed)
}

/// `adb shell getprop` output: `[key]: [value]` per line.
pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_track_line() {
        let payload = "0123456789ABCDEF\tdevice product:panther model:Pixel_7 device:panther transport_id:1\n";
        let lines = parse_track_snapshot(payload);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].serial, "0123456789ABCDEF");
        assert_eq!(lines[0].state, "device");
        assert_eq!(lines[0].product, "panther");
        assert_eq!(lines[0].model, "Pixel_7");
        assert_eq!(lines[0].transport_id, "1");
    }

    #[test]
    fn skips_lines_without_state() {
        let lines = parse_track_snapshot("loneserial\n\nA offline\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].serial, "A");
        assert_eq!(lines[0].state, "offline");
    }

    #[test]
    fn ignores_unknown_tokens() {
        let lines = parse_track_snapshot("A device usb:1-2 weird:token model:Pixel\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].model, "Pixel");
        assert_eq!(lines[0].product, "");
    }

    #[test]
    fn empty_snapshot_produces_no_lines() {
        assert!(parse_track_snapshot("").is_empty());
        assert!(parse_track_snapshot("\n\n").is_empty());
    }

    #[test]
    fn parses_getprop_map() {
        let output = "[ro.product.manufacturer]: [Google]\n[ro.build.version.release]: [14]\nnoise\n";
        let map = parse_getprop_map(output);
        assert_eq!(map.get("ro.product.manufacturer").map(String::as_str), Some("Google"));
        assert_eq!(map.get("ro.build.version.release").map(String::as_str), Some("14"));
        assert_eq!(map.len(), 2);
    }
}
