use chrono::{DateTime, TimeZone, Utc};

fn fmt_ts(ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

fn sanitize(camera: &str) -> String {
    camera
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// File name of a settle heat map PNG.
/// e.g. "top-camera_settle_20260218T093000000Z_f003.png"
pub fn heat_map_file_name(camera: &str, started_ms: i64, frame_number: usize) -> String {
    format!(
        "{camera}_settle_{start}_f{frame_number:03}.png",
        camera = sanitize(camera),
        start = fmt_ts(started_ms),
    )
}

/// File name of a settle graph export.
/// e.g. "top-camera_settle_20260218T093000000Z.json"
pub fn graph_file_name(camera: &str, started_ms: i64) -> String {
    format!(
        "{camera}_settle_{start}.json",
        camera = sanitize(camera),
        start = fmt_ts(started_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        // 2026-02-18T09:30:00.000Z
        let start = 1771407000000i64;
        let png = heat_map_file_name("Top Camera", start, 3);
        assert_eq!(png, "Top_Camera_settle_20260218T093000000Z_f003.png");

        let json = graph_file_name("top", start);
        assert!(json.ends_with(".json"));
        // heat maps and graph of one cycle share the stem
        assert!(heat_map_file_name("top", start, 1).starts_with(json.trim_end_matches(".json")));
    }
}
