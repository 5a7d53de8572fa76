//! Structural checks for STAC 1.0 Items and Collections.
//!
//! Documents are inspected as raw JSON so that every problem can be reported
//! at once instead of stopping at the first deserialization error.

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};

pub const STAC_VERSION: &str = "1.0.0";

/// Violations found in a STAC Item. Empty means structurally valid.
pub fn validate_item(doc: &Value) -> Vec<String> {
    let mut errs = Vec::new();
    let Some(obj) = doc.as_object() else {
        return vec!["item must be a JSON object".into()];
    };

    if obj.get("type").and_then(Value::as_str) != Some("Feature") {
        errs.push("type must be \"Feature\"".into());
    }
    require_string(obj, "stac_version", &mut errs);
    require_string(obj, "id", &mut errs);
    require_string(obj, "collection", &mut errs);

    match obj.get("geometry") {
        None => errs.push("geometry is required (use null for no geometry)".into()),
        Some(Value::Null) => {
            if let Some(bbox) = obj.get("bbox") {
                check_bbox("bbox", bbox, &mut errs);
            }
        }
        Some(Value::Object(geometry)) => {
            if geometry.get("type").and_then(Value::as_str).is_none() {
                errs.push("geometry.type must be a string".into());
            }
            match obj.get("bbox") {
                Some(bbox) => check_bbox("bbox", bbox, &mut errs),
                None => errs.push("bbox is required when geometry is not null".into()),
            }
        }
        Some(_) => errs.push("geometry must be an object or null".into()),
    }

    match obj.get("properties") {
        Some(Value::Object(props)) => check_item_datetimes(props, &mut errs),
        _ => errs.push("properties must be an object".into()),
    }

    check_links(obj, &mut errs);

    match obj.get("assets") {
        Some(Value::Object(assets)) => {
            for (key, asset) in assets {
                match asset.get("href") {
                    Some(Value::String(href)) if !href.trim().is_empty() => {}
                    _ => errs.push(format!("assets.{key}.href must be a non-empty string")),
                }
            }
        }
        _ => errs.push("assets must be an object".into()),
    }

    errs
}

/// Violations found in a STAC Collection. Empty means structurally valid.
pub fn validate_collection(doc: &Value) -> Vec<String> {
    let mut errs = Vec::new();
    let Some(obj) = doc.as_object() else {
        return vec!["collection must be a JSON object".into()];
    };

    if obj.get("type").and_then(Value::as_str) != Some("Collection") {
        errs.push("type must be \"Collection\"".into());
    }
    require_string(obj, "stac_version", &mut errs);
    require_string(obj, "id", &mut errs);
    require_string(obj, "description", &mut errs);
    require_string(obj, "license", &mut errs);

    match obj.get("extent") {
        Some(Value::Object(extent)) => {
            match extent
                .get("spatial")
                .and_then(|s| s.get("bbox"))
                .and_then(Value::as_array)
            {
                Some(boxes) if !boxes.is_empty() => {
                    for (i, bbox) in boxes.iter().enumerate() {
                        check_bbox(&format!("extent.spatial.bbox[{i}]"), bbox, &mut errs);
                    }
                }
                _ => errs.push("extent.spatial.bbox must be a non-empty array of boxes".into()),
            }
            match extent
                .get("temporal")
                .and_then(|t| t.get("interval"))
                .and_then(Value::as_array)
            {
                Some(intervals) if !intervals.is_empty() => {
                    for (i, interval) in intervals.iter().enumerate() {
                        check_interval(i, interval, &mut errs);
                    }
                }
                _ => errs.push("extent.temporal.interval must be a non-empty array".into()),
            }
        }
        _ => errs.push("extent must be an object".into()),
    }

    check_links(obj, &mut errs);
    errs
}

/// Href of every asset, keyed by asset name. Non-string hrefs are skipped;
/// the structural check reports them.
pub fn asset_hrefs(doc: &Value) -> Vec<(String, String)> {
    doc.get("assets")
        .and_then(Value::as_object)
        .map(|assets| {
            assets
                .iter()
                .filter_map(|(key, asset)| {
                    asset
                        .get("href")
                        .and_then(Value::as_str)
                        .map(|href| (key.clone(), href.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

fn require_string(obj: &Map<String, Value>, field: &str, errs: &mut Vec<String>) {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(_) => errs.push(format!("{field} must be a non-empty string")),
        None => errs.push(format!("{field} is required")),
    }
}

fn check_bbox(label: &str, bbox: &Value, errs: &mut Vec<String>) {
    let Some(values) = bbox.as_array() else {
        errs.push(format!("{label} must be an array"));
        return;
    };
    let nums: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    if nums.len() != values.len() || !(nums.len() == 4 || nums.len() == 6) {
        errs.push(format!("{label} must contain 4 or 6 numbers"));
        return;
    }
    let dims = nums.len() / 2;
    let (min, max) = nums.split_at(dims);
    // Index 0 is longitude, which may cross the antimeridian (west > east).
    for axis in 1..dims {
        if min[axis] > max[axis] {
            errs.push(format!("{label} has min > max on axis {axis}"));
        }
    }
    if !(-180.0..=180.0).contains(&min[0]) || !(-180.0..=180.0).contains(&max[0]) {
        errs.push(format!("{label} longitude out of range"));
    }
    if !(-90.0..=90.0).contains(&min[1]) || !(-90.0..=90.0).contains(&max[1]) {
        errs.push(format!("{label} latitude out of range"));
    }
}

fn check_interval(i: usize, interval: &Value, errs: &mut Vec<String>) {
    let label = format!("extent.temporal.interval[{i}]");
    let Some(pair) = interval.as_array().filter(|p| p.len() == 2) else {
        errs.push(format!("{label} must be a [start, end] pair"));
        return;
    };
    let mut bounds = Vec::with_capacity(2);
    for value in pair {
        match value {
            Value::Null => bounds.push(None),
            Value::String(s) => match parse_datetime(s) {
                Some(dt) => bounds.push(Some(dt)),
                None => {
                    errs.push(format!("{label} has a non RFC 3339 datetime {s:?}"));
                    return;
                }
            },
            _ => {
                errs.push(format!("{label} bounds must be strings or null"));
                return;
            }
        }
    }
    if let (Some(start), Some(end)) = (bounds[0], bounds[1]) {
        if start > end {
            errs.push(format!("{label} starts after it ends"));
        }
    }
}

fn check_item_datetimes(props: &Map<String, Value>, errs: &mut Vec<String>) {
    let ranged = |field: &str, errs: &mut Vec<String>| match props.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            let parsed = parse_datetime(s);
            if parsed.is_none() {
                errs.push(format!("properties.{field} is not an RFC 3339 datetime"));
            }
            parsed
        }
        Some(_) => {
            errs.push(format!("properties.{field} must be a string"));
            None
        }
    };
    let start = ranged("start_datetime", errs);
    let end = ranged("end_datetime", errs);

    match props.get("datetime") {
        Some(Value::String(s)) => {
            if parse_datetime(s).is_none() {
                errs.push("properties.datetime is not an RFC 3339 datetime".into());
            }
        }
        Some(Value::Null) => {
            if !(props.contains_key("start_datetime") && props.contains_key("end_datetime")) {
                errs.push(
                    "properties.start_datetime and properties.end_datetime are required when datetime is null"
                        .into(),
                );
            }
        }
        Some(_) => errs.push("properties.datetime must be a string or null".into()),
        None => errs.push("properties.datetime is required".into()),
    }

    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            errs.push("properties.start_datetime is after properties.end_datetime".into());
        }
    }
}

fn check_links(obj: &Map<String, Value>, errs: &mut Vec<String>) {
    match obj.get("links") {
        Some(Value::Array(links)) => {
            for (i, link) in links.iter().enumerate() {
                let rel_ok = link.get("rel").and_then(Value::as_str).is_some();
                let href_ok = link.get("href").and_then(Value::as_str).is_some();
                if !rel_ok || !href_ok {
                    errs.push(format!("links[{i}] needs string rel and href"));
                }
            }
        }
        _ => errs.push("links must be an array".into()),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures;
    use super::*;
    use serde_json::json;

    #[test]
    fn example_item_is_valid() {
        assert!(validate_item(&fixtures::item()).is_empty());
    }

    #[test]
    fn example_collection_is_valid() {
        assert!(validate_collection(&fixtures::collection()).is_empty());
    }

    #[test]
    fn non_object_is_rejected() {
        assert_eq!(validate_item(&json!([1, 2])).len(), 1);
        assert_eq!(validate_collection(&json!("x")).len(), 1);
    }

    #[test]
    fn item_reports_every_problem() {
        let mut item = fixtures::item();
        item["type"] = json!("FeatureCollection");
        item.as_object_mut().unwrap().remove("collection");
        item["bbox"] = json!([0, 10, 1, 5]);
        item["links"] = json!([{ "href": "x" }]);
        item["assets"]["visual"]["href"] = json!(42);
        let errs = validate_item(&item);
        assert_eq!(errs.len(), 5, "{errs:?}");
        assert!(errs.iter().any(|e| e.contains("collection is required")));
        assert!(errs.iter().any(|e| e.contains("min > max")));
        assert!(errs.iter().any(|e| e.contains("assets.visual.href")));
    }

    #[test]
    fn bbox_required_with_geometry_only() {
        let mut item = fixtures::item();
        item.as_object_mut().unwrap().remove("bbox");
        assert_eq!(validate_item(&item), vec!["bbox is required when geometry is not null"]);

        item["geometry"] = Value::Null;
        assert!(validate_item(&item).is_empty());
    }

    #[test]
    fn antimeridian_bbox_is_allowed() {
        let mut item = fixtures::item();
        item["bbox"] = json!([170.0, -10.0, -170.0, 10.0]);
        assert!(validate_item(&item).is_empty());
    }

    #[test]
    fn null_datetime_needs_range() {
        let mut item = fixtures::item();
        item["properties"] = json!({ "datetime": null });
        assert_eq!(validate_item(&item).len(), 1);

        item["properties"] = json!({
            "datetime": null,
            "start_datetime": "2021-01-01T00:00:00Z",
            "end_datetime": "2020-01-01T00:00:00Z"
        });
        let errs = validate_item(&item);
        assert_eq!(errs, vec!["properties.start_datetime is after properties.end_datetime"]);

        item["properties"]["end_datetime"] = json!("2021-12-31T23:59:59Z");
        assert!(validate_item(&item).is_empty());
    }

    #[test]
    fn bad_datetime_is_reported() {
        let mut item = fixtures::item();
        item["properties"]["datetime"] = json!("2020-13-45");
        assert_eq!(validate_item(&item).len(), 1);
    }

    #[test]
    fn collection_extent_checks() {
        let mut c = fixtures::collection();
        c["extent"]["spatial"]["bbox"] = json!([]);
        c["extent"]["temporal"]["interval"] = json!([["2021-01-01T00:00:00Z", "2020-01-01T00:00:00Z"]]);
        c.as_object_mut().unwrap().remove("license");
        let errs = validate_collection(&c);
        assert_eq!(errs.len(), 3, "{errs:?}");
    }

    #[test]
    fn asset_hrefs_lists_string_hrefs() {
        let hrefs = asset_hrefs(&fixtures::item());
        assert_eq!(hrefs.len(), 2);
        assert!(hrefs.iter().any(|(k, h)| k == "thumbnail" && h.ends_with(".jpg")));
        assert!(asset_hrefs(&json!({})).is_empty());
    }
}
