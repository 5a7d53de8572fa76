//! Dataset definitions: the document a data provider sends to describe a new
//! COG collection and where its files live.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::discovery::{self, DatetimeRange, COG_MEDIA_TYPE};
use crate::stac::STAC_VERSION;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Cog,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeDensity {
    Year,
    Month,
    Day,
}

impl TimeDensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeDensity::Year => "year",
            TimeDensity::Month => "month",
            TimeDensity::Day => "day",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpatialExtent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemporalExtent {
    #[serde(deserialize_with = "lenient_datetime")]
    pub startdate: DateTime<Utc>,
    #[serde(deserialize_with = "lenient_datetime")]
    pub enddate: DateTime<Utc>,
}

/// Where the files of a dataset are found and how to turn them into items.
/// Also the input of a discovery workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryItem {
    #[serde(default = "default_discovery")]
    pub discovery: String,
    #[serde(default)]
    pub cogify: bool,
    #[serde(default)]
    pub upload: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub prefix: String,
    pub bucket: String,
    #[serde(default = "default_filename_regex")]
    pub filename_regex: String,
    #[serde(default)]
    pub datetime_range: Option<DatetimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

fn default_discovery() -> String {
    "s3".to_string()
}

fn default_filename_regex() -> String {
    r"^(.*)\.tif$".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetDefinition {
    pub collection: String,
    pub title: String,
    pub description: String,
    pub license: String,
    #[serde(default)]
    pub is_periodic: bool,
    #[serde(default)]
    pub time_density: Option<TimeDensity>,
    pub spatial_extent: SpatialExtent,
    pub temporal_extent: TemporalExtent,
    pub sample_files: Vec<String>,
    pub discovery_items: Vec<DiscoveryItem>,
    #[serde(default)]
    pub data_type: Option<DataType>,
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare
/// date.
fn lenient_datetime<'de, D>(de: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    parse_lenient(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid datetime {raw}")))
}

fn parse_lenient(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

impl DiscoveryItem {
    /// Whether `sample` (an `s3://bucket/key` url or a bare key) is a file
    /// this discovery would pick up.
    pub fn covers(&self, sample: &str) -> Result<bool, String> {
        let key = match sample.strip_prefix("s3://") {
            Some(rest) => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket != self.bucket {
                    return Ok(false);
                }
                key
            }
            None => sample,
        };
        if !key.starts_with(self.prefix.as_str()) {
            return Ok(false);
        }
        let re = Regex::new(&self.filename_regex)
            .map_err(|e| format!("filename_regex {} does not compile: {e}", self.filename_regex))?;
        let name = discovery::file_name(key);
        Ok(re.is_match(name) || re.is_match(key))
    }

    /// `s3://` url for a sample given as a bare key.
    pub fn object_url(&self, sample: &str) -> String {
        if sample.contains("://") {
            return sample.to_string();
        }
        format!("s3://{}/{}", self.bucket, sample.trim_start_matches('/'))
    }
}

impl DatasetDefinition {
    /// Semantic problems with the definition; empty means it may be
    /// published. Remote checks of the sample files are done separately.
    pub fn check(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.collection.trim().is_empty() {
            errs.push("collection must not be empty".to_string());
        }
        if self.data_type.unwrap_or(DataType::Cog) != DataType::Cog {
            errs.push("only cog datasets can be published".to_string());
        }

        let s = &self.spatial_extent;
        for (name, v) in [("xmin", s.xmin), ("xmax", s.xmax)] {
            if !(-180.0..=180.0).contains(&v) {
                errs.push(format!("spatial_extent.{name} {v} is outside [-180, 180]"));
            }
        }
        for (name, v) in [("ymin", s.ymin), ("ymax", s.ymax)] {
            if !(-90.0..=90.0).contains(&v) {
                errs.push(format!("spatial_extent.{name} {v} is outside [-90, 90]"));
            }
        }
        if s.ymin > s.ymax {
            errs.push("spatial_extent.ymin must not exceed ymax".to_string());
        }
        if self.temporal_extent.startdate > self.temporal_extent.enddate {
            errs.push("temporal_extent.startdate must not be after enddate".to_string());
        }

        if self.discovery_items.is_empty() {
            errs.push("at least one discovery item is required".to_string());
        }
        for (i, d) in self.discovery_items.iter().enumerate() {
            if d.bucket.trim().is_empty() {
                errs.push(format!("discovery_items[{i}].bucket must not be empty"));
            }
            if let Err(e) = Regex::new(&d.filename_regex) {
                errs.push(format!("discovery_items[{i}].filename_regex does not compile: {e}"));
            }
        }

        if self.sample_files.is_empty() {
            errs.push("at least one sample file is required".to_string());
        }
        for sample in &self.sample_files {
            if let Err(e) = self.sample_url(sample) {
                errs.push(e);
            }
        }
        errs
    }

    /// The discovery item a sample file belongs to, checking that its dates
    /// parse when the item declares a `datetime_range`.
    pub fn matching_discovery(&self, sample: &str) -> Result<&DiscoveryItem, String> {
        for d in &self.discovery_items {
            if !d.covers(sample).unwrap_or(false) {
                continue;
            }
            if let Some(range) = d.datetime_range {
                discovery::extract_dates(discovery::file_name(sample), Some(range))
                    .map_err(|e| format!("sample file {sample}: {e}"))?;
            }
            return Ok(d);
        }
        Err(format!(
            "sample file {sample} does not match any discovery item's bucket, prefix and filename_regex"
        ))
    }

    /// Full `s3://` url of a sample file.
    pub fn sample_url(&self, sample: &str) -> Result<String, String> {
        self.matching_discovery(sample).map(|d| d.object_url(sample))
    }

    /// STAC Collection published for this dataset.
    pub fn to_collection(&self) -> Value {
        let s = &self.spatial_extent;
        let stamp = |dt: &DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::Secs, true);
        json!({
            "id": self.collection,
            "type": "Collection",
            "stac_version": STAC_VERSION,
            "title": self.title,
            "description": self.description,
            "license": self.license,
            "extent": {
                "spatial": { "bbox": [[s.xmin, s.ymin, s.xmax, s.ymax]] },
                "temporal": {
                    "interval": [[
                        stamp(&self.temporal_extent.startdate),
                        stamp(&self.temporal_extent.enddate)
                    ]]
                }
            },
            "links": [],
            "dashboard:is_periodic": self.is_periodic,
            "dashboard:time_density": self.time_density.map(|t| t.as_str()),
            "item_assets": {
                "cog_default": {
                    "type": COG_MEDIA_TYPE,
                    "roles": ["data", "layer"],
                    "title": "Default COG Layer",
                    "description": "Cloud optimized default layer to display on map"
                }
            }
        })
    }

    /// Discovery inputs for the workflow runs started on publish, each
    /// pointed at this dataset's collection.
    pub fn discovery_inputs(&self) -> Vec<DiscoveryItem> {
        self.discovery_items
            .iter()
            .cloned()
            .map(|mut d| {
                d.collection = Some(self.collection.clone());
                d
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    pub fn definition() -> Value {
        json!({
            "collection": "caldor-fire-behavior",
            "title": "Caldor Fire Behavior",
            "description": "Fire perimeters and behavior of the Caldor fire",
            "license": "CC0-1.0",
            "is_periodic": false,
            "time_density": "day",
            "spatial_extent": { "xmin": -121.0, "ymin": 38.0, "xmax": -119.0, "ymax": 39.0 },
            "temporal_extent": {
                "startdate": "2021-08-14T00:00:00Z",
                "enddate": "2021-10-21T23:59:59Z"
            },
            "sample_files": ["foo/bar.tif"],
            "discovery_items": [{
                "discovery": "s3",
                "cogify": false,
                "upload": false,
                "dry_run": true,
                "prefix": "foo/",
                "bucket": "veda-data-store-staging",
                "filename_regex": "^(.*)bar.tif$"
            }],
            "data_type": "cog"
        })
    }
}
