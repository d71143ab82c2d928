use crate::config::{GeocoderConfig, InputConfig};
use crate::types::{
    latitude_in_range, longitude_in_range, Record, RecordSet, LATITUDE, LONGITUDE,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Geocoding request failed")]
    Http(#[from] reqwest::Error),
    #[error("Geocoding service rate limit hit")]
    RateLimited,
    #[error("Geocoding response malformed: {0}")]
    Malformed(String),
}

/// External geocoding collaborator: free-text place name in, WGS84 pair or
/// not-found out.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, place: &str) -> Result<Option<(f64, f64)>, GeocodeError>;
}

/// Nominatim-style HTTP geocoder. One bounded-timeout GET per lookup.
pub struct HttpGeocoder {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

impl HttpGeocoder {
    pub fn new(config: &GeocoderConfig) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(HttpGeocoder {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, place: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
        let url = format!("{}/search", self.endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[("q", place), ("format", "json"), ("limit", "1")])
            .send()
            .await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::RateLimited);
        }
        let hits: Vec<SearchHit> = response.error_for_status()?.json().await?;
        parse_hit(hits.into_iter().next())
    }
}

fn parse_hit(hit: Option<SearchHit>) -> Result<Option<(f64, f64)>, GeocodeError> {
    let Some(hit) = hit else {
        return Ok(None);
    };
    let lat: f64 = hit
        .lat
        .parse()
        .map_err(|_| GeocodeError::Malformed(format!("latitude '{}'", hit.lat)))?;
    let lon: f64 = hit
        .lon
        .parse()
        .map_err(|_| GeocodeError::Malformed(format!("longitude '{}'", hit.lon)))?;
    if !latitude_in_range(lat) || !longitude_in_range(lon) {
        return Err(GeocodeError::Malformed(format!(
            "coordinates out of range: {lat}, {lon}"
        )));
    }
    Ok(Some((lat, lon)))
}

/// Per-record resolution failure. Non-fatal: collected and handed back with
/// the resolved set.
#[derive(Debug, Clone)]
pub struct ResolutionWarning {
    pub row: usize,
    pub place: Option<String>,
    pub reason: String,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.place {
            Some(place) => write!(f, "row {}: '{}': {}", self.row, place, self.reason),
            None => write!(f, "row {}: {}", self.row, self.reason),
        }
    }
}

/// Cache key: case-insensitive, trimmed place name.
fn normalize(place: &str) -> String {
    place.trim().to_lowercase()
}

/// Fills the canonical `latitude`/`longitude` columns of every record.
///
/// Explicit in-range coordinate columns win without a lookup. Everything
/// else goes through the geocoder behind a per-run cache, so identical
/// place names cost exactly one external call. A failing record warns and
/// stays null; the rest of the batch is unaffected.
pub struct Resolver<'a> {
    geocoder: &'a dyn Geocoder,
    cache: HashMap<String, Option<(f64, f64)>>,
}

impl<'a> Resolver<'a> {
    pub fn new(geocoder: &'a dyn Geocoder) -> Self {
        Resolver {
            geocoder,
            cache: HashMap::new(),
        }
    }

    pub async fn resolve(
        &mut self,
        set: &RecordSet,
        input: &InputConfig,
    ) -> (RecordSet, Vec<ResolutionWarning>) {
        let mut schema = set.schema().to_vec();
        for canonical in [LATITUDE, LONGITUDE] {
            if !schema.iter().any(|c| c == canonical) {
                schema.push(canonical.to_string());
            }
        }
        let mut resolved = RecordSet::new(schema);
        let lat_idx = resolved.field_index(LATITUDE).unwrap();
        let lon_idx = resolved.field_index(LONGITUDE).unwrap();

        let mut warnings = Vec::new();

        for record in &set.records {
            let mut values = record.values.clone();
            values.resize(resolved.schema().len(), Value::Null);

            let mut coords = None;
            let mut failure: Option<String> = None;

            if let Some((lat_col, lon_col)) = input.coordinate_columns() {
                let lat = set.get_f64(record, lat_col);
                let lon = set.get_f64(record, lon_col);
                if let (Some(lat), Some(lon)) = (lat, lon) {
                    if latitude_in_range(lat) && longitude_in_range(lon) {
                        coords = Some((lat, lon));
                    } else {
                        failure = Some(format!("explicit coordinates out of range: {lat}, {lon}"));
                    }
                }
            }

            let place = input
                .place_column
                .as_deref()
                .and_then(|col| set.get_str(record, col))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());

            if coords.is_none() {
                match &place {
                    Some(name) => match self.lookup(name).await {
                        Ok(Some(pair)) => {
                            coords = Some(pair);
                            failure = None;
                        }
                        Ok(None) => {
                            failure = Some("place not found".to_string());
                        }
                        Err(err) => {
                            failure = Some(err.to_string());
                        }
                    },
                    None => {
                        if failure.is_none() {
                            failure = Some("no coordinates and no place name".to_string());
                        }
                    }
                }
            }

            match coords {
                Some((lat, lon)) => {
                    values[lat_idx] = number(lat);
                    values[lon_idx] = number(lon);
                }
                None => {
                    values[lat_idx] = Value::Null;
                    values[lon_idx] = Value::Null;
                    let reason = failure.unwrap_or_else(|| "unresolved".to_string());
                    warn!(row = record.index, place = ?place, %reason, "resolution failed");
                    warnings.push(ResolutionWarning {
                        row: record.index,
                        place: place.clone(),
                        reason,
                    });
                }
            }

            resolved.push(Record {
                index: record.index,
                values,
            });
        }

        debug!(
            rows = resolved.len(),
            warnings = warnings.len(),
            lookups = self.cache.len(),
            "resolution pass complete"
        );
        (resolved, warnings)
    }

    async fn lookup(&mut self, place: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
        let key = normalize(place);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(*cached);
        }
        match self.geocoder.geocode(place).await {
            Ok(found) => {
                self.cache.insert(key, found);
                Ok(found)
            }
            Err(err) => {
                // Failures are cached too: retrying the same bad name for
                // every duplicate row would defeat the dedup contract.
                self.cache.insert(key, None);
                Err(err)
            }
        }
    }
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}


#[cfg(test)]
mod tests {
    use super::testing::StaticGeocoder;
    use super::*;

    fn input(place: Option<&str>, coords: bool) -> InputConfig {
        InputConfig {
            data_csv: "unused.csv".into(),
            id_column: "id".to_string(),
            latitude_column: coords.then(|| "lat".to_string()),
            longitude_column: coords.then(|| "lon".to_string()),
            place_column: place.map(|p| p.to_string()),
        }
    }

    fn set_with_places(names: &[&str]) -> RecordSet {
        let mut set = RecordSet::new(vec!["id".to_string(), "place".to_string()]);
        for (i, name) in names.iter().enumerate() {
            set.push(Record {
                index: i,
                values: vec![serde_json::json!(i as i64), serde_json::json!(*name)],
            });
        }
        set
    }

    #[tokio::test]
    async fn explicit_coordinates_skip_the_geocoder() {
        let mut set = RecordSet::new(vec![
            "id".to_string(),
            "lat".to_string(),
            "lon".to_string(),
            "place".to_string(),
        ]);
        set.push(Record {
            index: 0,
            values: vec![
                serde_json::json!(1),
                serde_json::json!(10.0),
                serde_json::json!(20.0),
                serde_json::json!("X"),
            ],
        });
        set.push(Record {
            index: 1,
            values: vec![
                serde_json::json!(2),
                Value::Null,
                Value::Null,
                serde_json::json!("X"),
            ],
        });

        let geocoder = StaticGeocoder::new(&[("X", (5.0, 6.0))]);
        let mut resolver = Resolver::new(&geocoder);
        let (resolved, warnings) = resolver.resolve(&set, &input(Some("place"), true)).await;

        assert!(warnings.is_empty());
        assert_eq!(resolved.coords(&resolved.records[0]), Some((10.0, 20.0)));
        assert_eq!(resolved.coords(&resolved.records[1]), Some((5.0, 6.0)));
        assert_eq!(geocoder.call_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_place_names_cost_one_lookup() {
        let names: Vec<&str> = std::iter::repeat("Dublin").take(100).collect();
        let set = set_with_places(&names);
        let geocoder = StaticGeocoder::new(&[("Dublin", (53.35, -6.26))]);
        let mut resolver = Resolver::new(&geocoder);

        let (resolved, warnings) = resolver.resolve(&set, &input(Some("place"), false)).await;

        assert_eq!(resolved.len(), 100);
        assert!(warnings.is_empty());
        assert_eq!(geocoder.call_count(), 1);
        for record in &resolved.records {
            assert_eq!(resolved.coords(record), Some((53.35, -6.26)));
        }
    }

    #[tokio::test]
    async fn normalization_merges_case_and_whitespace_variants() {
        let set = set_with_places(&["Dublin", "  dublin ", "DUBLIN"]);
        let geocoder = StaticGeocoder::new(&[("Dublin", (53.35, -6.26))]);
        let mut resolver = Resolver::new(&geocoder);

        let (_, warnings) = resolver.resolve(&set, &input(Some("place"), false)).await;

        assert!(warnings.is_empty());
        assert_eq!(geocoder.call_count(), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_poison_the_batch() {
        let names = [
            "Cork", "Cork", "Galway", "Atlantis", "Cork", "Galway", "Cork", "Galway", "Cork",
            "Cork",
        ];
        let set = set_with_places(&names);
        let geocoder =
            StaticGeocoder::new(&[("Cork", (51.9, -8.47)), ("Galway", (53.27, -9.05))]);
        let mut resolver = Resolver::new(&geocoder);

        let (resolved, warnings) = resolver.resolve(&set, &input(Some("place"), false)).await;

        assert_eq!(resolved.len(), 10);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].row, 3);
        assert_eq!(warnings[0].place.as_deref(), Some("Atlantis"));
        assert_eq!(resolved.coords(&resolved.records[3]), None);
        let resolved_count = resolved
            .records
            .iter()
            .filter(|r| resolved.coords(r).is_some())
            .count();
        assert_eq!(resolved_count, 9);
    }

    #[tokio::test]
    async fn geocoder_errors_warn_and_continue() {
        let set = set_with_places(&["Cork", "Broken", "Broken"]);
        let geocoder = StaticGeocoder::new(&[("Cork", (51.9, -8.47))]).failing_on("Broken");
        let mut resolver = Resolver::new(&geocoder);

        let (resolved, warnings) = resolver.resolve(&set, &input(Some("place"), false)).await;

        assert_eq!(warnings.len(), 2);
        assert_eq!(resolved.coords(&resolved.records[0]), Some((51.9, -8.47)));
        // The failed lookup is cached; the duplicate row does not retry.
        assert_eq!(geocoder.call_count(), 2);
    }

    #[tokio::test]
    async fn out_of_range_explicit_coordinates_fall_back_to_place() {
        let mut set = RecordSet::new(vec![
            "id".to_string(),
            "lat".to_string(),
            "lon".to_string(),
            "place".to_string(),
        ]);
        set.push(Record {
            index: 0,
            values: vec![
                serde_json::json!(1),
                serde_json::json!(999.0),
                serde_json::json!(0.0),
                serde_json::json!("Cork"),
            ],
        });
        let geocoder = StaticGeocoder::new(&[("Cork", (51.9, -8.47))]);
        let mut resolver = Resolver::new(&geocoder);

        let (resolved, warnings) = resolver.resolve(&set, &input(Some("place"), true)).await;

        assert!(warnings.is_empty());
        assert_eq!(resolved.coords(&resolved.records[0]), Some((51.9, -8.47)));
    }

    #[test]
    fn hit_parsing_validates_ranges() {
        let hit = SearchHit {
            lat: "53.3".to_string(),
            lon: "-6.2".to_string(),
        };
        assert_eq!(parse_hit(Some(hit)).unwrap(), Some((53.3, -6.2)));
        assert_eq!(parse_hit(None).unwrap(), None);

        let bad = SearchHit {
            lat: "95.0".to_string(),
            lon: "0.0".to_string(),
        };
        assert!(matches!(
            parse_hit(Some(bad)),
            Err(GeocodeError::Malformed(_))
        ));
    }
}
