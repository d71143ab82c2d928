use crate::filter::Predicate;
use crate::types::Style;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    pub geocoder: GeocoderConfig,
    pub basemap: BasemapConfig,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub data_csv: PathBuf,
    pub id_column: String,
    pub latitude_column: Option<String>,
    pub longitude_column: Option<String>,
    pub place_column: Option<String>,
}

impl InputConfig {
    /// Explicit coordinate column pair, when both sides are configured.
    pub fn coordinate_columns(&self) -> Option<(&str, &str)> {
        match (&self.latitude_column, &self.longitude_column) {
            (Some(lat), Some(lon)) => Some((lat.as_str(), lon.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_user_agent() -> String {
    concat!("placemap/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Deserialize, Clone)]
pub struct BasemapConfig {
    pub provider: String,
    pub center: CenterConfig,
    pub zoom: u8,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CenterConfig {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Points,
    Density,
    Polygon,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LayerConfig {
    pub name: String,
    pub kind: LayerKind,
    pub filter: Option<Predicate>,
    #[serde(default)]
    pub style: Style,
    pub group: Option<String>,
    /// Popup template for point layers, e.g. `"{name} ({category})"`.
    pub popup: Option<String>,
    /// Density layers only: fewer usable points than this degrades the
    /// layer to empty.
    pub min_points: Option<usize>,
    /// Polygon layers only.
    pub boundary: Option<BoundaryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoundaryConfig {
    pub source: PathBuf,
    pub region: String,
    pub admin_level: u8,
    #[serde(default = "default_region_property")]
    pub region_property: String,
    pub level_property: Option<String>,
}

fn default_region_property() -> String {
    "name".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub png: Option<String>,
    pub html: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_background")]
    pub background: String,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    960
}

fn default_background() -> String {
    "#f2efe9".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { port: 8080 }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks TOML deserialization cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.input.coordinate_columns().is_none() && self.input.place_column.is_none() {
            return Err(anyhow!(
                "Input must declare latitude/longitude columns, a place column, or both"
            ));
        }
        if self.input.latitude_column.is_some() != self.input.longitude_column.is_some() {
            return Err(anyhow!(
                "latitude_column and longitude_column must be configured together"
            ));
        }
        for layer in &self.layers {
            match layer.kind {
                LayerKind::Polygon => {
                    if layer.boundary.is_none() {
                        return Err(anyhow!(
                            "Polygon layer '{}' needs a [layers.boundary] section",
                            layer.name
                        ));
                    }
                }
                LayerKind::Points | LayerKind::Density => {
                    if layer.boundary.is_some() {
                        return Err(anyhow!(
                            "Layer '{}' is not a polygon layer but has a boundary section",
                            layer.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
        [input]
        data_csv = "records.csv"
        id_column = "id"
        place_column = "address"

        [geocoder]
        endpoint = "https://nominatim.openstreetmap.org"
        timeout = "5s"

        [basemap]
        provider = "openstreetmap"
        center = { lat = 53.35, lon = -6.26 }
        zoom = 12

        [[layers]]
        name = "libraries"
        kind = "points"
        filter = { kind = "equals", field = "category", value = "library" }
        group = "Amenities"
        popup = "{name}"

        [layers.style]
        color = "#d62728"
        radius = 4.0

        [[layers]]
        name = "heat"
        kind = "density"
        min_points = 3

        [output]
        dir = "output"
        html = "map.html"
    "##;

    #[test]
    fn sample_config_parses() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.layers[0].kind, LayerKind::Points);
        assert_eq!(config.layers[0].style.color, "#d62728");
        assert_eq!(config.layers[1].min_points, Some(3));
        assert_eq!(config.geocoder.timeout, Duration::from_secs(5));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn polygon_layer_requires_boundary() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.layers[0].kind = LayerKind::Polygon;
        assert!(config.validate().is_err());
    }

    #[test]
    fn coordinate_columns_must_pair() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.input.latitude_column = Some("lat".to_string());
        assert!(config.validate().is_err());
    }
}
