use crate::config::BoundaryConfig;
use geo::{MultiPolygon, Polygon};
use geojson::GeoJson;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("Failed to open boundary file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse boundary GeoJSON")]
    Geojson(#[from] geojson::Error),
    #[error("Failed to read boundary Shapefile")]
    Shapefile(#[from] shapefile::Error),
    #[error("Boundary file has unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to convert boundary geometry: {0}")]
    BadGeometry(String),
    #[error("Region '{region}' at admin level {admin_level} not found")]
    NotFound { region: String, admin_level: u8 },
}

/// Looks up polygon geometry for a region identifier at an administrative
/// level (0 = country, 1 = first subdivision, ...). Sources are GeoJSON
/// feature collections or Shapefiles, dispatched on extension.
pub fn load_boundary(config: &BoundaryConfig) -> Result<MultiPolygon<f64>, BoundaryError> {
    let extension = config
        .source
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    let polygons = match extension.as_str() {
        "json" | "geojson" => polygons_from_geojson(config)?,
        "shp" => polygons_from_shapefile(config)?,
        other => return Err(BoundaryError::UnsupportedFormat(other.to_string())),
    };

    if polygons.is_empty() {
        return Err(BoundaryError::NotFound {
            region: config.region.clone(),
            admin_level: config.admin_level,
        });
    }

    info!(
        region = %config.region,
        admin_level = config.admin_level,
        polygons = polygons.len(),
        "loaded boundary geometry"
    );
    Ok(MultiPolygon::new(polygons))
}

fn polygons_from_geojson(config: &BoundaryConfig) -> Result<Vec<Polygon<f64>>, BoundaryError> {
    let file = File::open(&config.source).map_err(|source| BoundaryError::Io {
        path: config.source.clone(),
        source,
    })?;
    let geojson = GeoJson::from_reader(BufReader::new(file)).map_err(geojson::Error::from)?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => {
            return Err(BoundaryError::BadGeometry(
                "boundary GeoJSON must be a FeatureCollection".to_string(),
            ))
        }
    };

    let mut polygons = Vec::new();
    for feature in collection.features {
        let properties = match &feature.properties {
            Some(props) => props,
            None => continue,
        };
        if !property_matches_region(properties.get(&config.region_property), &config.region) {
            continue;
        }
        if let Some(level_prop) = &config.level_property {
            if !property_matches_level(properties.get(level_prop), config.admin_level) {
                continue;
            }
        }
        let Some(geometry) = feature.geometry else {
            continue;
        };
        let converted: geo::Geometry<f64> = geometry
            .value
            .try_into()
            .map_err(|e| BoundaryError::BadGeometry(format!("{e:?}")))?;
        match converted {
            geo::Geometry::Polygon(p) => polygons.push(p),
            geo::Geometry::MultiPolygon(mp) => polygons.extend(mp),
            _ => continue, // points/lines are not boundaries
        }
    }
    Ok(polygons)
}

fn polygons_from_shapefile(config: &BoundaryConfig) -> Result<Vec<Polygon<f64>>, BoundaryError> {
    let mut reader = shapefile::Reader::from_path(&config.source)?;

    let mut polygons = Vec::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let region_value = match record.get(&config.region_property) {
            Some(shapefile::dbase::FieldValue::Character(Some(s))) => s.clone(),
            Some(shapefile::dbase::FieldValue::Numeric(Some(n))) => n.to_string(),
            _ => continue,
        };
        if region_value != config.region {
            continue;
        }
        if let Some(level_prop) = &config.level_property {
            let level = match record.get(level_prop) {
                Some(shapefile::dbase::FieldValue::Numeric(Some(n))) => *n,
                Some(shapefile::dbase::FieldValue::Character(Some(s))) => {
                    match s.trim().parse::<f64>() {
                        Ok(n) => n,
                        Err(_) => continue,
                    }
                }
                _ => continue,
            };
            if level as u8 != config.admin_level {
                continue;
            }
        }

        let multi: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(p) => p
                .try_into()
                .map_err(|e| BoundaryError::BadGeometry(format!("{e:?}")))?,
            shapefile::Shape::PolygonM(p) => p
                .try_into()
                .map_err(|e| BoundaryError::BadGeometry(format!("{e:?}")))?,
            shapefile::Shape::PolygonZ(p) => p
                .try_into()
                .map_err(|e| BoundaryError::BadGeometry(format!("{e:?}")))?,
            _ => continue,
        };
        polygons.extend(multi);
    }
    Ok(polygons)
}

fn property_matches_region(value: Option<&Value>, region: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == region,
        Some(Value::Number(n)) => n.to_string() == region,
        _ => false,
    }
}

fn property_matches_level(value: Option<&Value>, admin_level: u8) -> bool {
    match value {
        Some(Value::Number(n)) => n.as_f64() == Some(admin_level as f64),
        Some(Value::String(s)) => s.trim().parse::<u8>() == Ok(admin_level),
        _ => false,
    }
}
