use crate::types::{
    BasemapSpec, DensityLayer, LatLon, Layer, MapPoint, MapSpec, PointLayer, PolygonLayer,
    Record, RecordSet, Style,
};
use geo::{LineString, MultiPolygon};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// A density estimate over fewer points than this is undefined; layers below
/// the threshold degrade to empty instead of failing.
pub const DEFAULT_MIN_DENSITY_POINTS: usize = 2;

/// Per-layer composition report: how many records were excluded for null
/// coordinates, and whether a density layer degraded to empty.
#[derive(Debug, Clone)]
pub struct CompositionWarning {
    pub layer: String,
    pub excluded: usize,
    pub degraded: bool,
}

impl fmt::Display for CompositionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.degraded {
            write!(
                f,
                "layer '{}': degraded to empty ({} record(s) excluded)",
                self.layer, self.excluded
            )
        } else {
            write!(
                f,
                "layer '{}': {} record(s) excluded for null coordinates",
                self.layer, self.excluded
            )
        }
    }
}

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("No usable records remain in any record-backed layer")]
    NoUsableRecords,
}

/// Pure formatting template for popup text: `{field}` expands to the
/// record's value, unknown fields expand empty. No side effects.
#[derive(Debug, Clone)]
pub struct PopupTemplate(String);

impl PopupTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        PopupTemplate(template.into())
    }

    pub fn render(&self, set: &RecordSet, record: &Record) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    out.push_str(&display_value(set.get(record, &after[..end])));
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated brace: keep the literal text.
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Builds a `MapSpec` as an explicit ordered list of layers. Layers draw in
/// the order they are added; records without resolved coordinates are
/// excluded from point and density layers and counted per layer.
pub struct MapBuilder {
    basemap: BasemapSpec,
    layers: Vec<Layer>,
    warnings: Vec<CompositionWarning>,
    record_layers: usize,
    usable_records: usize,
}

impl MapBuilder {
    pub fn new(basemap: BasemapSpec) -> Self {
        MapBuilder {
            basemap,
            layers: Vec::new(),
            warnings: Vec::new(),
            record_layers: 0,
            usable_records: 0,
        }
    }

    pub fn points(
        mut self,
        name: &str,
        set: &RecordSet,
        style: Style,
        group: Option<String>,
        popup: Option<&PopupTemplate>,
    ) -> Self {
        let mut points = Vec::with_capacity(set.len());
        let mut excluded = 0;
        for record in &set.records {
            match set.coords(record) {
                Some((lat, lon)) => points.push(MapPoint {
                    lat,
                    lon,
                    popup: popup.map(|t| t.render(set, record)),
                }),
                None => excluded += 1,
            }
        }
        self.note_layer(name, points.len(), excluded, false);
        self.layers.push(Layer::Points(PointLayer {
            name: name.to_string(),
            style,
            group,
            points,
        }));
        self
    }

    pub fn density(
        mut self,
        name: &str,
        set: &RecordSet,
        style: Style,
        group: Option<String>,
        min_points: usize,
    ) -> Self {
        let mut points = Vec::with_capacity(set.len());
        let mut excluded = 0;
        for record in &set.records {
            match set.coords(record) {
                Some((lat, lon)) => points.push(LatLon { lat, lon }),
                None => excluded += 1,
            }
        }
        let degraded = points.len() < min_points;
        self.note_layer(name, points.len(), excluded, degraded);
        if degraded {
            points.clear();
        }
        self.layers.push(Layer::Density(DensityLayer {
            name: name.to_string(),
            style,
            group,
            points,
        }));
        self
    }

    pub fn polygon(
        mut self,
        name: &str,
        boundary: &MultiPolygon<f64>,
        style: Style,
        group: Option<String>,
    ) -> Self {
        self.layers.push(Layer::Polygon(PolygonLayer {
            name: name.to_string(),
            style,
            group,
            polygons: polygon_rings(boundary),
        }));
        self
    }

    fn note_layer(&mut self, name: &str, usable: usize, excluded: usize, degraded: bool) {
        self.record_layers += 1;
        self.usable_records += usable;
        debug!(layer = name, usable, excluded, degraded, "composed layer");
        if excluded > 0 || degraded {
            self.warnings.push(CompositionWarning {
                layer: name.to_string(),
                excluded,
                degraded,
            });
        }
    }

    /// Finishes the `MapSpec`. Fatal only when record-backed layers were
    /// requested and none of them kept a single usable record.
    pub fn build(self) -> Result<(MapSpec, Vec<CompositionWarning>), CompositionError> {
        if self.record_layers > 0 && self.usable_records == 0 {
            return Err(CompositionError::NoUsableRecords);
        }
        Ok((
            MapSpec {
                basemap: self.basemap,
                layers: self.layers,
            },
            self.warnings,
        ))
    }
}

/// Flattens geometry for the renderer: polygons, rings, `[lat, lon]`
/// vertices. Exterior ring first, matching `PolygonLayer`'s contract.
fn polygon_rings(boundary: &MultiPolygon<f64>) -> Vec<Vec<Vec<[f64; 2]>>> {
    boundary
        .0
        .iter()
        .map(|polygon| {
            let mut rings = Vec::with_capacity(1 + polygon.interiors().len());
            rings.push(ring_vertices(polygon.exterior()));
            for interior in polygon.interiors() {
                rings.push(ring_vertices(interior));
            }
            rings
        })
        .collect()
}

fn ring_vertices(ring: &LineString<f64>) -> Vec<[f64; 2]> {
    ring.coords().map(|c| [c.y, c.x]).collect()
}
