use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical coordinate column names written by the resolver.
pub const LATITUDE: &str = "latitude";
pub const LONGITUDE: &str = "longitude";

pub fn latitude_in_range(lat: f64) -> bool {
    (-90.0..=90.0).contains(&lat)
}

pub fn longitude_in_range(lon: f64) -> bool {
    (-180.0..=180.0).contains(&lon)
}

/// One source row. `index` is the zero-based position in the input file and
/// stays stable through resolution and filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub index: usize,
    pub values: Vec<Value>,
}

/// An ordered set of records sharing one schema. Loaders and the resolver
/// produce new sets; nothing mutates a set in place after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    schema: Vec<String>,
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn new(schema: Vec<String>) -> Self {
        RecordSet {
            schema,
            records: Vec::new(),
        }
    }

    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.schema.iter().position(|name| name == field)
    }

    pub fn push(&mut self, mut record: Record) {
        record.values.resize(self.schema.len(), Value::Null);
        self.records.push(record);
    }

    /// New empty set with the same schema, for filtered subsets.
    pub fn like(&self) -> Self {
        RecordSet::new(self.schema.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Field value of `record` under this set's schema. Missing columns read
    /// as no value; callers treat that the same as an explicit null.
    pub fn get<'a>(&self, record: &'a Record, field: &str) -> Option<&'a Value> {
        let idx = self.field_index(field)?;
        record.values.get(idx)
    }

    pub fn get_f64(&self, record: &Record, field: &str) -> Option<f64> {
        value_as_f64(self.get(record, field)?)
    }

    pub fn get_str<'a>(&self, record: &'a Record, field: &str) -> Option<&'a str> {
        match self.get(record, field)? {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Resolved coordinates of a record, when both canonical columns hold
    /// numbers.
    pub fn coords(&self, record: &Record) -> Option<(f64, f64)> {
        let lat = self.get_f64(record, LATITUDE)?;
        let lon = self.get_f64(record, LONGITUDE)?;
        Some((lat, lon))
    }
}

/// Numeric view of a field value. Numeric strings count: delimited text
/// sources do not always quote consistently.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Style descriptor shared by all layer kinds. Colors are `#rrggbb` hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Style {
    pub color: String,
    pub radius: f64,
    pub opacity: f64,
    pub fill: bool,
    pub fill_color: Option<String>,
    pub weight: f64,
}

impl Default for Style {
    fn default() -> Self {
        Style {
            color: "#3388ff".to_string(),
            radius: 5.0,
            opacity: 0.8,
            fill: true,
            fill_color: None,
            weight: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

/// Base-map descriptor: which tile provider to draw under the data layers,
/// and where the viewport starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasemapSpec {
    pub provider: String,
    pub center: LatLon,
    pub zoom: u8,
}

/// A plotted point with its pre-rendered popup text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointLayer {
    pub name: String,
    pub style: Style,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub points: Vec<MapPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityLayer {
    pub name: String,
    pub style: Style,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub points: Vec<LatLon>,
}

/// Polygon geometry flattened for rendering: polygons, then rings, then
/// `[lat, lon]` vertices. The first ring of each polygon is the exterior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonLayer {
    pub name: String,
    pub style: Style,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub polygons: Vec<Vec<Vec<[f64; 2]>>>,
}

/// One renderable layer. Order in `MapSpec::layers` is draw order: later
/// layers draw on top of earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Layer {
    Points(PointLayer),
    Density(DensityLayer),
    Polygon(PolygonLayer),
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::Points(l) => &l.name,
            Layer::Density(l) => &l.name,
            Layer::Polygon(l) => &l.name,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Layer::Points(l) => l.points.is_empty(),
            Layer::Density(l) => l.points.is_empty(),
            Layer::Polygon(l) => l.polygons.is_empty(),
        }
    }
}

/// The finished description of a map: base map plus ordered layers. This is
/// the whole hand-off to a renderer; nothing else crosses that boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSpec {
    pub basemap: BasemapSpec,
    pub layers: Vec<Layer>,
}
