use crate::types::{DensityLayer, Layer, MapSpec, PointLayer, PolygonLayer};
use geo::algorithm::contains::Contains;
use geo::{Coord, LineString, Polygon};
use image::{ImageBuffer, Rgba, RgbaImage};
use rayon::prelude::*;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

// Constants for Web Mercator
const TILE_SIZE: u32 = 256;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Unknown basemap provider '{0}'")]
    UnknownProvider(String),
    #[error("Failed to write rendered output")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode image")]
    Image(#[from] image::ImageError),
    #[error("Failed to serialize map spec")]
    Json(#[from] serde_json::Error),
}

/// A tile provider the interactive page can pull a basemap from.
pub struct TileProvider {
    pub url_template: &'static str,
    pub attribution: &'static str,
}

pub fn provider(id: &str) -> Option<TileProvider> {
    match id {
        "openstreetmap" => Some(TileProvider {
            url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
            attribution: "&copy; OpenStreetMap contributors",
        }),
        "carto-positron" => Some(TileProvider {
            url_template: "https://basemaps.cartocdn.com/light_all/{z}/{x}/{y}.png",
            attribution: "&copy; OpenStreetMap contributors &copy; CARTO",
        }),
        "carto-dark" => Some(TileProvider {
            url_template: "https://basemaps.cartocdn.com/dark_all/{z}/{x}/{y}.png",
            attribution: "&copy; OpenStreetMap contributors &copy; CARTO",
        }),
        "opentopomap" => Some(TileProvider {
            url_template: "https://tile.opentopomap.org/{z}/{x}/{y}.png",
            attribution: "&copy; OpenStreetMap contributors, SRTM | &copy; OpenTopoMap",
        }),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct PngOptions {
    pub width: u32,
    pub height: u32,
    pub background: String,
}

/// Draws a `MapSpec` onto a flat canvas and writes a PNG. Layers draw in
/// list order, so later layers end up on top. Tiles are not fetched here;
/// the canvas background stands in for the basemap.
pub fn render_png(spec: &MapSpec, options: &PngOptions, path: &Path) -> Result<(), RenderError> {
    let background = hex_to_rgba(&options.background);
    let mut canvas: RgbaImage =
        ImageBuffer::from_pixel(options.width, options.height, background);

    let viewport = Viewport::new(spec, options.width, options.height);

    for layer in &spec.layers {
        match layer {
            Layer::Points(points) => draw_points(&mut canvas, &viewport, points),
            Layer::Density(density) => draw_density(&mut canvas, &viewport, density),
            Layer::Polygon(polygons) => draw_polygons(&mut canvas, &viewport, polygons),
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    canvas.save(path)?;
    info!(path = ?path, width = options.width, height = options.height, "wrote static map");
    Ok(())
}

/// Pixel frame for one render: world Web Mercator pixels at the basemap
/// zoom, offset so the basemap center lands mid-canvas.
struct Viewport {
    origin_x: f64,
    origin_y: f64,
    zoom: u8,
}

impl Viewport {
    fn new(spec: &MapSpec, width: u32, height: u32) -> Self {
        let (cx, cy) = project(spec.basemap.center.lat, spec.basemap.center.lon, spec.basemap.zoom);
        Viewport {
            origin_x: cx - width as f64 / 2.0,
            origin_y: cy - height as f64 / 2.0,
            zoom: spec.basemap.zoom,
        }
    }

    fn to_canvas(&self, lat: f64, lon: f64) -> (f64, f64) {
        let (x, y) = project(lat, lon, self.zoom);
        (x - self.origin_x, y - self.origin_y)
    }
}

// Coordinate conversion: world pixel position in the global mercator plane
// at the given zoom.
fn project(lat: f64, lon: f64, zoom: u8) -> (f64, f64) {
    let n = 2.0_f64.powi(zoom as i32) * TILE_SIZE as f64;
    let x = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0 * n;
    (x, y)
}

fn draw_points(canvas: &mut RgbaImage, viewport: &Viewport, layer: &PointLayer) {
    let fill = hex_to_rgba(layer.style.fill_color.as_deref().unwrap_or(&layer.style.color));
    let radius = layer.style.radius.max(1.0);
    for point in &layer.points {
        let (x, y) = viewport.to_canvas(point.lat, point.lon);
        draw_disk(canvas, x, y, radius, fill, layer.style.opacity);
    }
}

fn draw_density(canvas: &mut RgbaImage, viewport: &Viewport, layer: &DensityLayer) {
    if layer.points.is_empty() {
        return;
    }
    let width = canvas.width() as usize;
    let height = canvas.height() as usize;
    // Kernel radius scales off the style radius so config tunes both
    // renderers the same way.
    let kernel = (layer.style.radius * 6.0).max(8.0);
    let sigma = kernel / 3.0;

    let mut grid = vec![0.0f32; width * height];
    for point in &layer.points {
        let (px, py) = viewport.to_canvas(point.lat, point.lon);
        splat(&mut grid, width, height, px, py, kernel, sigma);
    }

    let peak = grid.par_iter().cloned().reduce(|| 0.0, f32::max);
    if peak <= 0.0 {
        return;
    }

    for row in 0..height {
        for col in 0..width {
            let intensity = grid[row * width + col] / peak;
            if intensity < 0.02 {
                continue;
            }
            let color = heat_color(intensity);
            blend(
                canvas,
                col as i64,
                row as i64,
                color,
                intensity as f64 * layer.style.opacity,
            );
        }
    }
}

fn splat(grid: &mut [f32], width: usize, height: usize, px: f64, py: f64, kernel: f64, sigma: f64) {
    let min_x = ((px - kernel).floor().max(0.0)) as usize;
    let max_x = ((px + kernel).ceil().min(width as f64 - 1.0)) as usize;
    let min_y = ((py - kernel).floor().max(0.0)) as usize;
    let max_y = ((py + kernel).ceil().min(height as f64 - 1.0)) as usize;
    if px + kernel < 0.0 || py + kernel < 0.0 || min_x > max_x || min_y > max_y {
        return;
    }
    let two_sigma_sq = 2.0 * sigma * sigma;
    for row in min_y..=max_y {
        for col in min_x..=max_x {
            let dx = col as f64 - px;
            let dy = row as f64 - py;
            let dist_sq = dx * dx + dy * dy;
            if dist_sq <= kernel * kernel {
                grid[row * width + col] += (-dist_sq / two_sigma_sq).exp() as f32;
            }
        }
    }
}

/// Blue through yellow to red, low to high.
fn heat_color(intensity: f32) -> Rgba<u8> {
    let t = intensity.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        let k = t * 2.0;
        (k * 255.0, k * 200.0, (1.0 - k) * 255.0)
    } else {
        let k = (t - 0.5) * 2.0;
        (255.0, (1.0 - k) * 200.0, 0.0)
    };
    Rgba([r as u8, g as u8, b as u8, 255])
}

fn draw_polygons(canvas: &mut RgbaImage, viewport: &Viewport, layer: &PolygonLayer) {
    let stroke = hex_to_rgba(&layer.style.color);
    let fill = hex_to_rgba(layer.style.fill_color.as_deref().unwrap_or(&layer.style.color));
    let width = canvas.width();
    let height = canvas.height();

    for rings in &layer.polygons {
        let projected: Vec<Vec<Coord<f64>>> = rings
            .iter()
            .map(|ring| {
                ring.iter()
                    .map(|vertex| {
                        let (x, y) = viewport.to_canvas(vertex[0], vertex[1]);
                        Coord { x, y }
                    })
                    .collect()
            })
            .collect();
        let Some((exterior, interiors)) = projected.split_first() else {
            continue;
        };
        let polygon = Polygon::new(
            LineString::from(exterior.clone()),
            interiors.iter().map(|r| LineString::from(r.clone())).collect(),
        );

        if layer.style.fill {
            // Scanline containment test, row-parallel.
            let fill_opacity = layer.style.opacity * 0.5;
            let rows: Vec<Vec<u32>> = (0..height)
                .into_par_iter()
                .map(|row| {
                    (0..width)
                        .filter(|&col| {
                            polygon.contains(&geo::Point::new(col as f64 + 0.5, row as f64 + 0.5))
                        })
                        .collect()
                })
                .collect();
            for (row, cols) in rows.iter().enumerate() {
                for &col in cols {
                    blend(canvas, col as i64, row as i64, fill, fill_opacity);
                }
            }
        }

        for ring in &projected {
            for pair in ring.windows(2) {
                draw_line(
                    canvas,
                    pair[0],
                    pair[1],
                    stroke,
                    layer.style.opacity,
                    layer.style.weight.max(1.0),
                );
            }
        }
    }
}

fn draw_disk(canvas: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgba<u8>, opacity: f64) {
    let r = radius.ceil() as i64;
    let x0 = cx.round() as i64;
    let y0 = cy.round() as i64;
    for dy in -r..=r {
        for dx in -r..=r {
            if (dx * dx + dy * dy) as f64 <= radius * radius {
                blend(canvas, x0 + dx, y0 + dy, color, opacity);
            }
        }
    }
}

fn draw_line(
    canvas: &mut RgbaImage,
    from: Coord<f64>,
    to: Coord<f64>,
    color: Rgba<u8>,
    opacity: f64,
    width: f64,
) {
    let length = ((to.x - from.x).powi(2) + (to.y - from.y).powi(2)).sqrt();
    let steps = length.ceil().max(1.0) as usize;
    let radius = width / 2.0;
    for step in 0..=steps {
        let t = step as f64 / steps as f64;
        let x = from.x + (to.x - from.x) * t;
        let y = from.y + (to.y - from.y) * t;
        draw_disk(canvas, x, y, radius, color, opacity);
    }
}

fn blend(canvas: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>, opacity: f64) {
    if x < 0 || y < 0 || x >= canvas.width() as i64 || y >= canvas.height() as i64 {
        return;
    }
    let alpha = opacity.clamp(0.0, 1.0);
    let pixel = canvas.get_pixel_mut(x as u32, y as u32);
    for channel in 0..3 {
        pixel[channel] =
            (color[channel] as f64 * alpha + pixel[channel] as f64 * (1.0 - alpha)).round() as u8;
    }
    pixel[3] = 255;
}

fn hex_to_rgba(hex: &str) -> Rgba<u8> {
    let hex = hex.trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range)
            .and_then(|part| u8::from_str_radix(part, 16).ok())
            .unwrap_or(0)
    };
    Rgba([channel(0..2), channel(2..4), channel(4..6), 255])
}

/// Writes a standalone interactive page: Leaflet plus the `MapSpec`
/// embedded as JSON. Grouped layers become toggleable overlays.
pub fn render_html(spec: &MapSpec, path: &Path) -> Result<(), RenderError> {
    let tiles = provider(&spec.basemap.provider)
        .ok_or_else(|| RenderError::UnknownProvider(spec.basemap.provider.clone()))?;
    let json = serde_json::to_string(spec)?;

    let page = HTML_TEMPLATE
        .replace("__TILE_URL__", tiles.url_template)
        .replace("__ATTRIBUTION__", tiles.attribution)
        .replace("__MAPSPEC__", &json);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, page)?;
    info!(path = ?path, layers = spec.layers.len(), "wrote interactive map");
    Ok(())
}

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>placemap</title>
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<script src="https://unpkg.com/leaflet.heat@0.2.0/dist/leaflet-heat.js"></script>
<style>html, body, #map { height: 100%; margin: 0; }</style>
</head>
<body>
<div id="map"></div>
<script>
const spec = __MAPSPEC__;

const map = L.map('map').setView(
    [spec.basemap.center.lat, spec.basemap.center.lon],
    spec.basemap.zoom
);
L.tileLayer('__TILE_URL__', {
    attribution: '__ATTRIBUTION__'
}).addTo(map);

function markerStyle(style) {
    return {
        color: style.color,
        radius: style.radius,
        opacity: style.opacity,
        fillOpacity: style.opacity,
        fill: style.fill,
        fillColor: style.fill_color || style.color,
        weight: 1
    };
}

function polygonStyle(style) {
    return {
        color: style.color,
        weight: style.weight,
        opacity: style.opacity,
        fill: style.fill,
        fillColor: style.fill_color || style.color,
        fillOpacity: style.opacity * 0.5
    };
}

function buildLayer(layer) {
    if (layer.type === 'points') {
        return L.layerGroup(layer.points.map(function (p) {
            const marker = L.circleMarker([p.lat, p.lon], markerStyle(layer.style));
            if (p.popup) marker.bindPopup(p.popup);
            return marker;
        }));
    }
    if (layer.type === 'density') {
        return L.heatLayer(
            layer.points.map(function (p) { return [p.lat, p.lon]; }),
            { radius: layer.style.radius * 5, minOpacity: 0.2 }
        );
    }
    return L.layerGroup(layer.polygons.map(function (rings) {
        return L.polygon(rings, polygonStyle(layer.style));
    }));
}

const groups = {};
spec.layers.forEach(function (layer) {
    const built = buildLayer(layer);
    if (layer.group) {
        if (!groups[layer.group]) groups[layer.group] = L.layerGroup();
        built.addTo(groups[layer.group]);
    } else {
        built.addTo(map);
    }
});
Object.values(groups).forEach(function (group) { group.addTo(map); });
if (Object.keys(groups).length > 0) {
    L.control.layers(null, groups).addTo(map);
}
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BasemapSpec, LatLon, MapPoint, Style};
    use tempfile::tempdir;

    fn spec_with(layers: Vec<Layer>) -> MapSpec {
        MapSpec {
            basemap: BasemapSpec {
                provider: "openstreetmap".to_string(),
                center: LatLon {
                    lat: 53.35,
                    lon: -6.26,
                },
                zoom: 10,
            },
            layers,
        }
    }

    fn point_layer(name: &str, points: Vec<MapPoint>) -> Layer {
        Layer::Points(PointLayer {
            name: name.to_string(),
            style: Style::default(),
            group: None,
            points,
        })
    }

    #[test]
    fn projection_centers_the_null_island() {
        let n = 2.0_f64.powi(4) * TILE_SIZE as f64;
        let (x, y) = project(0.0, 0.0, 4);
        assert!((x - n / 2.0).abs() < 1e-6);
        assert!((y - n / 2.0).abs() < 1e-6);
        // Positive longitude goes east, positive latitude goes up (smaller y).
        let (east, _) = project(0.0, 90.0, 4);
        assert!(east > x);
        let (_, north) = project(45.0, 0.0, 4);
        assert!(north < y);
    }

    #[test]
    fn hex_parsing_is_lenient() {
        assert_eq!(hex_to_rgba("#ff0080"), Rgba([255, 0, 128, 255]));
        assert_eq!(hex_to_rgba("ff0080"), Rgba([255, 0, 128, 255]));
        assert_eq!(hex_to_rgba("#xyz"), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn png_render_writes_requested_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.png");
        let spec = spec_with(vec![point_layer(
            "sites",
            vec![MapPoint {
                lat: 53.35,
                lon: -6.26,
                popup: None,
            }],
        )]);
        let options = PngOptions {
            width: 64,
            height: 48,
            background: "#ffffff".to_string(),
        };
        render_png(&spec, &options, &path).unwrap();

        let written = image::open(&path).unwrap();
        assert_eq!(written.width(), 64);
        assert_eq!(written.height(), 48);
    }

    #[test]
    fn empty_density_layer_renders_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.png");
        let spec = spec_with(vec![Layer::Density(DensityLayer {
            name: "heat".to_string(),
            style: Style::default(),
            group: None,
            points: Vec::new(),
        })]);
        let options = PngOptions {
            width: 32,
            height: 32,
            background: "#ffffff".to_string(),
        };
        render_png(&spec, &options, &path).unwrap();
        let written = image::open(&path).unwrap().to_rgba8();
        assert!(written.pixels().all(|p| p[0] == 255 && p[1] == 255 && p[2] == 255));
    }

    #[test]
    fn html_embeds_layers_and_tiles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.html");
        let spec = spec_with(vec![point_layer(
            "sites",
            vec![MapPoint {
                lat: 53.35,
                lon: -6.26,
                popup: Some("Liberty Hall".to_string()),
            }],
        )]);
        render_html(&spec, &path).unwrap();

        let page = fs::read_to_string(&path).unwrap();
        assert!(page.contains("tile.openstreetmap.org"));
        assert!(page.contains("\"sites\""));
        assert!(page.contains("Liberty Hall"));
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.html");
        let mut spec = spec_with(Vec::new());
        spec.basemap.provider = "no-such-tiles".to_string();
        assert!(matches!(
            render_html(&spec, &path),
            Err(RenderError::UnknownProvider(_))
        ));
    }
}
