use crate::boundary::{self, BoundaryError};
use crate::compose::{
    CompositionError, CompositionWarning, MapBuilder, PopupTemplate, DEFAULT_MIN_DENSITY_POINTS,
};
use crate::config::{AppConfig, LayerKind};
use crate::data::{self, LoadError};
use crate::filter;
use crate::geocode::{Geocoder, ResolutionWarning, Resolver};
use crate::types::{BasemapSpec, LatLon, MapSpec, RecordSet};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Load stage failed")]
    Load(#[from] LoadError),
    #[error("Boundary stage failed")]
    Boundary(#[from] BoundaryError),
    #[error("Composition stage failed")]
    Composition(#[from] CompositionError),
}

/// Everything non-fatal that happened during a run. Handed back with the
/// spec so the caller decides whether warnings are acceptable.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub resolution: Vec<ResolutionWarning>,
    pub composition: Vec<CompositionWarning>,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.resolution.is_empty() && self.composition.is_empty()
    }
}

/// Load + resolve, shared by map generation and the query server.
pub async fn resolve_records(
    config: &AppConfig,
    geocoder: &dyn Geocoder,
) -> Result<(RecordSet, Vec<ResolutionWarning>), PipelineError> {
    let records = data::load_records(&config.input)?;
    let mut resolver = Resolver::new(geocoder);
    let (resolved, warnings) = resolver.resolve(&records, &config.input).await;
    Ok((resolved, warnings))
}

/// Runs the full pipeline: load, resolve, filter each configured layer,
/// compose. Returns the finished `MapSpec` with the accumulated warnings.
pub async fn build_map(
    config: &AppConfig,
    geocoder: &dyn Geocoder,
) -> Result<(MapSpec, PipelineReport), PipelineError> {
    let (resolved, resolution) = resolve_records(config, geocoder).await?;

    let basemap = BasemapSpec {
        provider: config.basemap.provider.clone(),
        center: LatLon {
            lat: config.basemap.center.lat,
            lon: config.basemap.center.lon,
        },
        zoom: config.basemap.zoom,
    };
    let mut builder = MapBuilder::new(basemap);

    if config.layers.is_empty() {
        // No layers configured: plot every record as one point layer.
        builder = builder.points("records", &resolved, Default::default(), None, None);
    }

    for layer in &config.layers {
        match layer.kind {
            LayerKind::Points => {
                let subset = subset_for(layer.filter.as_ref(), &resolved);
                let popup = layer.popup.as_deref().map(PopupTemplate::new);
                builder = builder.points(
                    &layer.name,
                    &subset,
                    layer.style.clone(),
                    layer.group.clone(),
                    popup.as_ref(),
                );
            }
            LayerKind::Density => {
                let subset = subset_for(layer.filter.as_ref(), &resolved);
                builder = builder.density(
                    &layer.name,
                    &subset,
                    layer.style.clone(),
                    layer.group.clone(),
                    layer.min_points.unwrap_or(DEFAULT_MIN_DENSITY_POINTS),
                );
            }
            LayerKind::Polygon => {
                // Guaranteed by config validation.
                let Some(boundary_config) = &layer.boundary else {
                    continue;
                };
                let geometry = boundary::load_boundary(boundary_config)?;
                builder = builder.polygon(
                    &layer.name,
                    &geometry,
                    layer.style.clone(),
                    layer.group.clone(),
                );
            }
        }
    }

    let (spec, composition) = builder.build()?;
    for layer in &spec.layers {
        if layer.is_empty() {
            debug!(layer = layer.name(), "layer composed empty");
        }
    }
    info!(
        layers = spec.layers.len(),
        resolution_warnings = resolution.len(),
        composition_warnings = composition.len(),
        "pipeline complete"
    );
    Ok((
        spec,
        PipelineReport {
            resolution,
            composition,
        },
    ))
}

fn subset_for(pred: Option<&filter::Predicate>, resolved: &RecordSet) -> RecordSet {
    match pred {
        Some(pred) => filter::apply(pred, resolved),
        None => resolved.clone(),
    }
}
