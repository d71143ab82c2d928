use crate::config::AppConfig;
use crate::types::RecordSet;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

// Wrapper for RTree indexing; position is (lon, lat) to keep x east.
pub struct RecordPoint {
    index: usize,
    position: [f64; 2],
}

impl RTreeObject for RecordPoint {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for RecordPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        dx * dx + dy * dy
    }
}

pub struct AppState {
    pub records: RecordSet,
    pub tree: RTree<RecordPoint>,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
pub struct QueryResponse {
    index: usize,
    fields: serde_json::Map<String, serde_json::Value>,
}

/// Serves the rendered output directory plus a nearest-record lookup over
/// the resolved set.
pub async fn start_server(config: AppConfig, records: RecordSet) -> Result<()> {
    info!(rows = records.len(), "building spatial index");
    let items: Vec<RecordPoint> = records
        .records
        .iter()
        .filter_map(|record| {
            records.coords(record).map(|(lat, lon)| RecordPoint {
                index: record.index,
                position: [lon, lat],
            })
        })
        .collect();
    let tree = RTree::bulk_load(items);

    let state = Arc::new(AppState { records, tree });

    let port = config.server.port;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!(%addr, dir = ?config.output.dir, "starting server");

    let app = Router::new()
        .route("/api/query", get(query_handler))
        .fallback_service(ServeDir::new(&config.output.dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<QueryResponse>> {
    let nearest = state.tree.nearest_neighbor(&[params.lon, params.lat]);

    let response = nearest.and_then(|point| {
        let record = state
            .records
            .records
            .iter()
            .find(|r| r.index == point.index)?;
        let fields = state
            .records
            .schema()
            .iter()
            .cloned()
            .zip(record.values.iter().cloned())
            .collect();
        Some(QueryResponse {
            index: point.index,
            fields,
        })
    });

    Json(response)
}
