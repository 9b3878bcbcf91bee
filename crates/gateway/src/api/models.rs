//! `GET /api/models/marketplace` (§6): the canonical model list, each
//! annotated with whether the provider that serves it currently has
//! usable credentials.

use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MarketplaceQuery {
    /// Optional provider-name filter, e.g. `?provider=anthropic`.
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
    pub is_available: bool,
}

#[derive(Debug, Serialize)]
pub struct MarketplaceResponse {
    pub models: Vec<ModelEntry>,
    pub total: usize,
    pub filters: HashMap<String, String>,
}

pub async fn marketplace(
    State(state): State<AppState>,
    Query(query): Query<MarketplaceQuery>,
) -> Json<MarketplaceResponse> {
    let mut models: Vec<ModelEntry> = sa_providers::router::known_models()
        .into_iter()
        .filter_map(|model| {
            let provider_name = sa_providers::router::route_provider(model).ok()?;
            if let Some(filter) = &query.provider {
                if filter != provider_name {
                    return None;
                }
            }
            let is_available = state
                .providers
                .get(provider_name)
                .map(|p| p.is_available())
                .unwrap_or(false);
            Some(ModelEntry {
                id: model.to_string(),
                provider: provider_name.to_string(),
                is_available,
            })
        })
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));

    let mut filters = HashMap::new();
    if let Some(provider) = &query.provider {
        filters.insert("provider".to_string(), provider.clone());
    }

    Json(MarketplaceResponse {
        total: models.len(),
        models,
        filters,
    })
}
