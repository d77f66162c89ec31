use crate::db_types::OwnerId;
use crate::engine::CallEngine;

use serde::Deserialize;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<CallEngine>,
}

/// Body of `POST /calls`.
#[derive(Debug, Deserialize)]
pub struct PlaceCallBody {
    pub owner: OwnerId,
    pub assistant_id: String,
    pub phone_number_id: String,
    pub customer_number: String,
}

/// Query of `POST /scheduled-calls/execute`.
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteParams {
    pub owner: Option<OwnerId>,
}
