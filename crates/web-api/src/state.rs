use std::sync::Arc;

use application::RelayService;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(relay: Arc<RelayService>, jwt_service: Arc<JwtService>) -> Self {
        Self { relay, jwt_service }
    }
}
