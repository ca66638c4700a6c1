use crate::{config::Config, websocket::manager::ConnectionManager};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub config: Arc<Config>,
}
