//! Application state shared by the HTTP handlers

use crate::history::ChatHistoryStore;
use crate::lifecycle::ConnectionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: ConnectionManager,
    pub history: ChatHistoryStore,
}
