use std::sync::Arc;

use crate::backend::UserService;

// shared state handed to every handler
pub struct AppState {
    pub users: Arc<dyn UserService>,
}

impl AppState {
    pub fn new(users: Arc<dyn UserService>) -> Self {
        Self { users }
    }
}
