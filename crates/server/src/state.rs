use std::path::PathBuf;

use crate::auth::Authenticator;

#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub base_url: String,
    pub auth: Authenticator,
}

impl AppState {
    pub fn new(db_path: PathBuf, base_url: String, auth: Authenticator) -> Self {
        Self {
            db_path,
            base_url,
            auth,
        }
    }
}
