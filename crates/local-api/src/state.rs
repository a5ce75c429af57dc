use std::path::PathBuf;

#[derive(Clone)]
pub struct AppState {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub ui_port: u16,
}

impl AppState {
    pub fn new(base_dir: PathBuf, config_path: PathBuf, ui_port: u16) -> Self {
        Self {
            base_dir,
            config_path,
            ui_port,
        }
    }
}
