pub mod api;
pub mod config;
pub mod courier;
pub mod engine;

pub use config::Config;

use std::sync::Arc;

use crate::engine::{Deployer, Fetcher};

pub struct AppState {
    pub deployer: Arc<Deployer>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl AppState {
    pub fn new(deployer: Arc<Deployer>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { deployer, fetcher }
    }
}
