use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_generator_url")]
    pub generator_url: String,
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_generation_queue_capacity")]
    pub generation_queue_capacity: usize,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,
    #[serde(default = "default_max_inference_steps")]
    pub max_inference_steps: u32,
}

fn default_data_dir() -> String {
    "./outputs".to_string()
}

fn default_generator_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

/// One worker per shared compute resource; the generator is not assumed reentrant.
fn default_generation_concurrency() -> usize {
    1
}

fn default_generation_queue_capacity() -> usize {
    64
}

fn default_generation_timeout_secs() -> u64 {
    600
}

fn default_max_image_dimension() -> u32 {
    2048
}

fn default_max_inference_steps() -> u32 {
    100
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "imagegen".to_string(),
            surrealdb_database: "jobs".to_string(),
            data_dir: default_data_dir(),
            http_port: 8000,
            storage: default_storage_kind(),
            generator_url: default_generator_url(),
            generation_concurrency: default_generation_concurrency(),
            generation_queue_capacity: default_generation_queue_capacity(),
            generation_timeout_secs: default_generation_timeout_secs(),
            max_image_dimension: default_max_image_dimension(),
            max_inference_steps: default_max_inference_steps(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
