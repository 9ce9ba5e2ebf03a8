#![crate_type = "rlib"]

#[macro_use]
extern crate log;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate diesel_derive_enum;
#[macro_use]
extern crate diesel_migrations;
#[macro_use]
extern crate lopdf;
#[macro_use]
extern crate lazy_static;

mod error;
pub mod schema;
pub mod models;
pub mod crypto;
pub mod files;
pub mod pdf;
pub mod auth;
pub mod store;
pub mod audit;
pub mod notify;
pub mod catalog;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};

/// Where a recipient's request came from, recorded on submissions,
/// signatures and audit rows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientMeta {
    pub ip: std::net::IpAddr,
    pub user_agent: String,
}

#[derive(Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    pub files: FilesConfig,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Deserialize)]
pub struct FilesConfig {
    pub root: std::path::PathBuf,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(deserialize_with = "from_base64")]
    pub key: Vec<u8>,
    #[serde(deserialize_with = "from_base64")]
    pub link_key: Vec<u8>,
}

fn default_pool_size() -> u32 {
    10
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_bucket() -> String {
    "esign".to_string()
}

fn from_base64<'a, D: serde::Deserializer<'a>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    use serde::de::Error;
    use serde::Deserialize;
    String::deserialize(deserializer)
        .and_then(|string| base64::decode(&string).map_err(|err| Error::custom(err.to_string())))
}

impl Config {
    /// `esign.toml` in the working directory, overridden by `ESIGN_*`
    /// environment variables (`ESIGN_FILES__ROOT` sets `files.root`).
    pub fn figment() -> figment::Figment {
        use figment::providers::Format;

        figment::Figment::new()
            .merge(figment::providers::Toml::file("esign.toml"))
            .merge(figment::providers::Env::prefixed("ESIGN_").split("__"))
    }

    pub fn load() -> Result<Self> {
        Self::figment().extract()
            .map_err(|err| Error::validation("config", err.to_string()))
    }
}

/// Owns every long-lived handle of the process and hands them to the
/// catalog and workflow operations.
pub struct Engine<S: store::Store> {
    store: S,
    files: std::sync::Arc<files::ContentStore>,
    sealer: std::sync::Arc<crypto::Sealer>,
    notifier: notify::NotifierType,
    audit: audit::AuditWriter,
}

impl<S: store::Store> Engine<S> {
    pub fn new(
        store: S,
        files: std::sync::Arc<files::ContentStore>,
        sealer: std::sync::Arc<crypto::Sealer>,
        notifier: notify::NotifierType,
    ) -> Self {
        Engine {
            store,
            files,
            sealer,
            notifier,
            audit: audit::AuditWriter::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn files(&self) -> &files::ContentStore {
        &self.files
    }

    pub fn audit_writer(&self) -> &audit::AuditWriter {
        &self.audit
    }

    fn record(&self, event: audit::AuditEvent) {
        self.audit.record(&self.store, event);
    }
}

pub struct App {
    pub engine: Engine<store::PgStore>,
    pub sweep_interval: std::time::Duration,
}

pub fn setup(config: &Config) -> Result<App> {
    let sealer = std::sync::Arc::new(crypto::Sealer::new(&config.files.key)?);
    let files = std::sync::Arc::new(files::ContentStore::new(
        &config.files.root, &config.files.bucket, sealer.clone(), &config.files.link_key,
    )?);

    let store = store::PgStore::connect(&config.database_url, config.pool_size)?;
    store.run_migrations()?;
    info!("Database ready, storing content under {}/{}", config.files.root.display(), config.files.bucket);

    Ok(App {
        engine: Engine::new(store, files, sealer, std::sync::Arc::new(notify::LogNotifier)),
        sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct Harness {
        pub engine: Engine<store::MemoryStore>,
        pub notifier: std::sync::Arc<notify::RecordingNotifier>,
        pub dir: tempfile::TempDir,
    }

    pub fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let sealer = std::sync::Arc::new(crypto::test_sealer());
        let files = std::sync::Arc::new(
            files::ContentStore::new(dir.path(), "esign", sealer.clone(), b"link-key").unwrap()
        );
        let notifier = std::sync::Arc::new(notify::RecordingNotifier::default());
        Harness {
            engine: Engine::new(store::MemoryStore::new(), files, sealer, notifier.clone()),
            notifier,
            dir,
        }
    }

    pub fn principal(user_id: i64, role: auth::Role) -> auth::Principal {
        auth::Principal {
            user_id,
            workspace_id: uuid::Uuid::from_u128(0xE516),
            role,
        }
    }

    pub fn client() -> ClientMeta {
        ClientMeta {
            ip: "203.0.113.9".parse().unwrap(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_string(),
        }
    }
}
