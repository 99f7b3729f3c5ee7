mod config;
mod directory;
mod engine;
mod error;
mod export;
mod messages;
mod pin;
mod server;
mod session;
mod store;

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use warp::Filter;

use config::{Config, TlsPaths};
use directory::{Directory, MemoryDirectory};
use engine::SessionEngine;
use server::Server;
use store::{JsonlStore, MemoryStore, SessionStore};

/// Checks that both PEM files exist and hold at least one certificate and a key.
fn tls_available(tls: &TlsPaths) -> bool {
    let cert_file = match File::open(&tls.cert_path) {
        Ok(file) => file,
        Err(e) => {
            log::warn!("Failed to open certificate file {}: {e}", tls.cert_path.display());
            return false;
        }
    };
    let key_file = match File::open(&tls.key_path) {
        Ok(file) => file,
        Err(e) => {
            log::warn!("Failed to open private key file {}: {e}", tls.key_path.display());
            return false;
        }
    };

    let certs = match rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(certs) => certs,
        Err(e) => {
            log::warn!("Failed to parse certificate: {e}");
            return false;
        }
    };
    if certs.is_empty() {
        log::warn!("No certificates found in {}", tls.cert_path.display());
        return false;
    }

    match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
        Ok(Some(_)) => true,
        Ok(None) => {
            log::warn!("No private key found in {}", tls.key_path.display());
            false
        }
        Err(e) => {
            log::warn!("Failed to parse private key: {e}");
            false
        }
    }
}

async fn open_store(config: &Config) -> std::io::Result<Arc<dyn SessionStore>> {
    match &config.data_dir {
        Some(dir) => {
            log::info!("Persisting sessions under {}", dir.display());
            Ok(Arc::new(JsonlStore::new(dir).await?))
        }
        None => {
            log::info!("No data directory configured, sessions are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn open_directory(config: &Config) -> Arc<dyn Directory> {
    let Some(path) = &config.roster_file else {
        return Arc::new(MemoryDirectory::default());
    };
    match MemoryDirectory::load(path).await {
        Ok(directory) => {
            log::info!("Loaded {} students from {}", directory.len().await, path.display());
            Arc::new(directory)
        }
        Err(e) => {
            log::warn!("Failed to load roster {}: {e}", path.display());
            Arc::new(MemoryDirectory::default())
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            log::error!("Failed to open session store: {e}");
            std::process::exit(1);
        }
    };
    let engine = match SessionEngine::restore(store).await {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Failed to restore sessions: {e}");
            std::process::exit(1);
        }
    };
    let server = Server::new(engine, open_directory(&config).await);

    let routes = server::ws_route(server)
        .or(warp::fs::dir(config.static_dir.clone()))
        .with(warp::cors().allow_any_origin());

    if tls_available(&config.tls) {
        log::info!("Starting secure server (HTTPS/WSS) on {}", config.bind);
        warp::serve(routes)
            .tls()
            .cert_path(&config.tls.cert_path)
            .key_path(&config.tls.key_path)
            .run(config.bind)
            .await;
    } else {
        log::warn!("TLS unavailable, falling back to HTTP/WS on {}", config.bind);
        warp::serve(routes).run(config.bind).await;
    }
}
