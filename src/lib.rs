pub mod config;
pub mod discovery;
pub mod handler;
pub mod manager;
pub mod mtc;
pub mod server;
pub mod store;

pub use service;

use std::sync::Arc;

use self::{
    config::Config,
    discovery::NoopDiscovery,
    manager::Manager,
    store::{FileStore, MemoryStore, Store},
};

/// In order to let the integration test directly use the rtpmidi-server crate
/// and start the server, a function is opened to replace the main function to
/// directly start the server.
///
/// Sessions kept in the store are created first, then configured sessions
/// the store does not know about, then the configured remotes are invited.
pub async fn start_server(config: Config) -> anyhow::Result<Manager> {
    let store: Arc<dyn Store> = match &config.store {
        Some(it) => Arc::new(FileStore::new(&it.path)),
        None => Arc::new(MemoryStore::default()),
    };

    let manager = Manager::new(store, Arc::new(NoopDiscovery));
    manager.start().await?;

    let known = manager.sessions();
    for session in config.sessions {
        if !known.iter().any(|it| it.local_name == session.local_name) {
            manager.create_session(session, true).await?;
        }
    }

    for remote in config.remotes {
        let Some(session) = manager.get_session_by_name(&remote.session) else {
            log::warn!(
                "remote refers to an unknown or inactive session: session={}, address={}",
                remote.session,
                remote.address
            );

            continue;
        };

        session.connect(remote.address)?;
    }

    Ok(manager)
}
