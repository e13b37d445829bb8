use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;

use crate::{
    config::SessionConfig,
    discovery::{Discovery, RemoteSession},
    handler::Handler,
    server::{self, SessionHandle},
    service::SessionHandler,
    store::Store,
};

/// Builds the event handler of every session the manager starts.
pub type HandlerFactory = Arc<dyn Fn(&SessionConfig) -> Arc<dyn SessionHandler> + Send + Sync>;

struct Entry {
    config: SessionConfig,
    handle: Option<SessionHandle>,
}

/// Registry of the local sessions and of the sessions seen on the network.
pub struct Manager {
    store: Arc<dyn Store>,
    discovery: Arc<dyn Discovery>,
    handlers: HandlerFactory,
    sessions: Mutex<Vec<Entry>>,
    remotes: Mutex<HashMap<String, RemoteSession>>,
}

impl Manager {
    /// Sessions started by this manager log their events and follow MIDI
    /// time code, see [`Manager::with_handler`] to consume them instead.
    pub fn new(store: Arc<dyn Store>, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            handlers: Arc::new(|config: &SessionConfig| {
                Arc::new(Handler::new(&config.local_name)) as Arc<dyn SessionHandler>
            }),
            sessions: Mutex::new(Vec::new()),
            remotes: Mutex::new(HashMap::with_capacity(16)),
            discovery,
            store,
        }
    }

    /// Replace the handler given to the sessions started from now on.
    ///
    /// # Test
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use rtpmidi_server::{
    ///     discovery::NoopDiscovery,
    ///     handler::Handler,
    ///     manager::Manager,
    ///     service::SessionHandler,
    ///     store::MemoryStore,
    /// };
    ///
    /// let manager = Manager::new(Arc::new(MemoryStore::default()), Arc::new(NoopDiscovery))
    ///     .with_handler(|config| Arc::new(Handler::new(&config.local_name)) as Arc<dyn SessionHandler>);
    ///
    /// assert!(manager.sessions().is_empty());
    /// ```
    pub fn with_handler<F>(mut self, factory: F) -> Self
    where
        F: Fn(&SessionConfig) -> Arc<dyn SessionHandler> + Send + Sync + 'static,
    {
        self.handlers = Arc::new(factory);
        self
    }

    /// Create every session kept in the store.
    pub async fn start(&self) -> Result<()> {
        for config in self.store.read()? {
            self.create_session(config, false).await?;
        }

        Ok(())
    }

    /// Register a session, binding it right away when it is activated.
    ///
    /// With `save` the session list is written back to the store.
    pub async fn create_session(&self, config: SessionConfig, save: bool) -> Result<()> {
        if self.contains(&config.local_name) {
            return Err(anyhow!("session already exists: name={}", config.local_name));
        }

        let handle = if config.activated {
            let handle = server::start_session(
                config.options(),
                config.ip_version.unspecified(),
                (self.handlers)(&config),
            )
            .await?;

            if config.published {
                self.discovery.publish(&handle.info().await?);
            }

            Some(handle)
        } else {
            None
        };

        log::info!(
            "session added: name={}, port={}, activated={}",
            config.local_name,
            config.port,
            config.activated
        );

        let name = config.local_name.clone();
        let rejected = {
            let mut sessions = self.sessions.lock();

            // The sockets are bound without the lock held, check again.
            if sessions.iter().any(|it| it.config.local_name == name) {
                Some(handle)
            } else {
                sessions.push(Entry { config, handle });
                None
            }
        };

        if let Some(handle) = rejected {
            if let Some(handle) = handle {
                handle.end().await?;
            }

            return Err(anyhow!("session already exists: name={}", name));
        }

        if save {
            self.save()?;
        }

        Ok(())
    }

    /// End and forget a session, returns whether it existed.
    pub async fn remove_session(&self, name: &str) -> Result<bool> {
        let entry = {
            let mut sessions = self.sessions.lock();
            let Some(index) = sessions.iter().position(|it| it.config.local_name == name) else {
                return Ok(false);
            };

            sessions.remove(index)
        };

        self.end(entry).await?;
        self.save()?;
        Ok(true)
    }

    pub fn get_session_by_name(&self, name: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .iter()
            .find(|it| it.config.local_name == name)
            .and_then(|it| it.handle.clone())
    }

    /// Configuration of every local session.
    pub fn sessions(&self) -> Vec<SessionConfig> {
        self.sessions.lock().iter().map(|it| it.config.clone()).collect()
    }

    pub fn remote_sessions(&self) -> Vec<RemoteSession> {
        self.remotes.lock().values().cloned().collect()
    }

    /// A session was announced on the network.
    ///
    /// Announcements of our own sessions are ignored.
    pub fn remote_session_up(&self, remote: RemoteSession) {
        if self.is_local(&remote) {
            return;
        }

        log::info!(
            "remote session added: name={}, host={}, port={}",
            remote.name,
            remote.host,
            remote.port
        );

        self.remotes.lock().insert(remote.name.clone(), remote);
    }

    /// A session was withdrawn from the network.
    pub fn remote_session_down(&self, remote: &RemoteSession) {
        if self.is_local(remote) {
            return;
        }

        if self.remotes.lock().remove(&remote.name).is_some() {
            log::info!("remote session removed: name={}", remote.name);
        }
    }

    /// End every session, one after the other.
    pub async fn reset(&self) -> Result<()> {
        let entries = std::mem::take(&mut *self.sessions.lock());
        for entry in entries {
            self.end(entry).await?;
        }

        Ok(())
    }

    async fn end(&self, entry: Entry) -> Result<()> {
        if let Some(handle) = entry.handle {
            if entry.config.published {
                if let Ok(info) = handle.info().await {
                    self.discovery.unpublish(&info);
                }
            }

            handle.end().await?;
        }

        log::info!("session removed: name={}", entry.config.local_name);
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.sessions.lock().iter().any(|it| it.config.local_name == name)
    }

    fn is_local(&self, remote: &RemoteSession) -> bool {
        self.sessions
            .lock()
            .iter()
            .any(|it| it.config.bonjour_name() == remote.name && it.config.port == remote.port)
    }

    fn save(&self) -> Result<()> {
        self.store.write(&self.sessions())
    }
}
