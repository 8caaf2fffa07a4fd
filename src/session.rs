//! Bluetooth audio bridge session.

use dbus::nonblock::SyncConnection;
use dbus_tokio::connection;
use futures::Stream;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{adapter::Adapter, ctl::CtlEmitter, Result, TransportEvent};

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Directory holding the PCM named pipes.
    pub runtime_dir: PathBuf,
    /// Time to wait after a drain handshake completes.
    ///
    /// Neither the Bluetooth daemon nor the audio profiles signal when the
    /// last buffered samples became audible, so the drain operation pads the
    /// worker's acknowledgement with this grace period.
    pub drain_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { runtime_dir: PathBuf::from("/run/bluepcm"), drain_grace: Duration::from_millis(200) }
    }
}

/// Shared state of all objects in a bridge session.
pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) ctl: CtlEmitter,
    connection: Option<Arc<SyncConnection>>,
    adapters: Mutex<HashMap<u16, Arc<Adapter>>>,
    dbus_task: Option<JoinHandle<connection::IOResourceError>>,
}

impl SessionInner {
    /// Connection to the Bluetooth daemon, absent in offline sessions.
    pub fn connection(&self) -> Option<&Arc<SyncConnection>> {
        self.connection.as_ref()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(dbus_task) = &self.dbus_task {
            dbus_task.abort();
        }
    }
}

/// Bluetooth audio bridge session.
///
/// Encapsulates a connection to the system Bluetooth daemon together with
/// the configuration and object graph shared by all transports.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ online: {} }}", self.inner.connection.is_some())
    }
}

impl Session {
    /// Create a new session with default configuration.
    ///
    /// This establishes a connection to the system Bluetooth daemon over D-Bus.
    pub async fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default()).await
    }

    /// Create a new session with the specified configuration.
    pub async fn with_config(config: SessionConfig) -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                ctl: CtlEmitter::new(),
                connection: Some(connection),
                adapters: Mutex::new(HashMap::new()),
                dbus_task: Some(dbus_task),
            }),
        })
    }

    /// Create a session that operates without a Bluetooth daemon.
    ///
    /// Media sockets cannot be acquired over the bus in this mode; they must
    /// be attached with [Transport::attach_bt_socket](crate::Transport::attach_bt_socket).
    /// Used by local tooling and tests.
    pub fn offline(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                ctl: CtlEmitter::new(),
                connection: None,
                adapters: Mutex::new(HashMap::new()),
                dbus_task: None,
            }),
        }
    }

    /// Adapter with the specified controller id, created if not known yet.
    pub fn adapter(&self, dev_id: u16) -> Arc<Adapter> {
        let mut adapters = self.inner.adapters.lock().unwrap();
        adapters
            .entry(dev_id)
            .or_insert_with(|| {
                log::debug!("Creating adapter hci{}", dev_id);
                Adapter::new(self.inner.clone(), dev_id)
            })
            .clone()
    }

    /// All known adapters of this session.
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.inner.adapters.lock().unwrap().values().cloned().collect()
    }

    /// Stream transport lifecycle events.
    ///
    /// Events for one transport arrive in the order of its state changes.
    pub fn transport_events(&self) -> impl Stream<Item = TransportEvent> + Unpin {
        UnboundedReceiverStream::new(self.inner.ctl.subscribe())
    }
}
