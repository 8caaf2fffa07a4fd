//! PCM endpoints exposed to local audio clients.

use nix::sys::stat::Mode;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::net::unix::pipe;

use crate::{Error, ErrorKind, Result};

/// A named pipe carrying uncompressed audio between a transport IO worker
/// and a single local client.
///
/// The FIFO is created lazily when the first client connects. Exactly one
/// client may be connected at a time; a second connection attempt is
/// rejected with [ErrorKind::ClientBusy].
pub struct PcmEndpoint {
    fifo: PathBuf,
    client: Mutex<Option<u64>>,
}

impl std::fmt::Debug for PcmEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PcmEndpoint").field("fifo", &self.fifo).field("client", &self.client()).finish()
    }
}

impl PcmEndpoint {
    pub(crate) fn new(dir: &Path, name: &str) -> Self {
        Self { fifo: dir.join(name), client: Mutex::new(None) }
    }

    /// Path of the named pipe of this endpoint.
    pub fn fifo_path(&self) -> &Path {
        &self.fifo
    }

    /// Connected client, if any.
    pub fn client(&self) -> Option<u64> {
        *self.client.lock().unwrap()
    }

    /// Connects a local client to this endpoint, creating the FIFO if it
    /// does not exist yet.
    pub fn connect_client(&self, client: u64) -> Result<()> {
        let mut slot = self.client.lock().unwrap();
        if slot.is_some() {
            return Err(Error::new(ErrorKind::ClientBusy));
        }
        if let Some(dir) = self.fifo.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match nix::unistd::mkfifo(&self.fifo, Mode::from_bits_truncate(0o660)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(err) => return Err(io::Error::from(err).into()),
        }
        log::debug!("Created PCM client {} for {}", client, self.fifo.display());
        *slot = Some(client);
        Ok(())
    }

    /// Disconnects the client. A no-op if no client is connected.
    pub fn disconnect_client(&self) {
        let mut slot = self.client.lock().unwrap();
        if let Some(client) = slot.take() {
            log::debug!("Closing PCM client {} of {}", client, self.fifo.display());
        }
    }

    /// Releases the endpoint: disconnects the client and removes the FIFO.
    ///
    /// The client slot and the FIFO are torn down in one critical section so
    /// that a concurrent worker observes either both or neither.
    pub(crate) fn release(&self) {
        let mut slot = self.client.lock().unwrap();
        if slot.take().is_some() || self.fifo.exists() {
            log::debug!("Releasing PCM endpoint {}", self.fifo.display());
        }
        let _ = std::fs::remove_file(&self.fifo);
    }

    /// Opens the read end of the FIFO. Used by workers of playback streams.
    pub(crate) fn open_rx(&self) -> io::Result<pipe::Receiver> {
        pipe::OpenOptions::new().open_receiver(&self.fifo)
    }

    /// Opens the write end of the FIFO. Used by workers of capture streams.
    ///
    /// Fails with `ENXIO` while no reading client is connected; callers
    /// retry on their next wakeup.
    pub(crate) fn open_tx(&self) -> io::Result<pipe::Sender> {
        pipe::OpenOptions::new().open_sender(&self.fifo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> PcmEndpoint {
        let dir = std::env::temp_dir().join(format!("bluepcm-test-{}", std::process::id()));
        PcmEndpoint::new(&dir, name)
    }

    #[test]
    fn single_client_slot() {
        let pcm = endpoint("pcm-slot");
        pcm.connect_client(1).unwrap();
        assert_eq!(pcm.client(), Some(1));
        assert_eq!(pcm.connect_client(2).unwrap_err().kind, ErrorKind::ClientBusy);
        pcm.disconnect_client();
        assert_eq!(pcm.client(), None);
        pcm.connect_client(2).unwrap();
        pcm.release();
    }

    #[test]
    fn release_is_idempotent() {
        let pcm = endpoint("pcm-release");
        pcm.connect_client(1).unwrap();
        assert!(pcm.fifo_path().exists());
        pcm.release();
        assert!(!pcm.fifo_path().exists());
        pcm.release();
        assert_eq!(pcm.client(), None);
    }
}
