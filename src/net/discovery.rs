//! Peer discovery.
//!
//! File- and server-based implementations are interchangeable behind the
//! [`Discovery`] trait. The file variant coordinates co-located processes
//! through a shared peers file guarded by a lock file; the server variant is
//! a thin client speaking the `discovery` request kinds over the hub.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::identity::PeerId;

use super::hub::Hub;
use super::proto::Payload;

pub trait Discovery: Send + Sync {
    /// Publish the local peer as reachable.
    fn announce(&self);

    fn get_peers(&self) -> Vec<PeerId>;

    fn remove(&self, peer: &PeerId);

    /// Mutual exclusion around announce/get/remove sequences.
    fn lock(&self);
    fn unlock(&self);

    /// Wipe stale discovery state (startup with `clear_discovery`).
    fn clear(&self);
}

/// Discovery through a shared peers file.
pub struct FileDiscovery {
    peers_path: PathBuf,
    lock_path: PathBuf,
    own: PeerId,
    lock_timeout: Duration,
}

impl FileDiscovery {
    pub fn new(directory: PathBuf, own: PeerId, lock_timeout: Duration) -> Self {
        Self {
            peers_path: directory.join("peers"),
            lock_path: directory.join("peers.lock"),
            own,
            lock_timeout,
        }
    }

    fn read_entries(&self) -> Vec<String> {
        match fs::read_to_string(&self.peers_path) {
            Ok(contents) => contents
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn write_entries(&self, entries: &[String]) {
        let mut body = entries.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        if let Err(error) = fs::write(&self.peers_path, body) {
            tracing::error!(%error, path = %self.peers_path.display(), "writing peers file failed");
        }
    }
}

impl Discovery for FileDiscovery {
    fn announce(&self) {
        let mut entries = self.read_entries();
        let own = self.own.as_str().to_string();
        if !entries.contains(&own) {
            entries.push(own);
            self.write_entries(&entries);
        }
    }

    fn get_peers(&self) -> Vec<PeerId> {
        self.read_entries()
            .into_iter()
            .filter_map(|line| match PeerId::parse(line.clone()) {
                Ok(peer) => Some(peer),
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed peers file entry");
                    None
                }
            })
            .filter(|peer| *peer != self.own)
            .collect()
    }

    fn remove(&self, peer: &PeerId) {
        let entries: Vec<String> = self
            .read_entries()
            .into_iter()
            .filter(|line| line != peer.as_str())
            .collect();
        self.write_entries(&entries);
    }

    fn lock(&self) {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", self.own);
                    return;
                }
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        // Holder is presumed dead; steal the stale lock.
                        tracing::warn!(
                            path = %self.lock_path.display(),
                            "discovery lock wait exceeded timeout, stealing"
                        );
                        let _ = fs::remove_file(&self.lock_path);
                        continue;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(error) => {
                    tracing::error!(%error, "discovery lock failed");
                    return;
                }
            }
        }
    }

    fn unlock(&self) {
        let _ = fs::remove_file(&self.lock_path);
    }

    fn clear(&self) {
        let _ = fs::remove_file(&self.peers_path);
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Discovery through a dedicated server peer.
///
/// Announce doubles as fetch: the server registers the caller and replies
/// with every peer it knows. Locking is a no-op, the server serializes.
pub struct ServerDiscovery {
    hub: Arc<dyn Hub>,
    server: PeerId,
}

impl ServerDiscovery {
    pub fn new(hub: Arc<dyn Hub>, server: PeerId) -> Self {
        Self { hub, server }
    }

    fn fetch(&self) -> Vec<PeerId> {
        match self.hub.request(&self.server, Payload::Discovery) {
            Ok(response) => match response.payload {
                Payload::PeerList { peers } => peers
                    .into_iter()
                    .filter(|peer| peer != self.hub.own_peer())
                    .collect(),
                other => {
                    tracing::warn!(kind = other.kind(), "unexpected discovery response");
                    Vec::new()
                }
            },
            Err(error) => {
                tracing::warn!(%error, server = %self.server, "discovery server unreachable");
                Vec::new()
            }
        }
    }
}

impl Discovery for ServerDiscovery {
    fn announce(&self) {
        let _ = self.fetch();
    }

    fn get_peers(&self) -> Vec<PeerId> {
        self.fetch()
    }

    fn remove(&self, peer: &PeerId) {
        let result = self
            .hub
            .request(&self.server, Payload::DiscoveryRemove { peer: peer.clone() });
        if let Err(error) = result {
            tracing::warn!(%error, server = %self.server, "discovery remove failed");
        }
    }

    fn lock(&self) {}

    fn unlock(&self) {}

    fn clear(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn file_discovery(dir: &std::path::Path, address: &str) -> FileDiscovery {
        FileDiscovery::new(dir.to_path_buf(), peer(address), Duration::from_millis(200))
    }

    #[test]
    fn announce_then_get_sees_other_peers_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_discovery(dir.path(), "127.0.0.1:1");
        let b = file_discovery(dir.path(), "127.0.0.1:2");

        a.lock();
        a.announce();
        a.unlock();
        b.lock();
        b.announce();
        b.unlock();

        assert_eq!(a.get_peers(), vec![peer("127.0.0.1:2")]);
        assert_eq!(b.get_peers(), vec![peer("127.0.0.1:1")]);
    }

    #[test]
    fn announce_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_discovery(dir.path(), "127.0.0.1:1");
        let b = file_discovery(dir.path(), "127.0.0.1:2");
        a.announce();
        a.announce();
        assert_eq!(b.get_peers().len(), 1);
    }

    #[test]
    fn remove_drops_peer() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_discovery(dir.path(), "127.0.0.1:1");
        let b = file_discovery(dir.path(), "127.0.0.1:2");
        a.announce();
        b.announce();
        b.remove(&peer("127.0.0.1:1"));
        assert!(b.get_peers().is_empty());
    }

    #[test]
    fn stale_lock_is_stolen_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_discovery(dir.path(), "127.0.0.1:1");
        // Simulate a dead holder.
        std::fs::write(dir.path().join("peers.lock"), "127.0.0.1:9\n").unwrap();
        let start = Instant::now();
        a.lock();
        assert!(start.elapsed() >= Duration::from_millis(200));
        a.unlock();
    }

    #[test]
    fn clear_wipes_state() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_discovery(dir.path(), "127.0.0.1:1");
        a.announce();
        a.clear();
        assert!(a.get_peers().is_empty());
    }
}
