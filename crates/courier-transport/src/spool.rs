//! Directory spool transport.
//!
//! Outbound envelopes are written as JSON files under
//! `<root>/outbox/<peer>/`; inbound envelopes are read (and removed) from
//! `<root>/inbox/<peer>/`. The gateway that moves files between parties is
//! outside this crate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

use crate::adapter::{MessageTransport, TransportHealthSnapshot};
use crate::envelope::Envelope;

const OUTBOX: &str = "outbox";
const INBOX: &str = "inbox";

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool io: {0}")]
    Io(#[from] io::Error),
    #[error("envelope encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("peer name not usable as a spool directory: {0:?}")]
    InvalidPeer(String),
}

#[derive(Debug)]
pub struct SpoolTransport {
    root: PathBuf,
    seq: u64,
    send_ok: u64,
    send_err: u64,
    recv_ok: u64,
    last_error: Option<String>,
}

impl SpoolTransport {
    /// Opens the spool at `root`, creating the inbox and outbox.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let root = root.into();
        fs::create_dir_all(root.join(OUTBOX))?;
        fs::create_dir_all(root.join(INBOX))?;
        Ok(Self {
            root,
            seq: 0,
            send_ok: 0,
            send_err: 0,
            recv_ok: 0,
            last_error: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn outbox(&self, peer: &str) -> Result<PathBuf, SpoolError> {
        Ok(self.root.join(OUTBOX).join(peer_dir(peer)?))
    }

    pub fn inbox(&self, peer: &str) -> Result<PathBuf, SpoolError> {
        Ok(self.root.join(INBOX).join(peer_dir(peer)?))
    }

    fn write(&mut self, peer: &str, envelope: &Envelope) -> Result<(), SpoolError> {
        let dir = self.outbox(peer)?;
        fs::create_dir_all(&dir)?;
        self.seq += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = dir.join(format!("{millis:016}-{:08}.json", self.seq));
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(envelope)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Oldest inbound file across every peer directory.
    fn next_inbound(&self) -> io::Result<Option<(String, PathBuf)>> {
        let mut oldest: Option<(String, PathBuf)> = None;
        for peer in fs::read_dir(self.root.join(INBOX))? {
            let peer = peer?;
            if !peer.file_type()?.is_dir() {
                continue;
            }
            let name = peer.file_name().to_string_lossy().into_owned();
            for file in fs::read_dir(peer.path())? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let older = match &oldest {
                    Some((_, current)) => path.file_name() < current.file_name(),
                    None => true,
                };
                if older {
                    oldest = Some((name.clone(), path));
                }
            }
        }
        Ok(oldest)
    }
}

impl MessageTransport for SpoolTransport {
    type Peer = String;
    type Error = SpoolError;

    fn send(&mut self, peer: &Self::Peer, envelope: &Envelope) -> Result<(), Self::Error> {
        match self.write(peer, envelope) {
            Ok(()) => {
                self.send_ok += 1;
                Ok(())
            }
            Err(err) => {
                self.send_err += 1;
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn recv(&mut self) -> Option<(Self::Peer, Envelope)> {
        loop {
            let (peer, path) = match self.next_inbound() {
                Ok(Some(next)) => next,
                Ok(None) => return None,
                Err(err) => {
                    warn!(root = %self.root.display(), error = %err, "spool inbox scan failed");
                    self.last_error = Some(err.to_string());
                    return None;
                }
            };
            let parsed = fs::read(&path)
                .map_err(SpoolError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<Envelope>(&bytes)?));
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove spooled envelope");
                self.last_error = Some(err.to_string());
                return None;
            }
            match parsed {
                Ok(envelope) => {
                    self.recv_ok += 1;
                    debug!(peer = %peer, kind = ?envelope.kind, "spooled envelope received");
                    return Some((peer, envelope));
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "dropping unreadable envelope");
                    self.last_error = Some(err.to_string());
                }
            }
        }
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_queued: 0,
            outbound_send_ok: self.send_ok,
            outbound_send_err: self.send_err,
            inbound_received: self.recv_ok,
            last_error: self.last_error.clone(),
        }
    }
}

fn peer_dir(peer: &str) -> Result<&str, SpoolError> {
    let usable = !peer.is_empty()
        && peer != "."
        && peer != ".."
        && !peer.contains(['/', '\\', '\0']);
    if usable {
        Ok(peer)
    } else {
        Err(SpoolError::InvalidPeer(peer.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use courier_core::{Channel, MessageId};

    use super::{SpoolError, SpoolTransport};
    use crate::adapter::MessageTransport;
    use crate::envelope::{Envelope, EnvelopeKind};

    #[test]
    fn outbound_envelopes_become_inbound_after_moving_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut a = SpoolTransport::open(dir.path().join("a")).expect("spool a");
        let mut b = SpoolTransport::open(dir.path().join("b")).expect("spool b");

        let channel: Channel = "mpc/invoices".parse().expect("channel");
        a.send(&"party-b".to_string(), &Envelope::pull_request(channel.clone(), None))
            .expect("send 1");
        let id: MessageId = "m-1".parse().expect("id");
        a.send(&"party-b".to_string(), &Envelope::receipt(id, vec![1]))
            .expect("send 2");

        let inbox = b.inbox("party-a").expect("inbox");
        fs::create_dir_all(&inbox).expect("inbox dir");
        let outbox = a.outbox("party-b").expect("outbox");
        for entry in fs::read_dir(outbox).expect("outbox") {
            let path = entry.expect("entry").path();
            fs::rename(&path, inbox.join(path.file_name().expect("name"))).expect("move");
        }

        let (peer, first) = b.recv().expect("first");
        assert_eq!(peer, "party-a");
        assert_eq!(first.kind, EnvelopeKind::PullRequest);
        assert_eq!(first.channel, Some(channel));
        let (_, second) = b.recv().expect("second");
        assert_eq!(second.kind, EnvelopeKind::Receipt);
        assert!(b.recv().is_none());
        assert_eq!(b.health_snapshot().inbound_received, 2);
    }

    #[test]
    fn unreadable_files_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spool = SpoolTransport::open(dir.path()).expect("spool");
        let inbox = spool.inbox("party-a").expect("inbox");
        fs::create_dir_all(&inbox).expect("inbox dir");
        fs::write(inbox.join("0001.json"), b"not json").expect("write");

        assert!(spool.recv().is_none());
        assert!(spool.health_snapshot().last_error.is_some());
        assert_eq!(fs::read_dir(&inbox).expect("inbox").count(), 0);
    }

    #[test]
    fn path_like_peers_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spool = SpoolTransport::open(dir.path()).expect("spool");
        let err = spool
            .send(&"../escape".to_string(), &Envelope::empty(None))
            .unwrap_err();
        assert!(matches!(err, SpoolError::InvalidPeer(_)));
        assert_eq!(spool.health_snapshot().outbound_send_err, 1);
    }
}
