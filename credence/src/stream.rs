use std::{fmt, sync::Arc};

use credence_clock::UnixTime;
use tokio::sync::{mpsc, watch};

use crate::{
    cache::{Command, Publication, Shared, SlotState},
    CacheError, Credential,
};

/// A subscription to a [`CredentialCache`][crate::CredentialCache]
///
/// Each accepted credential is yielded at most once per stream. Expiry is
/// checked at the moment a credential would be yielded; if the credential
/// the stream would hand out has expired, the stream asks the cache for a new
/// one and waits for it.
///
/// Dropping the stream withdraws its interest. When the last stream goes away,
/// any fetch still underway is cancelled.
pub struct CredentialStream {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    published: watch::Receiver<Publication>,
    since: u64,
    last_delivered: Option<u64>,
    last_failure: Option<u64>,
}

enum Step {
    Deliver(Arc<Credential>),
    Fail(CacheError),
    Demand(UnixTime),
    Wait,
    Closed,
}

impl CredentialStream {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands: mpsc::UnboundedSender<Command>,
        published: watch::Receiver<Publication>,
        since: u64,
    ) -> Self {
        Self {
            shared,
            commands,
            published,
            since,
            last_delivered: None,
            last_failure: None,
        }
    }

    /// Waits for the next valid credential
    ///
    /// Returns an error if the fetch cycle this stream was waiting on failed.
    /// Polling again after an error starts a new attempt. Returns `None` once
    /// the cache has shut down.
    pub async fn next(&mut self) -> Option<Result<Arc<Credential>, CacheError>> {
        loop {
            match self.inspect() {
                Step::Deliver(credential) => return Some(Ok(credential)),
                Step::Fail(error) => return Some(Err(error)),
                Step::Closed => return None,
                Step::Demand(observed_at) => {
                    if self.commands.send(Command::Demand(observed_at)).is_err() {
                        return None;
                    }
                }
                Step::Wait => {}
            }

            if self.published.changed().await.is_err() {
                return None;
            }
        }
    }

    fn inspect(&mut self) -> Step {
        let publication = self.published.borrow_and_update();
        let version = publication.version;
        let now = self.shared.now();

        match &publication.state {
            SlotState::Empty => Step::Wait,
            SlotState::Closed => Step::Closed,
            SlotState::Ready(entry) => {
                if entry.epoch < self.shared.watermark() {
                    // Superseded by a renewal the driver has yet to act on.
                    Step::Wait
                } else if self.shared.config.is_expired_at(&entry.credential, now) {
                    Step::Demand(now)
                } else if self.last_delivered == Some(version) {
                    Step::Wait
                } else {
                    self.last_delivered = Some(version);
                    Step::Deliver(Arc::clone(&entry.credential))
                }
            }
            SlotState::Failed(error) => {
                if version <= self.since {
                    // Belongs to a cycle from before this subscription; attaching
                    // already asked for a new one.
                    Step::Wait
                } else if self.last_failure == Some(version) {
                    Step::Demand(now)
                } else {
                    self.last_failure = Some(version);
                    Step::Fail(error.clone())
                }
            }
        }
    }
}

impl Drop for CredentialStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Detach);
    }
}

impl fmt::Debug for CredentialStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialStream")
            .field("since", &self.since)
            .field("last_delivered", &self.last_delivered)
            .field("last_failure", &self.last_failure)
            .finish_non_exhaustive()
    }
}
