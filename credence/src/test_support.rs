use async_trait::async_trait;
use credence_clock::{DurationMillis, UnixTime};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::{CacheConfig, Credential, CredentialLoader};

pub(crate) const NOW: UnixTime = UnixTime(1_700_000_000_000);

/// The timings used by the storefront's own tests: a 10ms buffer, one second
/// of maximum trust and at least 5ms of remaining life
pub(crate) fn test_config() -> CacheConfig {
    CacheConfig::default()
        .with_expiration_buffer(DurationMillis(10))
        .with_max_validity(DurationMillis(1_000))
        .with_min_validity(DurationMillis(5))
}

pub(crate) fn credential(token: &str, expires_at: Option<UnixTime>) -> Credential {
    let credential = Credential::new(token, "https://cpq");
    match expires_at {
        Some(expiry) => credential.with_expiry(expiry),
        None => credential,
    }
}

#[derive(Debug, Error)]
#[error("scripted failure: {0}")]
pub(crate) struct ScriptedFailure(&'static str);

/// A loader whose answers are fed in by the test, one per call
///
/// Each call blocks until the test provides the next answer, so a test
/// controls exactly when an in-flight fetch resolves.
#[derive(Debug)]
pub(crate) struct ScriptedLoader {
    calls: watch::Sender<usize>,
    answers: Mutex<mpsc::UnboundedReceiver<Result<Credential, ScriptedFailure>>>,
}

#[derive(Debug)]
pub(crate) struct Script {
    answers: mpsc::UnboundedSender<Result<Credential, ScriptedFailure>>,
    calls: watch::Receiver<usize>,
}

impl ScriptedLoader {
    pub(crate) fn new() -> (Self, Script) {
        let (answer_tx, answer_rx) = mpsc::unbounded_channel();
        let (calls_tx, calls_rx) = watch::channel(0);

        let loader = Self {
            calls: calls_tx,
            answers: Mutex::new(answer_rx),
        };
        let script = Script {
            answers: answer_tx,
            calls: calls_rx,
        };

        (loader, script)
    }
}

#[async_trait]
impl CredentialLoader for ScriptedLoader {
    type Error = ScriptedFailure;

    async fn load_credential(&self) -> Result<Credential, Self::Error> {
        self.calls.send_modify(|calls| *calls += 1);
        let mut answers = self.answers.lock().await;
        answers
            .recv()
            .await
            .unwrap_or(Err(ScriptedFailure("script ended")))
    }
}

impl Script {
    pub(crate) fn push(&self, credential: Credential) {
        self.answers.send(Ok(credential)).unwrap();
    }

    pub(crate) fn fail(&self, reason: &'static str) {
        self.answers.send(Err(ScriptedFailure(reason))).unwrap();
    }

    pub(crate) fn calls(&self) -> usize {
        *self.calls.borrow()
    }

    pub(crate) async fn wait_for_calls(&mut self, expected: usize) {
        self.calls
            .wait_for(|calls| *calls >= expected)
            .await
            .unwrap();
    }
}
