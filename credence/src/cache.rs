use std::{
    error, fmt,
    future::pending,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use credence_clock::{Clock, System, UnixTime};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
};

use crate::{
    fetch::fetch_until_admitted, CacheConfig, CacheError, ConfigError, Credential,
    CredentialLoader, CredentialStatus, CredentialStream,
};

/// State visible to both the driver and subscribers
pub(crate) struct Shared {
    pub(crate) config: CacheConfig,
    clock: Arc<dyn Clock + Send + Sync>,
    watermark: AtomicU64,
}

impl Shared {
    #[inline]
    pub(crate) fn now(&self) -> UnixTime {
        self.clock.now()
    }

    #[inline]
    pub(crate) fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("now", &self.now())
            .field("watermark", &self.watermark())
            .finish()
    }
}

/// A credential accepted by the cache, tagged with the renew watermark that
/// was current when it was requested
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub(crate) epoch: u64,
    pub(crate) credential: Arc<Credential>,
}

#[derive(Clone, Debug)]
pub(crate) enum SlotState {
    Empty,
    Ready(Entry),
    Failed(CacheError),
    Closed,
}

/// The last thing the driver published, numbered so that subscribers can tell
/// repeated looks at the same publication apart from new ones
#[derive(Clone, Debug)]
pub(crate) struct Publication {
    pub(crate) version: u64,
    pub(crate) state: SlotState,
}

#[derive(Debug)]
pub(crate) enum Command {
    Attach,
    Detach,
    /// A subscriber found the published credential expired at the given time
    Demand(UnixTime),
    Renew,
    Shutdown,
}

/// A shared cache of a single credential
///
/// Cloning the handle is cheap; every clone talks to the same background
/// driver. The driver stops when [`shutdown()`][Self::shutdown] is called or
/// once every handle and every [`CredentialStream`] has been dropped.
#[derive(Clone, Debug)]
pub struct CredentialCache {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    published: watch::Receiver<Publication>,
}

/// Builder for a [`CredentialCache`]
#[must_use]
pub struct CredentialCacheBuilder<L> {
    loader: L,
    config: CacheConfig,
    clock: Arc<dyn Clock + Send + Sync>,
    auth: Option<watch::Receiver<bool>>,
}

impl<L: fmt::Debug> fmt::Debug for CredentialCacheBuilder<L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialCacheBuilder")
            .field("loader", &self.loader)
            .field("config", &self.config)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl<L> CredentialCacheBuilder<L>
where
    L: CredentialLoader + 'static,
{
    /// Sets the validity configuration
    ///
    /// Fails if the configuration's options contradict each other; see
    /// [`CacheConfig::validate()`].
    pub fn with_config(mut self, config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Gates all fetching on an authentication signal
    ///
    /// While the signal reads `false`, the loader is never called. Without a
    /// signal the cache behaves as if permanently authenticated.
    pub fn with_auth_signal(mut self, auth: watch::Receiver<bool>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets a custom clock to be used for expiry decisions
    ///
    /// Useful for testing purposes
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Spawns the cache's driver onto the current Tokio runtime
    ///
    /// No credential is requested until the first subscription.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn(self) -> CredentialCache {
        let shared = Arc::new(Shared {
            config: self.config,
            clock: self.clock,
            watermark: AtomicU64::new(0),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (publisher, published) = watch::channel(Publication {
            version: 0,
            state: SlotState::Empty,
        });

        let mut auth = self.auth;
        let authenticated = auth
            .as_mut()
            .map_or(true, |auth| *auth.borrow_and_update());

        let driver = Driver {
            loader: Arc::new(self.loader),
            shared: Arc::clone(&shared),
            commands: command_rx,
            auth,
            publisher,
            version: 0,
            current: None,
            in_flight: None,
            authenticated,
            deferred_refresh: false,
            subscribers: 0,
        };

        let join = tokio::spawn(driver.run());

        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!("credential cache driver panicked!")
                } else if err.is_cancelled() {
                    tracing::info!("credential cache driver was cancelled")
                }
            }
        });

        CredentialCache {
            shared,
            commands: command_tx,
            published,
        }
    }
}

impl CredentialCache {
    /// Spawns a cache with default configuration and no authentication signal
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new<L>(loader: L) -> Self
    where
        L: CredentialLoader + 'static,
    {
        Self::builder(loader).spawn()
    }

    /// Starts building a cache around `loader`
    pub fn builder<L>(loader: L) -> CredentialCacheBuilder<L>
    where
        L: CredentialLoader + 'static,
    {
        CredentialCacheBuilder {
            loader,
            config: CacheConfig::default(),
            clock: Arc::new(System),
            auth: None,
        }
    }

    /// Subscribes to the cache
    ///
    /// The returned stream first yields the currently held credential, if it is
    /// still valid, and afterwards every credential that replaces it. Subscribing
    /// while nothing valid is held starts a fetch, shared with every other
    /// subscriber.
    pub fn observe(&self) -> CredentialStream {
        let mut published = self.published.clone();
        let since = published.borrow_and_update().version;

        // A closed driver shows up as the end of the stream.
        let _ = self.commands.send(Command::Attach);

        CredentialStream::new(
            Arc::clone(&self.shared),
            self.commands.clone(),
            published,
            since,
        )
    }

    /// Obtains a valid credential
    ///
    /// Equivalent to taking the first item of a fresh [`observe()`][Self::observe]
    /// subscription.
    pub async fn credential(&self) -> Result<Arc<Credential>, CacheError> {
        self.observe().next().await.unwrap_or(Err(CacheError::Closed))
    }

    /// Invalidates the held credential and forces a fresh fetch
    ///
    /// Any fetch already underway is superseded: its result will not be handed
    /// out, and another fetch follows it. While unauthenticated, the fetch is
    /// deferred until authentication resumes.
    pub fn renew(&self) {
        let watermark = self.shared.watermark.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(watermark, "renewal requested");
        let _ = self.commands.send(Command::Renew);
    }

    /// Stops the cache
    ///
    /// Any in-flight fetch is abandoned, the authentication signal is released
    /// and all streams end.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// The validity configuration in use
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Gets a credential's lifetime status according to this cache's clock
    /// and configuration
    pub fn status(&self, credential: &Credential) -> CredentialStatus {
        self.shared.config.status_at(credential, self.shared.now())
    }
}

type FetchOutcome = Result<Result<Credential, CacheError>, JoinError>;

#[derive(Debug)]
struct InFlight {
    epoch: u64,
    task: JoinHandle<Result<Credential, CacheError>>,
}

struct Driver<L> {
    loader: Arc<L>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    auth: Option<watch::Receiver<bool>>,
    publisher: watch::Sender<Publication>,
    version: u64,
    current: Option<Entry>,
    in_flight: Option<InFlight>,
    authenticated: bool,
    deferred_refresh: bool,
    subscribers: usize,
}

impl<L> Driver<L>
where
    L: CredentialLoader + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) => {
                        tracing::debug!("credential cache shut down");
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        tracing::debug!("all credential cache handles dropped");
                        break;
                    }
                },
                authenticated = next_auth_state(&mut self.auth) => match authenticated {
                    Some(authenticated) => self.on_auth(authenticated),
                    None => {
                        tracing::debug!(
                            authenticated = self.authenticated,
                            "authentication signal closed, keeping last state"
                        );
                        self.auth = None;
                    }
                },
                (epoch, outcome) = fetch_outcome(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_fetch_complete(epoch, outcome);
                }
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
        }
        self.current = None;
        self.publish(SlotState::Closed);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Attach => {
                self.subscribers += 1;
                tracing::trace!(subscribers = self.subscribers, "subscriber attached");
                self.ensure_current(self.shared.now());
            }
            Command::Detach => {
                self.subscribers = self.subscribers.saturating_sub(1);
                tracing::trace!(subscribers = self.subscribers, "subscriber detached");
                if self.subscribers == 0 {
                    if let Some(in_flight) = self.in_flight.take() {
                        tracing::debug!("no subscribers left, cancelling credential fetch");
                        in_flight.task.abort();
                    }
                }
            }
            // The driver's clock may read earlier than the subscriber's did.
            Command::Demand(observed_at) => self.ensure_current(self.shared.now().max(observed_at)),
            Command::Renew => self.on_renew(),
            Command::Shutdown => {}
        }
    }

    /// Starts a fetch unless a credential valid at `now` is already held
    fn ensure_current(&mut self, now: UnixTime) {
        if let Some(entry) = &self.current {
            if !self.shared.config.is_expired_at(&entry.credential, now) {
                return;
            }

            tracing::debug!(
                now = now.0,
                expires_at = entry.credential.expires_at().map(|t| t.0),
                "cached credential expired"
            );
            self.invalidate();
        }

        self.request_fetch();
    }

    fn on_renew(&mut self) {
        let watermark = self.shared.watermark();
        tracing::debug!(watermark, "invalidating credential on request");

        if self.current.is_some() {
            self.invalidate();
        }

        if self.in_flight.is_some() {
            tracing::trace!(watermark, "fetch in flight will be superseded");
            return;
        }

        self.request_fetch();
    }

    fn on_auth(&mut self, authenticated: bool) {
        if authenticated == self.authenticated {
            return;
        }
        self.authenticated = authenticated;

        if authenticated {
            tracing::debug!(
                deferred_refresh = self.deferred_refresh,
                subscribers = self.subscribers,
                "authenticated, resuming refreshes"
            );
            self.ensure_current(self.shared.now());
        } else {
            tracing::debug!("no longer authenticated, suppressing refreshes");
            if let Some(in_flight) = self.in_flight.take() {
                tracing::debug!(
                    epoch = in_flight.epoch,
                    "discarding in-flight credential fetch"
                );
                in_flight.task.abort();
                self.deferred_refresh = true;
            }
        }
    }

    fn on_fetch_complete(&mut self, epoch: u64, outcome: FetchOutcome) {
        let result = match outcome {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                tracing::error!("credential fetch panicked!");
                Err(CacheError::LoaderPanicked)
            }
            Err(_) => {
                tracing::trace!(epoch, "credential fetch was cancelled");
                return;
            }
        };

        let watermark = self.shared.watermark();
        if epoch < watermark {
            tracing::debug!(
                epoch,
                watermark,
                "fetch requested before renewal, fetching again"
            );
            self.request_fetch();
            return;
        }

        match result {
            Ok(credential) => {
                tracing::debug!(
                    epoch,
                    expires_at = credential.expires_at().map(|t| t.0),
                    "credential accepted"
                );
                let entry = Entry {
                    epoch,
                    credential: Arc::new(credential),
                };
                self.current = Some(entry.clone());
                self.publish(SlotState::Ready(entry));
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "credential loader failed"
                );
                self.current = None;
                self.publish(SlotState::Failed(error));
            }
        }
    }

    fn invalidate(&mut self) {
        self.current = None;
        self.publish(SlotState::Empty);
    }

    fn request_fetch(&mut self) {
        if self.in_flight.is_some() {
            return;
        }

        if self.subscribers == 0 {
            tracing::trace!("no subscribers, fetching on next subscription");
            return;
        }

        if !self.authenticated {
            tracing::debug!("not authenticated, deferring credential refresh");
            self.deferred_refresh = true;
            return;
        }

        self.dispatch();
    }

    fn dispatch(&mut self) {
        self.deferred_refresh = false;

        let failed = matches!(self.publisher.borrow().state, SlotState::Failed(_));
        if failed {
            self.publish(SlotState::Empty);
        }

        let epoch = self.shared.watermark();
        let loader = Arc::clone(&self.loader);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            fetch_until_admitted(&*loader, &shared.config, &*shared.clock).await
        });

        tracing::debug!(epoch, "requesting new credential");
        self.in_flight = Some(InFlight { epoch, task });
    }

    fn publish(&mut self, state: SlotState) {
        self.version += 1;
        self.publisher.send_replace(Publication {
            version: self.version,
            state,
        });
    }
}

async fn next_auth_state(auth: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match auth {
        Some(auth) => match auth.changed().await {
            Ok(()) => Some(*auth.borrow_and_update()),
            Err(_) => None,
        },
        None => pending().await,
    }
}

async fn fetch_outcome(in_flight: &mut Option<InFlight>) -> (u64, FetchOutcome) {
    match in_flight {
        Some(in_flight) => (in_flight.epoch, (&mut in_flight.task).await),
        None => pending().await,
    }
}
