use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use credence::{loader, CacheConfig, Credential, CredentialCache, CredentialStatus};
use credence_clock::{Clock, DurationMillis, System};
use tokio::{sync::watch, time};

#[derive(Debug, Parser)]
struct Opts {
    /// The endpoint issued credentials are valid for
    #[arg(short, long, env, default_value = "https://cpq.example.com")]
    endpoint: String,

    /// How long each issued credential lives, in milliseconds
    #[arg(short, long, env, default_value_t = 4_000)]
    lifetime_ms: u64,

    /// How long before expiry a credential is treated as expired, in milliseconds
    #[arg(short, long, env, default_value_t = 1_000)]
    buffer_ms: u64,

    /// How often to ask the cache for a credential, in milliseconds
    #[arg(short, long, env, default_value_t = 500)]
    interval_ms: u64,

    /// How often the simulated user logs out and back in, in milliseconds
    #[arg(short, long, env, default_value_t = 7_000)]
    session_ms: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let issued = Arc::new(AtomicU64::new(0));
    let lifetime = DurationMillis(opts.lifetime_ms);
    let endpoint = opts.endpoint.clone();
    let counter = Arc::clone(&issued);
    let loader = loader::from_fn(move || {
        let serial = counter.fetch_add(1, Ordering::Relaxed) + 1;
        let credential = Credential::new(format!("token-{}", serial), endpoint.as_str())
            .with_expiry(System.now() + lifetime);
        async move {
            time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Infallible>(credential)
        }
    });

    let (auth_tx, auth_rx) = watch::channel(true);
    let session_ms = opts.session_ms;
    tokio::spawn(async move {
        let mut session = time::interval(Duration::from_millis(session_ms));
        session.tick().await;
        loop {
            session.tick().await;
            auth_tx.send_modify(|logged_in| *logged_in = !*logged_in);
            tracing::info!(logged_in = *auth_tx.borrow(), "session changed");
        }
    });

    let cache = CredentialCache::builder(loader)
        .with_config(CacheConfig::default().with_expiration_buffer(DurationMillis(opts.buffer_ms)))?
        .with_auth_signal(auth_rx)
        .spawn();

    let mut interval = time::interval(Duration::from_millis(opts.interval_ms));
    for tick in 1_u64.. {
        interval.tick().await;

        if tick % 10 == 0 {
            tracing::info!("renewing credential");
            cache.renew();
        }

        let credential = match time::timeout(Duration::from_secs(1), cache.credential()).await {
            Ok(credential) => credential?,
            Err(_) => {
                tracing::warn!("no credential available, probably logged out");
                continue;
            }
        };

        let status = cache.status(&credential);
        match status {
            CredentialStatus::Valid => tracing::debug!(
                ?status,
                token = format_args!("{:#?}", credential.access_token()),
                expires_at = credential.expires_at().map(|t| t.0),
                issued = issued.load(Ordering::Relaxed),
                "pulled credential"
            ),
            CredentialStatus::Expiring | CredentialStatus::Expired => tracing::warn!(
                ?status,
                token = format_args!("{:#?}", credential.access_token()),
                expires_at = credential.expires_at().map(|t| t.0),
                "pulled credential"
            ),
        }
    }

    Ok(())
}
