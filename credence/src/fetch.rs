use credence_clock::Clock;

use crate::{CacheConfig, CacheError, Credential, CredentialLoader};

/// Asks the loader for credentials until one is admitted by `config`
///
/// Rejected credentials are dropped without being surfaced. A loader failure
/// ends the cycle.
pub(crate) async fn fetch_until_admitted<L, C>(
    loader: &L,
    config: &CacheConfig,
    clock: &C,
) -> Result<Credential, CacheError>
where
    L: CredentialLoader + ?Sized,
    C: Clock + ?Sized,
{
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        let credential = loader
            .load_credential()
            .await
            .map_err(CacheError::load)?;

        match config.admit(credential, clock.now()) {
            Ok(credential) => {
                tracing::trace!(attempt, "loader produced an acceptable credential");
                return Ok(credential);
            }
            Err(rejection) => {
                tracing::debug!(
                    attempt,
                    %rejection,
                    "discarding credential from loader, requesting another"
                );
            }
        }
    }
}
