use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{error::ProbeError, record::Probe};

/// Measures one endpoint.
///
/// Implementations must resolve exactly once and must notice `cancel`
/// promptly: once it fires, the scheduler waits at most its grace period for
/// the future to finish before dropping it. Work that outlives the future
/// (blocking threads, spawned tasks) should watch the token too.
pub trait ProbeService: Send + Sync + 'static {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Probe, ProbeError>>;
}
