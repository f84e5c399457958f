//! Credential refresh hook.
//!
//! Issuing credentials is the host application's job. The engine only needs
//! a way to ask for a fresh one when the handshake is rejected.

use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::AuthError;

pub trait CredentialSource: Send + 'static {
    /// Obtain a new bearer credential. The returned future owns everything
    /// it needs; the engine polls it between other work and drops it to
    /// cancel.
    fn refresh(&mut self) -> BoxFuture<'static, Result<String, AuthError>>;
}

/// A credential that cannot be refreshed; a rejected handshake is fatal
/// until the host calls `set_credential`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRefresh;

impl CredentialSource for NoRefresh {
    fn refresh(&mut self) -> BoxFuture<'static, Result<String, AuthError>> {
        futures_util::future::ready(Err(AuthError(
            "credential refresh not supported".to_string(),
        )))
        .boxed()
    }
}

/// Refresh through a callback, e.g. one that calls the session endpoint.
pub struct RefreshWith<F>(pub F);

impl<F, Fut> CredentialSource for RefreshWith<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<String, AuthError>> + Send + 'static,
{
    fn refresh(&mut self) -> BoxFuture<'static, Result<String, AuthError>> {
        (self.0)().boxed()
    }
}
