//! Authentication policy seam.
//!
//! The policy decides *who* a connection is; the session owns the protocol
//! around it. Any async function from the `_authenticate` payload to a user
//! id (or a rejection message) is a policy.

use crate::entity::UserId;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::future::Future;

pub type AuthFuture = BoxFuture<'static, std::result::Result<UserId, String>>;

pub trait AuthPolicy: Send + Sync {
    fn authenticate(&self, payload: Value) -> AuthFuture;
}

impl<F, Fut> AuthPolicy for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<UserId, String>> + Send + 'static,
{
    fn authenticate(&self, payload: Value) -> AuthFuture {
        self(payload).boxed()
    }
}
