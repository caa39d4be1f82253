//! Explicit sync/async callback dispatch.
//!
//! The core accepts callables whose return value may or may not be
//! awaitable. Rather than trying to "detect and await" a returned value,
//! the distinction is made explicit at registration time via the two
//! variants below.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

#[derive(Clone)]
pub enum Callback<Args, Out> {
    Sync(Arc<dyn Fn(Args) -> Out + Send + Sync>),
    Async(Arc<dyn Fn(Args) -> BoxFuture<'static, Out> + Send + Sync>),
}

impl<Args, Out> fmt::Debug for Callback<Args, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Sync(_) => write!(f, "Callback::Sync(..)"),
            Callback::Async(_) => write!(f, "Callback::Async(..)"),
        }
    }
}

impl<Args, Out> Callback<Args, Out> {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Args) -> Out + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Out> + Send + 'static,
    {
        Callback::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    pub async fn invoke(&self, args: Args) -> Out {
        match self {
            Callback::Sync(f) => f(args),
            Callback::Async(f) => f(args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_and_async_variants_both_invoke() {
        let sync_cb: Callback<i32, i32> = Callback::sync(|x| x + 1);
        assert_eq!(sync_cb.invoke(41).await, 42);

        let async_cb: Callback<i32, i32> = Callback::asynchronous(|x| async move { x * 2 });
        assert_eq!(async_cb.invoke(21).await, 42);
    }
}
