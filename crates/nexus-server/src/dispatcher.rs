//! Message id -> handler routing.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use nexus_shared::{Frame, PacketId};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::session::Session;
use crate::stats::names;

/// Handles one packet type.
///
/// `Ok(true)` means the request succeeded, `Ok(false)` that it was refused
/// and the client has been told why. An `Err` is logged by the dispatcher.
pub trait PacketHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a ServerContext,
        session: &'a Arc<Session>,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<bool, ServerError>>;
}

#[derive(Default)]
pub struct PacketDispatcher {
    handlers: RwLock<HashMap<u16, Arc<dyn PacketHandler>>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `message_id`, replacing any previous one.
    pub async fn register_handler(&self, message_id: u16, handler: Arc<dyn PacketHandler>) {
        if self
            .handlers
            .write()
            .await
            .insert(message_id, handler)
            .is_some()
        {
            debug!(message_id, "Packet handler replaced");
        }
    }

    pub async fn unregister_handler(&self, message_id: u16) -> bool {
        self.handlers.write().await.remove(&message_id).is_some()
    }

    pub async fn registered_packet_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.handlers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Route a frame to its handler.
    ///
    /// Unknown ids, handler errors and handler panics all end here as
    /// `false`; none of them reaches the worker.
    pub async fn dispatch(&self, ctx: &ServerContext, session: &Arc<Session>, frame: Frame) -> bool {
        let message_id = frame.message_id;
        let handler = self.handlers.read().await.get(&message_id).cloned();
        let Some(handler) = handler else {
            warn!(
                session = %session.id(),
                error = %ServerError::UnknownMessageId(message_id),
                "Dropping packet"
            );
            ctx.stats.increment(names::DISPATCH_FAILURES);
            return false;
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(ctx, session, frame.payload))
            .catch_unwind()
            .await;
        ctx.stats
            .record_value(names::DISPATCH_MICROS, started.elapsed().as_micros() as f64);

        let packet = PacketId::from_u16(message_id)
            .map(|id| id.to_string())
            .unwrap_or_else(|| message_id.to_string());
        match outcome {
            Ok(Ok(handled)) => handled,
            Ok(Err(e)) => {
                warn!(session = %session.id(), packet = %packet, error = %e, "Handler failed");
                ctx.stats.increment(names::DISPATCH_FAILURES);
                false
            }
            Err(_) => {
                error!(session = %session.id(), packet = %packet, "Handler panicked");
                ctx.stats.increment(names::DISPATCH_FAILURES);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connect, test_context};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        result: fn() -> Result<bool, ServerError>,
    }

    impl PacketHandler for Counting {
        fn handle<'a>(
            &'a self,
            _ctx: &'a ServerContext,
            _session: &'a Arc<Session>,
            _payload: Bytes,
        ) -> BoxFuture<'a, Result<bool, ServerError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                (self.result)()
            }
            .boxed()
        }
    }

    struct Panicking;

    impl PacketHandler for Panicking {
        fn handle<'a>(
            &'a self,
            _ctx: &'a ServerContext,
            _session: &'a Arc<Session>,
            payload: Bytes,
        ) -> BoxFuture<'a, Result<bool, ServerError>> {
            async move {
                if payload.is_empty() {
                    panic!("handler bug");
                }
                Ok(true)
            }
            .boxed()
        }
    }

    fn counting(result: fn() -> Result<bool, ServerError>) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            result,
        })
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_fatal() {
        let (ctx, _dir) = test_context().await;
        let (session, _peer) = connect(&ctx).await;
        assert!(!ctx.dispatcher.dispatch(&ctx, &session, Frame::new(4242, Bytes::new())).await);
        assert_eq!(ctx.stats.get(names::DISPATCH_FAILURES), 1);
    }

    #[tokio::test]
    async fn test_register_replace_unregister() {
        let (ctx, _dir) = test_context().await;
        let (session, _peer) = connect(&ctx).await;
        let dispatcher = PacketDispatcher::new();

        let first = counting(|| Ok(true));
        let second = counting(|| Ok(false));
        dispatcher.register_handler(7000, first.clone()).await;
        assert!(dispatcher.dispatch(&ctx, &session, Frame::new(7000, Bytes::new())).await);

        dispatcher.register_handler(7000, second.clone()).await;
        assert!(!dispatcher.dispatch(&ctx, &session, Frame::new(7000, Bytes::new())).await);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.registered_packet_ids().await, vec![7000]);

        assert!(dispatcher.unregister_handler(7000).await);
        assert!(!dispatcher.unregister_handler(7000).await);
        assert!(!dispatcher.dispatch(&ctx, &session, Frame::new(7000, Bytes::new())).await);
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_contained() {
        let (ctx, _dir) = test_context().await;
        let (session, _peer) = connect(&ctx).await;
        let dispatcher = PacketDispatcher::new();

        dispatcher
            .register_handler(7001, counting(|| Err(ServerError::NotLoggedIn)))
            .await;
        dispatcher.register_handler(7002, Arc::new(Panicking)).await;
        dispatcher.register_handler(7003, counting(|| Ok(true))).await;

        assert!(!dispatcher.dispatch(&ctx, &session, Frame::new(7001, Bytes::new())).await);
        assert!(!dispatcher.dispatch(&ctx, &session, Frame::new(7002, Bytes::new())).await);
        // Still usable afterwards.
        assert!(dispatcher.dispatch(&ctx, &session, Frame::new(7003, Bytes::new())).await);
        assert_eq!(ctx.stats.get(names::DISPATCH_FAILURES), 2);
    }
}
