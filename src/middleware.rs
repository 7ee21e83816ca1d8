//! Middleware chain around command handlers.
//!
//! Each middleware gets the context and a [`Next`] continuation. Not calling
//! `next` short-circuits the rest of the chain and the handler; calling it a
//! second time fails with [`BotError::NextCalledTwice`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::commands::{CommandHandler, Context};
use crate::error::{BotError, BotResult};

pub type ChainFuture = Pin<Box<dyn Future<Output = BotResult<()>> + Send>>;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: Arc<Context>, next: Next) -> BotResult<()>;
}

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Arc<Context>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BotResult<()>> + Send + 'static,
{
    async fn handle(&self, ctx: Arc<Context>, next: Next) -> BotResult<()> {
        (self)(ctx, next).await
    }
}

/// Continuation into stage `index` of one chain invocation.
///
/// Stages `0..chain.len()` are middleware, stage `chain.len()` is the
/// handler. All `Next` values of one invocation share a cursor holding the
/// highest stage entered so far; entering a stage the cursor already passed
/// is a reuse.
#[derive(Clone)]
pub struct Next {
    index: usize,
    chain: Arc<[Arc<dyn Middleware>]>,
    handler: Arc<dyn CommandHandler>,
    cursor: Arc<AtomicUsize>,
}

impl Next {
    pub(crate) fn start(chain: Arc<[Arc<dyn Middleware>]>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            index: 0,
            chain,
            handler,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run the rest of the chain.
    ///
    /// The stage is claimed when `run` is called, not when the future is
    /// first polled, so a second call fails even if the first future was
    /// dropped unpolled.
    pub fn run(self, ctx: Arc<Context>) -> ChainFuture {
        let entered = self.cursor.fetch_max(self.index + 1, Ordering::SeqCst);
        if entered > self.index {
            let index = self.index;
            return Box::pin(async move { Err(BotError::NextCalledTwice(index)) });
        }

        Box::pin(async move {
            match self.chain.get(self.index).cloned() {
                Some(middleware) => {
                    let next = Next {
                        index: self.index + 1,
                        ..self
                    };
                    middleware.handle(ctx, next).await
                }
                None => self.handler.call(ctx).await,
            }
        })
    }

    /// Stage this continuation enters.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("len", &self.chain.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{message, RecordingOutbound};
    use crate::commands::{parse_invocation, Command};
    use crate::config::BotConfig;
    use crate::framework::Framework;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    async fn ok_handler(_ctx: Arc<Context>) -> BotResult<()> {
        Ok(())
    }

    async fn failing_handler(_ctx: Arc<Context>) -> BotResult<()> {
        Err(BotError::handler("boom"))
    }

    async fn stop(_ctx: Arc<Context>, _next: Next) -> BotResult<()> {
        Ok(())
    }

    async fn twice(ctx: Arc<Context>, next: Next) -> BotResult<()> {
        next.clone().run(Arc::clone(&ctx)).await?;
        next.run(ctx).await
    }

    async fn drop_then_run(ctx: Arc<Context>, next: Next) -> BotResult<()> {
        drop(next.clone().run(Arc::clone(&ctx)));
        next.run(ctx).await
    }

    fn context() -> Arc<Context> {
        let framework = Framework::new(&BotConfig::default(), Arc::new(RecordingOutbound::default()));
        let command = Command::new("ping", ok_handler);
        let invocation = parse_invocation("!ping", "!", None).unwrap();
        Arc::new(Context::new(
            &command,
            invocation,
            message("1", "c", "!ping"),
            framework,
        ))
    }

    fn handler(trace: &Trace) -> Arc<dyn CommandHandler> {
        let trace = Arc::clone(trace);
        Arc::new(move |_ctx: Arc<Context>| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().unwrap().push("handler".into());
                Ok::<(), BotError>(())
            }
        })
    }

    fn tracing_mw(trace: &Trace, name: &'static str) -> Arc<dyn Middleware> {
        let trace = Arc::clone(trace);
        Arc::new(move |ctx: Arc<Context>, next: Next| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().unwrap().push(format!("{name}:before"));
                let result = next.run(ctx).await;
                trace.lock().unwrap().push(format!("{name}:after"));
                result
            }
        })
    }

    // -- ordering --

    #[tokio::test]
    async fn runs_in_registration_order_around_handler() {
        let trace: Trace = Arc::default();
        let chain: Arc<[Arc<dyn Middleware>]> =
            vec![tracing_mw(&trace, "a"), tracing_mw(&trace, "b")].into();

        Next::start(chain, handler(&trace)).run(context()).await.unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            ["a:before", "b:before", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn empty_chain_runs_handler() {
        let trace: Trace = Arc::default();
        Next::start(Vec::new().into(), handler(&trace))
            .run(context())
            .await
            .unwrap();
        assert_eq!(*trace.lock().unwrap(), ["handler"]);
    }

    // -- short-circuit --

    #[tokio::test]
    async fn skipping_next_prevents_handler() {
        let trace: Trace = Arc::default();
        let chain: Arc<[Arc<dyn Middleware>]> =
            vec![Arc::new(stop) as Arc<dyn Middleware>, tracing_mw(&trace, "b")].into();

        Next::start(chain, handler(&trace)).run(context()).await.unwrap();
        assert!(trace.lock().unwrap().is_empty());
    }

    // -- reuse --

    #[tokio::test]
    async fn calling_next_twice_is_an_error() {
        let trace: Trace = Arc::default();
        let chain: Arc<[Arc<dyn Middleware>]> = vec![Arc::new(twice) as Arc<dyn Middleware>].into();

        let err = Next::start(chain, handler(&trace))
            .run(context())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::NextCalledTwice(1)));
        // The first call went through.
        assert_eq!(*trace.lock().unwrap(), ["handler"]);
    }

    #[tokio::test]
    async fn reuse_after_downstream_short_circuit_is_still_an_error() {
        let trace: Trace = Arc::default();
        let chain: Arc<[Arc<dyn Middleware>]> = vec![
            Arc::new(twice) as Arc<dyn Middleware>,
            Arc::new(stop) as Arc<dyn Middleware>,
        ]
        .into();

        let err = Next::start(chain, handler(&trace))
            .run(context())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::NextCalledTwice(1)));
    }

    #[tokio::test]
    async fn reuse_is_detected_when_first_future_was_never_polled() {
        let trace: Trace = Arc::default();
        let chain: Arc<[Arc<dyn Middleware>]> =
            vec![Arc::new(drop_then_run) as Arc<dyn Middleware>].into();

        let err = Next::start(chain, handler(&trace))
            .run(context())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::NextCalledTwice(1)));
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_errors_propagate_through_chain() {
        let failing: Arc<dyn CommandHandler> = Arc::new(failing_handler);
        let trace: Trace = Arc::default();
        let chain: Arc<[Arc<dyn Middleware>]> = vec![tracing_mw(&trace, "a")].into();

        let err = Next::start(chain, failing).run(context()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(*trace.lock().unwrap(), ["a:before", "a:after"]);
    }
}
