//! Host server: application assembly, the hyper accept loop and websocket
//! upgrades.
//!
//! An [`App`] owns the sealed handler tree and everything a request needs.
//! [`App::handle`] is transport agnostic; [`serve`] puts it behind a
//! `TcpListener`.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod env_loader;
pub mod error_page;
pub mod guard;
pub mod pool;
pub mod request;
pub mod response;
pub mod router;
pub mod sse;
pub mod tree;
pub mod websocket;

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::controller::{Controller, Guard};
use crate::error::{BindError, ServeError};
use crate::template::TemplateEngine;

pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use guard::GuardChain;
pub use request::RequestContext;
pub use response::{Body, ResponseWriter};
pub use sse::{Event, EventSender};
pub use tree::{HandlerTree, SubRouter};
pub use websocket::{FrameParser, JsonFrameParser};

use response::bare_status;
use tree::TreeBuilder;
use websocket::SocketSession;

struct AppInner {
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    frame_parser: Option<Arc<dyn FrameParser>>,
}

/// A sealed application. Cheap to clone; shared by every connection.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn tree(&self) -> &HandlerTree {
        self.inner.dispatcher.tree()
    }

    /// Run one buffered request through the lifecycle.
    pub async fn handle(&self, request: Request<Bytes>) -> Response<Body> {
        self.inner.dispatcher.handle(request).await
    }

    /// The frame parser to upgrade `request` with. Upgrades are only taken
    /// on routed paths; anything else is dispatched normally.
    fn socket_parser<B>(&self, request: &Request<B>) -> Option<Arc<dyn FrameParser>> {
        let parser = self.inner.frame_parser.as_ref()?;
        if !hyper_tungstenite::is_upgrade_request(request) {
            return None;
        }
        if self.tree().find(request.uri().path()).is_none() {
            tracing::debug!(path = request.uri().path(), "websocket upgrade on unrouted path");
            return None;
        }
        Some(Arc::clone(parser))
    }

    async fn serve_request(&self, request: Request<Incoming>) -> Response<Body> {
        if let Some(parser) = self.socket_parser(&request) {
            return self.upgrade(request, parser);
        }

        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::debug!(error = %e, "failed to read request body");
                return bare_status(StatusCode::BAD_REQUEST);
            }
        };
        self.handle(Request::from_parts(parts, body)).await
    }

    fn upgrade(&self, mut request: Request<Incoming>, parser: Arc<dyn FrameParser>) -> Response<Body> {
        let (response, websocket) = match hyper_tungstenite::upgrade(&mut request, None) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                tracing::warn!(error = %e, path = request.uri().path(), "websocket upgrade rejected");
                return bare_status(StatusCode::BAD_REQUEST);
            }
        };

        let session = SocketSession::new(
            Arc::clone(&self.inner.dispatcher),
            parser,
            request.uri().clone(),
            request.headers().clone(),
        );
        tokio::spawn(async move {
            match websocket.await {
                Ok(stream) => {
                    let (outbound, inbound) = stream.split();
                    session.run(inbound, outbound).await;
                }
                Err(e) => tracing::warn!(error = %e, "websocket handshake failed"),
            }
        });

        response.map(|body| body.boxed())
    }
}

/// Collects routes, guards and options, then seals them into an [`App`].
///
/// The first binding error is kept and reported by [`build`](Self::build).
pub struct AppBuilder {
    config: ServerConfig,
    tree: TreeBuilder,
    guards: GuardChain,
    frame_parser: Option<Arc<dyn FrameParser>>,
    error: Option<BindError>,
}

impl AppBuilder {
    pub fn new(config: ServerConfig) -> Self {
        let engine = TemplateEngine::new(config.render_pool_capacity);
        Self {
            config,
            tree: TreeBuilder::new(engine),
            guards: GuardChain::new(),
            frame_parser: None,
            error: None,
        }
    }

    /// Mount a top-level controller.
    pub fn mount<C: Controller>(self, pattern: &str, controller: C) -> Self {
        self.routes(|router| router.mount(pattern, controller).map(|_| ()))
    }

    /// Register routes directly against the root router.
    pub fn routes(
        mut self,
        register: impl FnOnce(&mut SubRouter<'_>) -> Result<(), BindError>,
    ) -> Self {
        if self.error.is_none() {
            if let Err(e) = register(&mut self.tree.root()) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn guard(mut self, guard: Arc<dyn Guard>) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn guard_with_order(mut self, guard: Arc<dyn Guard>, order: i32) -> Self {
        self.guards.push_with_order(guard, order);
        self
    }

    /// Accept websocket upgrades, parsing frames with `parser`.
    pub fn frame_parser(mut self, parser: Arc<dyn FrameParser>) -> Self {
        self.frame_parser = Some(parser);
        self
    }

    pub fn engine(&self) -> &TemplateEngine {
        self.tree.engine()
    }

    pub fn build(self) -> Result<App, BindError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let tree = self.tree.seal(self.config.dev_mode);
        tracing::debug!(routes = tree.len(), "handler tree sealed");
        let dispatcher = Dispatcher::new(tree, self.guards, &self.config);
        Ok(App {
            inner: Arc::new(AppInner {
                dispatcher: Arc::new(dispatcher),
                config: self.config,
                frame_parser: self.frame_parser,
            }),
        })
    }
}

/// Serve `app` on its configured address until the process exits.
pub async fn serve(app: App) -> Result<(), ServeError> {
    serve_until(app, std::future::pending()).await
}

/// Serve `app` until `shutdown` resolves. Open connections finish on their
/// own tasks.
pub async fn serve_until(
    app: App,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServeError> {
    let addr = app.config().socket_addr()?;
    let listener = TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    tracing::info!(%addr, dev_mode = app.config().dev_mode, "listening");

    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let app = app.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let app = app.clone();
                async move { Ok::<_, Infallible>(app.serve_request(request).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                tracing::debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }

    tracing::info!("server stopped");
    Ok(())
}
