//! Request lifecycle.
//!
//! `guard check -> method dispatch -> load + render | stream | act`, with
//! lifecycle errors routed to the nearest error boundary, then to the nearest
//! panic boundary, then to the generic error page. Every stage runs under
//! `catch_unwind`, so a panicking controller only affects its own request.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use bytes::Bytes;
use futures_util::FutureExt;
use hyper::{Request, Response};
use serde_json::Value;
use uuid::Uuid;

use crate::controller::descriptor::{BoundRenderer, ErasedViewModel, Model};
use crate::controller::{ControllerDescriptor, Handler, Recovery};
use crate::error::Error;
use crate::serve::config::ServerConfig;
use crate::serve::error_page::write_error;
use crate::serve::guard::GuardChain;
use crate::serve::request::RequestContext;
use crate::serve::response::{Body, ResponseWriter};
use crate::serve::sse::{self, Sources};
use crate::serve::tree::{HandlerTree, NodeId};

const WRITE_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "DELETE"];

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Capture a backtrace at the panic site for `panic_error` to pick up.
/// The previously installed hook still runs.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let backtrace = LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string());
    Error::panic(message, backtrace)
}

/// Poll `fut` to completion, turning a panic into `Error::Panic`.
async fn guarded<T>(ctx: &RequestContext, fut: impl Future<Output = T>) -> Result<T, Error> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let error = panic_error(payload);
            tracing::error!(
                event = "panic_recovered",
                request_id = %ctx.request_id(),
                error = %error,
                backtrace = error.backtrace().unwrap_or_default(),
            );
            Err(error)
        }
    }
}

enum Outcome {
    Respond(ResponseWriter),
    Stream(Sources),
    Failed(Error),
}

/// Runs requests against a sealed tree.
#[derive(Debug)]
pub struct Dispatcher {
    tree: HandlerTree,
    guards: GuardChain,
    dev_mode: bool,
    stream_buffer: usize,
}

impl Dispatcher {
    pub fn new(tree: HandlerTree, guards: GuardChain, config: &ServerConfig) -> Self {
        install_panic_hook();
        Self {
            tree,
            guards,
            dev_mode: config.dev_mode,
            stream_buffer: config.stream_buffer,
        }
    }

    pub fn tree(&self) -> &HandlerTree {
        &self.tree
    }

    pub async fn handle(&self, request: Request<Bytes>) -> Response<Body> {
        self.dispatch(RequestContext::new(request)).await
    }

    /// Serve one request. Always produces exactly one response.
    pub async fn dispatch(&self, mut ctx: RequestContext) -> Response<Body> {
        let head = ctx.method().as_str() == "HEAD";
        let request_id = ctx.request_id();

        let Some(route) = self.tree.find(ctx.path()) else {
            let mut out = ResponseWriter::new();
            write_error(
                &mut out,
                &Error::not_found(),
                request_id,
                ctx.wants_json(),
                self.dev_mode,
            );
            return finish(out, head, request_id);
        };
        ctx.set_params(route.params);
        let chain = route.chain;

        let outcome = guarded(&ctx, self.run(&ctx, &chain))
            .await
            .unwrap_or_else(Outcome::Failed);
        let out = match outcome {
            Outcome::Respond(out) => out,
            Outcome::Stream(sources) => return sse::respond(ctx, sources, self.stream_buffer),
            Outcome::Failed(error) => self.recover(&mut ctx, &chain, error).await,
        };
        finish(out, head, request_id)
    }

    async fn run(&self, ctx: &RequestContext, chain: &[NodeId]) -> Outcome {
        let request_id = ctx.request_id();
        if let Some((guard, handler)) = self.guards.check(&self.tree, chain, ctx).await {
            tracing::info!(event = "guard_diverted", %request_id, guard);
            return into_outcome(self.divert(handler, ctx).await);
        }

        let Some(&leaf) = chain.last() else {
            return Outcome::Failed(Error::not_found());
        };
        let node = self.tree.node(leaf);
        let descriptor = node.descriptor();

        if let Some(handler) = &descriptor.handler {
            return into_outcome(self.divert(Arc::clone(handler), ctx).await);
        }

        let method = ctx.method().as_str();
        match method {
            "GET" | "HEAD" => {
                if method == "GET" && ctx.wants_event_stream() && !descriptor.streams.is_empty() {
                    return Outcome::Stream(descriptor.streams.clone());
                }
                if !descriptor.has_render_path() {
                    return self.not_allowed(ctx, descriptor);
                }
                into_outcome(self.render_chain(ctx, chain).await)
            }
            m if WRITE_METHODS.contains(&m) => {
                let Some(action) = &descriptor.action else {
                    return self.not_allowed(ctx, descriptor);
                };
                let mut out = ResponseWriter::new();
                match action.act(&mut out, ctx).await {
                    Ok(()) => Outcome::Respond(out),
                    Err(error) => {
                        tracing::warn!(
                            event = "action_error",
                            %request_id,
                            node = %node.pattern(),
                            error = %error
                        );
                        Outcome::Failed(error)
                    }
                }
            }
            _ => self.not_allowed(ctx, descriptor),
        }
    }

    fn not_allowed(&self, ctx: &RequestContext, descriptor: &ControllerDescriptor) -> Outcome {
        let mut methods = Vec::new();
        if descriptor.has_render_path() {
            methods.extend(["GET", "HEAD"]);
        } else if !descriptor.streams.is_empty() {
            // Only an event-stream GET reaches a stream-only node.
            methods.push("GET");
        }
        if descriptor.action.is_some() {
            methods.extend(WRITE_METHODS);
        }
        tracing::info!(
            event = "method_not_allowed",
            request_id = %ctx.request_id(),
            method = %ctx.method(),
            path = ctx.path()
        );

        let mut out = ResponseWriter::new();
        write_error(
            &mut out,
            &Error::method_not_allowed(),
            ctx.request_id(),
            ctx.wants_json(),
            self.dev_mode,
        );
        out.header("allow", methods.join(", "));
        Outcome::Respond(out)
    }

    async fn divert(
        &self,
        handler: Arc<dyn Handler>,
        ctx: &RequestContext,
    ) -> Result<ResponseWriter, Error> {
        let mut out = ResponseWriter::new();
        guarded(ctx, handler.handle(&mut out, ctx)).await??;
        Ok(out)
    }

    async fn load(
        &self,
        id: NodeId,
        ctx: &RequestContext,
    ) -> Result<Option<Model>, Error> {
        let node = self.tree.node(id);
        let Some(loader) = &node.descriptor().loader else {
            return Ok(None);
        };
        loader.load(ctx).await.map(Some).map_err(|error| {
            tracing::warn!(
                event = "loader_error",
                request_id = %ctx.request_id(),
                node = %node.pattern(),
                error = %error
            );
            error
        })
    }

    /// Render the leaf, then splice it outward through outlet-bearing
    /// ancestors.
    async fn render_chain(
        &self,
        ctx: &RequestContext,
        chain: &[NodeId],
    ) -> Result<ResponseWriter, Error> {
        let Some((&leaf, ancestors)) = chain.split_last() else {
            return Err(Error::not_found());
        };
        let model = self.load(leaf, ctx).await?;

        if ctx.wants_json() {
            let mut out = ResponseWriter::new();
            out.json(&model_context(model.as_deref())?)?;
            return Ok(out);
        }

        let mut out = self.render_node(leaf, ctx, model.as_deref()).await?;
        let mut child = leaf;
        for &parent in ancestors.iter().rev() {
            let descriptor = self.tree.node(parent).descriptor();
            match &descriptor.renderer {
                // A vanilla ancestor ends composition; the child is the response.
                None => break,
                Some(BoundRenderer::Template(template)) if template.outlet().present => {
                    let model = self.load(parent, ctx).await?;
                    let inner = String::from_utf8_lossy(&out.take_body()).into_owned();
                    let html = template
                        .render(&model_context(model.as_deref())?, Some(&inner))
                        .map_err(|e| self.render_failed(ctx, parent, e.into()))?;
                    out.html(html);
                }
                Some(_) => {
                    tracing::warn!(
                        event = "orphaned_outlet",
                        request_id = %ctx.request_id(),
                        child = %self.tree.node(child).pattern(),
                        parent = %self.tree.node(parent).pattern(),
                    );
                    let model = self.load(parent, ctx).await?;
                    let mut raw = self.render_node(parent, ctx, model.as_deref()).await?;
                    raw.inherit_headers(&out);
                    out = raw;
                    break;
                }
            }
            child = parent;
        }

        tracing::info!(
            event = "render_success",
            request_id = %ctx.request_id(),
            node = %self.tree.node(leaf).pattern(),
            bytes = out.body().len()
        );
        Ok(out)
    }

    async fn render_node(
        &self,
        id: NodeId,
        ctx: &RequestContext,
        model: Option<&dyn ErasedViewModel>,
    ) -> Result<ResponseWriter, Error> {
        let mut out = ResponseWriter::new();
        let result = match &self.tree.node(id).descriptor().renderer {
            Some(BoundRenderer::Template(template)) => model_context(model).and_then(|context| {
                let html = template.render(&context, None)?;
                out.html(html);
                Ok(())
            }),
            Some(BoundRenderer::Custom(renderer)) => match model {
                Some(model) => renderer.render(&mut out, ctx, model).await,
                None => Err(Error::render("custom renderer has no view model")),
            },
            // A loader without a renderer answers with its model.
            None => model_context(model).and_then(|context| out.json(&context).map(|_| ())),
        };
        result
            .map(|()| out)
            .map_err(|error| self.render_failed(ctx, id, error))
    }

    fn render_failed(&self, ctx: &RequestContext, id: NodeId, error: Error) -> Error {
        tracing::warn!(
            event = "render_error",
            request_id = %ctx.request_id(),
            node = %self.tree.node(id).pattern(),
            error = %error
        );
        error
    }

    fn nearest<T>(
        &self,
        chain: &[NodeId],
        pick: impl Fn(&ControllerDescriptor) -> Option<T>,
    ) -> Option<T> {
        chain
            .iter()
            .rev()
            .find_map(|&id| pick(self.tree.node(id).descriptor()))
    }

    /// Error boundary, then panic boundary, then the generic error page.
    async fn recover(
        &self,
        ctx: &mut RequestContext,
        chain: &[NodeId],
        error: Error,
    ) -> ResponseWriter {
        ctx.record_error(&error);
        let ctx = &*ctx;
        let request_id = ctx.request_id();

        let boundary = self.nearest(chain, |d| d.error_boundary.clone());
        let error = match boundary {
            Some(boundary) if !error.is_panic() => {
                let mut out = ResponseWriter::new();
                let recovery = guarded(ctx, boundary.on_error(&mut out, ctx, error)).await;
                match self.settle(ctx, out, recovery, "error").await {
                    Ok(out) => return out,
                    Err(error) => error,
                }
            }
            _ => {
                if !error.is_panic() {
                    tracing::warn!(
                        event = "error_escalated",
                        %request_id,
                        tier = "error",
                        error = %error,
                        "no error boundary"
                    );
                }
                error
            }
        };

        let error = match self.nearest(chain, |d| d.panic_boundary.clone()) {
            Some(boundary) => {
                let mut out = ResponseWriter::new();
                let recovery = guarded(ctx, boundary.on_panic(&mut out, ctx, error)).await;
                match self.settle(ctx, out, recovery, "panic").await {
                    Ok(out) => return out,
                    Err(error) => error,
                }
            }
            None => error,
        };

        self.fail(ctx, &error)
    }

    async fn settle(
        &self,
        ctx: &RequestContext,
        out: ResponseWriter,
        recovery: Result<Recovery, Error>,
        tier: &'static str,
    ) -> Result<ResponseWriter, Error> {
        let request_id = ctx.request_id();
        match recovery? {
            Recovery::Handled => {
                tracing::info!(event = "error_handled", %request_id, tier);
                Ok(out)
            }
            Recovery::Divert(handler) => {
                tracing::info!(event = "error_handled", %request_id, tier, diverted = true);
                self.divert(handler, ctx).await
            }
            Recovery::Escalate(error) => {
                tracing::warn!(event = "error_escalated", %request_id, tier, error = %error);
                Err(error)
            }
        }
    }

    fn fail(&self, ctx: &RequestContext, error: &Error) -> ResponseWriter {
        let status = error.status();
        if status.is_server_error() {
            tracing::error!(
                request_id = %ctx.request_id(),
                status = status.as_u16(),
                error = %error,
                backtrace = error.backtrace().unwrap_or_default(),
                "request failed"
            );
        }
        let mut out = ResponseWriter::new();
        write_error(&mut out, error, ctx.request_id(), ctx.wants_json(), self.dev_mode);
        out
    }
}

fn into_outcome(result: Result<ResponseWriter, Error>) -> Outcome {
    match result {
        Ok(out) => Outcome::Respond(out),
        Err(error) => Outcome::Failed(error),
    }
}

/// The render context of a node: its serialized model, or `null`.
fn model_context(model: Option<&dyn ErasedViewModel>) -> Result<Value, Error> {
    model.map_or(Ok(Value::Null), |m| m.to_json())
}

fn finish(mut out: ResponseWriter, head: bool, request_id: Uuid) -> Response<Body> {
    if out.header_value("x-request-id").is_none() {
        out.header("x-request-id", request_id.to_string());
    }
    if head {
        out.clear_body();
    }
    out.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{
        redirect, Action, Controller, DescriptorBuilder, ErrorBoundary, Loader, PanicBoundary,
        StreamSource, ViewModel,
    };
    use crate::serve::guard::RequireHeader;
    use crate::serve::sse::EventSender;
    use crate::serve::tree::TreeBuilder;
    use crate::template::TemplateEngine;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use hyper::StatusCode;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn dispatcher(dev_mode: bool, guards: GuardChain, build: impl FnOnce(&mut TreeBuilder)) -> Dispatcher {
        let mut builder = TreeBuilder::new(TemplateEngine::default());
        build(&mut builder);
        let config = ServerConfig::default().with_dev_mode(dev_mode);
        Dispatcher::new(builder.seal(dev_mode), guards, &config)
    }

    fn template(builder: &TreeBuilder, source: &str) -> ControllerDescriptor {
        DescriptorBuilder::new("", builder.engine())
            .template::<Value>(source)
            .build()
            .unwrap()
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::get(path).body(Bytes::new()).unwrap()
    }

    async fn body_of(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[derive(Serialize)]
    struct Greeting {
        name: String,
    }

    impl ViewModel for Greeting {
        fn template() -> Option<&'static str> {
            Some("<p>Hello <%= name %></p>")
        }
    }

    struct Greeter;

    #[async_trait]
    impl Loader<Greeting> for Greeter {
        async fn load(&self, ctx: &RequestContext) -> Result<Greeting, Error> {
            Ok(Greeting {
                name: ctx.param("name").unwrap_or("world").to_string(),
            })
        }
    }

    impl Controller for Greeter {
        type ViewModel = Greeting;

        fn loader(self: &Arc<Self>) -> Option<Arc<dyn Loader<Greeting>>> {
            Some(self.clone())
        }
    }

    struct Failing(&'static str);

    #[async_trait]
    impl Loader<Value> for Failing {
        async fn load(&self, _ctx: &RequestContext) -> Result<Value, Error> {
            Err(Error::internal(self.0))
        }
    }

    struct Exploding;

    #[async_trait]
    impl Loader<Value> for Exploding {
        async fn load(&self, _ctx: &RequestContext) -> Result<Value, Error> {
            panic!("loader exploded")
        }
    }

    struct Escalating(Arc<AtomicUsize>);

    #[async_trait]
    impl ErrorBoundary for Escalating {
        async fn on_error(
            &self,
            _out: &mut ResponseWriter,
            _ctx: &RequestContext,
            error: Error,
        ) -> Recovery {
            self.0.fetch_add(1, Ordering::SeqCst);
            Recovery::Escalate(error)
        }
    }

    /// Sends every failed request to the login page.
    struct ToLogin;

    #[async_trait]
    impl ErrorBoundary for ToLogin {
        async fn on_error(
            &self,
            _out: &mut ResponseWriter,
            _ctx: &RequestContext,
            _error: Error,
        ) -> Recovery {
            Recovery::Divert(redirect("/login"))
        }
    }

    struct MissingPage;

    #[async_trait]
    impl ErrorBoundary for MissingPage {
        async fn on_error(
            &self,
            out: &mut ResponseWriter,
            _ctx: &RequestContext,
            error: Error,
        ) -> Recovery {
            out.status(StatusCode::NOT_FOUND)
                .text(format!("no such item ({error})"));
            Recovery::Handled
        }
    }

    struct Apology;

    #[async_trait]
    impl PanicBoundary for Apology {
        async fn on_panic(
            &self,
            out: &mut ResponseWriter,
            ctx: &RequestContext,
            error: Error,
        ) -> Recovery {
            out.status(StatusCode::SERVICE_UNAVAILABLE).text(format!(
                "sorry: {} / {}",
                error,
                ctx.last_error().unwrap_or_default()
            ));
            Recovery::Handled
        }
    }

    #[tokio::test]
    async fn test_three_level_outlet_composition() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            let a = template(b, "<div><%= outlet %></div>");
            let bb = template(b, "<span><%= outlet %></span>");
            let c = template(b, "Hello world!");
            let a = b.root().mount_descriptor("/a", a).unwrap();
            let bb = b.at(a).mount_descriptor("b", bb).unwrap();
            b.at(bb).mount_descriptor("c", c).unwrap();
        });

        let response = app.handle(get("/a/b/c")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "<div><span>Hello world!</span></div>");

        // Intermediate nodes answer on their own paths with an empty outlet.
        assert_eq!(body_of(app.handle(get("/a/b")).await).await, "<div><span></span></div>");
    }

    #[tokio::test]
    async fn test_vanilla_parent_stops_composition() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            let layout = template(b, "<div><%= outlet %></div>");
            let vanilla = DescriptorBuilder::new("", b.engine()).build().unwrap();
            let leaf = template(b, "leaf");
            let layout = b.root().mount_descriptor("/a", layout).unwrap();
            let vanilla = b.at(layout).mount_descriptor("v", vanilla).unwrap();
            b.at(vanilla).mount_descriptor("c", leaf).unwrap();
        });
        assert_eq!(body_of(app.handle(get("/a/v/c")).await).await, "leaf");
    }

    #[traced_test]
    #[tokio::test]
    async fn test_outletless_parent_returns_its_own_output() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            let plain = template(b, "<main>plain</main>");
            let child = template(b, "child");
            let parent = b.root().mount_descriptor("/p", plain).unwrap();
            b.at(parent).mount_descriptor("c", child).unwrap();
        });
        assert_eq!(body_of(app.handle(get("/p/c")).await).await, "<main>plain</main>");
        assert!(logs_contain("orphaned_outlet"));
    }

    #[tokio::test]
    async fn test_loader_renderer_get_is_idempotent() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            b.root().mount("/hello/:name", Greeter).unwrap();
        });
        let first = body_of(app.handle(get("/hello/ada")).await).await;
        let second = body_of(app.handle(get("/hello/ada")).await).await;
        assert_eq!(first, "<p>Hello ada</p>");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_json_negotiation_bypasses_template() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            b.root().mount("/hello/:name", Greeter).unwrap();
            let page = template(b, "static");
            b.root().mount_descriptor("/about", page).unwrap();
        });

        let request = Request::get("/hello/ada")
            .header("accept", "application/json")
            .body(Bytes::new())
            .unwrap();
        let response = app.handle(request).await;
        assert_eq!(response.headers()["content-type"], "application/json");
        let value: Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(value, json!({"name": "ada"}));

        let request = Request::get("/about")
            .header("accept", "application/json")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(body_of(app.handle(request).await).await, "null");
    }

    #[traced_test]
    #[tokio::test]
    async fn test_declined_error_reaches_panic_boundary() {
        let calls = Arc::new(AtomicUsize::new(0));
        let boundary_calls = calls.clone();
        let app = dispatcher(false, GuardChain::new(), move |b| {
            let shop = DescriptorBuilder::new("/shop", b.engine())
                .panic_boundary(Arc::new(Apology))
                .build()
                .unwrap();
            let items = DescriptorBuilder::new("/shop/items", b.engine())
                .loader::<Value>(Arc::new(Failing("database offline")))
                .template::<Value>("<%= title %>")
                .error_boundary(Arc::new(Escalating(boundary_calls)))
                .build()
                .unwrap();
            let shop = b.root().mount_descriptor("/shop", shop).unwrap();
            b.at(shop).mount_descriptor("items", items).unwrap();
        });

        let response = app.handle(get("/shop/items")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_of(response).await,
            "sorry: database offline / database offline"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(logs_contain("loader_error"));
        assert!(logs_contain("error_escalated"));
        assert!(logs_contain("error_handled"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_error_boundary_diverts_to_redirect() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            let d = DescriptorBuilder::new("/account", b.engine())
                .loader::<Value>(Arc::new(Failing("session expired")))
                .template::<Value>("<%= name %>")
                .error_boundary(Arc::new(ToLogin))
                .build()
                .unwrap();
            b.root().mount_descriptor("/account", d).unwrap();
        });

        let response = app.handle(get("/account")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()["location"], "/login");
        assert!(response.headers().contains_key("x-request-id"));
        assert!(logs_contain("error_handled"));
        assert!(logs_contain("diverted=true"));
        assert!(!logs_contain("error_escalated"));
    }

    #[tokio::test]
    async fn test_nearest_error_boundary_handles_with_its_own_response() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            let items = DescriptorBuilder::new("/items", b.engine())
                .error_boundary(Arc::new(ToLogin))
                .build()
                .unwrap();
            let item = DescriptorBuilder::new("/items/:id", b.engine())
                .loader::<Value>(Arc::new(Failing("row 7 missing")))
                .template::<Value>("<%= name %>")
                .error_boundary(Arc::new(MissingPage))
                .build()
                .unwrap();
            let items = b.root().mount_descriptor("/items", items).unwrap();
            b.at(items).mount_descriptor(":id", item).unwrap();
        });

        let response = app.handle(get("/items/7")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("location").is_none());
        assert_eq!(body_of(response).await, "no such item (row 7 missing)");
    }

    #[tokio::test]
    async fn test_unrecovered_error_hides_details_outside_dev_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let boundary_calls = calls.clone();
        let app = dispatcher(false, GuardChain::new(), move |b| {
            let d = DescriptorBuilder::new("/report", b.engine())
                .loader::<Value>(Arc::new(Failing("secret connection string")))
                .error_boundary(Arc::new(Escalating(boundary_calls)))
                .build()
                .unwrap();
            b.root().mount_descriptor("/report", d).unwrap();
        });

        let response = app.handle(get("/report")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let html = body_of(response).await;
        assert!(html.contains("Internal Server Error"));
        assert!(!html.contains("secret"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_panic_is_contained_and_traced_in_dev_mode() {
        let app = dispatcher(true, GuardChain::new(), |b| {
            let d = DescriptorBuilder::new("/boom", b.engine())
                .loader::<Value>(Arc::new(Exploding))
                .build()
                .unwrap();
            b.root().mount_descriptor("/boom", d).unwrap();
        });

        let response = app.handle(get("/boom")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let html = body_of(response).await;
        assert!(html.contains("loader exploded"));
        assert!(html.contains("Backtrace"));
        assert!(logs_contain("panic_recovered"));

        // The next request is unaffected.
        assert_eq!(app.handle(get("/boom")).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_panicking_panic_boundary_yields_generic_500() {
        struct Fragile;

        #[async_trait]
        impl PanicBoundary for Fragile {
            async fn on_panic(
                &self,
                _out: &mut ResponseWriter,
                _ctx: &RequestContext,
                _error: Error,
            ) -> Recovery {
                panic!("boundary exploded")
            }
        }

        let app = dispatcher(false, GuardChain::new(), |b| {
            let d = DescriptorBuilder::new("/fragile", b.engine())
                .loader::<Value>(Arc::new(Exploding))
                .panic_boundary(Arc::new(Fragile))
                .build()
                .unwrap();
            b.root().mount_descriptor("/fragile", d).unwrap();
        });
        let response = app.handle(get("/fragile")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body_of(response).await.contains("exploded"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_method_not_allowed() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            b.root().mount("/hello/:name", Greeter).unwrap();
        });
        let request = Request::post("/hello/ada").body(Bytes::new()).unwrap();
        let response = app.handle(request).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()["allow"], "GET, HEAD");
        assert!(logs_contain("method_not_allowed"));

        let request = Request::options("/hello/ada").body(Bytes::new()).unwrap();
        assert_eq!(app.handle(request).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_head_drops_body() {
        let app = dispatcher(false, GuardChain::new(), |b| {
            b.root().mount("/hello/:name", Greeter).unwrap();
        });
        let request = Request::head("/hello/ada").body(Bytes::new()).unwrap();
        let response = app.handle(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(body_of(response).await, "");
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let app = dispatcher(false, GuardChain::new(), |_| {});
        let request = Request::get("/missing")
            .header("accept", "application/json")
            .body(Bytes::new())
            .unwrap();
        let response = app.handle(request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value: Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(value["error"], "not found");
    }

    #[traced_test]
    #[tokio::test]
    async fn test_guard_diverts_before_load() {
        let mut guards = GuardChain::new();
        guards.push(Arc::new(RequireHeader::new("x-api-key", StatusCode::UNAUTHORIZED)));
        let app = dispatcher(false, guards, |b| {
            b.root().mount("/hello/:name", Greeter).unwrap();
        });

        let response = app.handle(get("/hello/ada")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(logs_contain("guard_diverted"));

        let request = Request::get("/hello/ada")
            .header("x-api-key", "k")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(body_of(app.handle(request).await).await, "<p>Hello ada</p>");
    }

    #[tokio::test]
    async fn test_action_handles_write_without_render() {
        #[derive(Deserialize)]
        struct NewPost {
            title: String,
        }

        struct CreatePost;

        #[async_trait]
        impl Action for CreatePost {
            async fn act(&self, out: &mut ResponseWriter, ctx: &RequestContext) -> Result<(), Error> {
                let post: NewPost = ctx.decode()?;
                out.redirect(&format!("/posts/{}", post.title));
                Ok(())
            }
        }

        let app = dispatcher(false, GuardChain::new(), |b| {
            let d = DescriptorBuilder::new("/posts", b.engine())
                .action(Arc::new(CreatePost))
                .build()
                .unwrap();
            b.root().mount_descriptor("/posts", d).unwrap();
        });

        let request = Request::post("/posts")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Bytes::from_static(b"title=hello"))
            .unwrap();
        let response = app.handle(request).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()["location"], "/posts/hello");

        // A read on an action-only node has nothing to render.
        let response = app.handle(get("/posts")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()["allow"], "POST, PUT, PATCH, DELETE");
    }

    #[tokio::test]
    async fn test_event_stream_negotiation() {
        struct Ticks;

        #[async_trait]
        impl StreamSource for Ticks {
            async fn stream(&self, events: EventSender, _ctx: &RequestContext) -> Result<(), Error> {
                events.send("tick").await?;
                events.send("tock").await
            }
        }

        let app = dispatcher(false, GuardChain::new(), |b| {
            let d = DescriptorBuilder::new("/clock", b.engine())
                .stream(Arc::new(Ticks))
                .template::<Value>("clock page")
                .build()
                .unwrap();
            b.root().mount_descriptor("/clock", d).unwrap();
        });

        let request = Request::get("/clock")
            .header("accept", "text/event-stream")
            .body(Bytes::new())
            .unwrap();
        let response = app.handle(request).await;
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(body_of(response).await, "data: tick\n\ndata: tock\n\n");

        // Without negotiation the same node renders.
        assert_eq!(body_of(app.handle(get("/clock")).await).await, "clock page");
    }

    #[tokio::test]
    async fn test_stream_only_node_advertises_get() {
        struct Silent;

        #[async_trait]
        impl StreamSource for Silent {
            async fn stream(&self, _events: EventSender, _ctx: &RequestContext) -> Result<(), Error> {
                Ok(())
            }
        }

        let app = dispatcher(false, GuardChain::new(), |b| {
            let d = DescriptorBuilder::new("/feed", b.engine())
                .stream(Arc::new(Silent))
                .build()
                .unwrap();
            b.root().mount_descriptor("/feed", d).unwrap();
        });

        for request in [get("/feed"), Request::head("/feed").body(Bytes::new()).unwrap()] {
            let response = app.handle(request).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(response.headers()["allow"], "GET");
        }
    }
}
