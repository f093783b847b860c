//! Controller contract.
//!
//! A controller is an ordinary value that opts into any subset of the
//! framework roles. Each role is its own trait; the [`Controller`] trait only
//! exposes accessors that hand the framework a role object when the
//! controller implements it. Binding (see [`binder`]) resolves those accessors
//! once into a [`ControllerDescriptor`], so requests never probe a controller
//! for capabilities again.
//!
//! ```ignore
//! struct Greeting;
//!
//! #[derive(Serialize)]
//! struct GreetingModel { name: String }
//!
//! impl ViewModel for GreetingModel {
//!     fn template() -> Option<&'static str> {
//!         Some("<p>Hello <%= name %></p>")
//!     }
//! }
//!
//! #[async_trait]
//! impl Loader<GreetingModel> for Greeting {
//!     async fn load(&self, ctx: &RequestContext) -> Result<GreetingModel, Error> {
//!         Ok(GreetingModel { name: ctx.param("name").unwrap_or("world").into() })
//!     }
//! }
//!
//! impl Controller for Greeting {
//!     type ViewModel = GreetingModel;
//!     fn loader(self: &Arc<Self>) -> Option<Arc<dyn Loader<GreetingModel>>> {
//!         Some(self.clone())
//!     }
//! }
//! ```

pub mod binder;
pub mod descriptor;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{BindError, Error};
use crate::serve::request::RequestContext;
use crate::serve::response::ResponseWriter;
use crate::serve::sse::EventSender;
use crate::serve::tree::SubRouter;

pub use binder::{bind, DescriptorBuilder};
pub use descriptor::{ControllerDescriptor, Roles};

/// Per-request value passed from a [`Loader`] to a [`Renderer`].
pub trait ViewModel: Serialize + Send + Sync + 'static {
    /// Template source used when the controller has no custom renderer.
    fn template() -> Option<&'static str> {
        None
    }
}

impl ViewModel for () {}

impl ViewModel for serde_json::Value {}

/// Low-level handler that owns the whole response.
///
/// Used both as a node role and as the diversion target returned by guards
/// and boundaries.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, out: &mut ResponseWriter, ctx: &RequestContext) -> Result<(), Error>;
}

#[async_trait]
pub trait Loader<VM: ViewModel>: Send + Sync + 'static {
    async fn load(&self, ctx: &RequestContext) -> Result<VM, Error>;
}

/// Handles write methods. No render step follows an action.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    async fn act(&self, out: &mut ResponseWriter, ctx: &RequestContext) -> Result<(), Error>;
}

#[async_trait]
pub trait Renderer<VM: ViewModel>: Send + Sync + 'static {
    async fn render(
        &self,
        out: &mut ResponseWriter,
        ctx: &RequestContext,
        model: &VM,
    ) -> Result<(), Error>;
}

/// Produces server-push events. The stream ends when `stream` returns.
#[async_trait]
pub trait StreamSource: Send + Sync + 'static {
    async fn stream(&self, events: EventSender, ctx: &RequestContext) -> Result<(), Error>;
}

/// Outcome of a recovery boundary.
pub enum Recovery {
    /// The boundary wrote the response itself.
    Handled,
    /// Hand the response over to another handler.
    Divert(Arc<dyn Handler>),
    /// Pass the error on to the next recovery tier.
    Escalate(Error),
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recovery::Handled => f.write_str("Handled"),
            Recovery::Divert(_) => f.write_str("Divert(..)"),
            Recovery::Escalate(e) => f.debug_tuple("Escalate").field(e).finish(),
        }
    }
}

#[async_trait]
pub trait ErrorBoundary: Send + Sync + 'static {
    async fn on_error(&self, out: &mut ResponseWriter, ctx: &RequestContext, error: Error)
        -> Recovery;
}

#[async_trait]
pub trait PanicBoundary: Send + Sync + 'static {
    async fn on_panic(&self, out: &mut ResponseWriter, ctx: &RequestContext, error: Error)
        -> Recovery;
}

/// Registers child routes while the tree is being assembled.
pub trait RouterProvider: Send + Sync + 'static {
    fn routes(&self, router: &mut SubRouter<'_>) -> Result<(), BindError>;
}

/// Pre-dispatch check. Returning a handler diverts the request to it.
#[async_trait]
pub trait Guard: Send + Sync + 'static {
    async fn check(&self, ctx: &RequestContext) -> Option<Arc<dyn Handler>>;

    /// Reported in the `guard_diverted` event.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Bind-time extension of a node.
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn install(&self, scope: &mut PluginScope<'_>);
}

pub trait PluginProvider: Send + Sync + 'static {
    fn plugins(&self) -> Vec<Arc<dyn Plugin>>;
}

/// What a plugin may touch while it is installed on a node.
pub struct PluginScope<'a> {
    pattern: &'a str,
    guards: &'a mut Vec<Arc<dyn Guard>>,
}

impl<'a> PluginScope<'a> {
    pub(crate) fn new(pattern: &'a str, guards: &'a mut Vec<Arc<dyn Guard>>) -> Self {
        Self { pattern, guards }
    }

    pub fn pattern(&self) -> &str {
        self.pattern
    }

    pub fn add_guard(&mut self, guard: Arc<dyn Guard>) {
        self.guards.push(guard);
    }
}

/// A user value bound into the handler tree.
///
/// Every accessor defaults to "role not implemented". Override the ones the
/// controller fulfils, usually with `Some(self.clone())`.
pub trait Controller: Send + Sync + 'static {
    type ViewModel: ViewModel;

    fn handler(self: &Arc<Self>) -> Option<Arc<dyn Handler>> {
        None
    }

    fn loader(self: &Arc<Self>) -> Option<Arc<dyn Loader<Self::ViewModel>>> {
        None
    }

    fn action(self: &Arc<Self>) -> Option<Arc<dyn Action>> {
        None
    }

    fn renderer(self: &Arc<Self>) -> Option<Arc<dyn Renderer<Self::ViewModel>>> {
        None
    }

    fn stream_source(self: &Arc<Self>) -> Option<Arc<dyn StreamSource>> {
        None
    }

    /// Additional sources multiplexed onto the same event stream.
    fn named_streams(self: &Arc<Self>) -> Vec<(String, Arc<dyn StreamSource>)> {
        Vec::new()
    }

    fn error_boundary(self: &Arc<Self>) -> Option<Arc<dyn ErrorBoundary>> {
        None
    }

    fn panic_boundary(self: &Arc<Self>) -> Option<Arc<dyn PanicBoundary>> {
        None
    }

    fn router(self: &Arc<Self>) -> Option<Arc<dyn RouterProvider>> {
        None
    }

    fn plugin_provider(self: &Arc<Self>) -> Option<Arc<dyn PluginProvider>> {
        None
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut ResponseWriter, &RequestContext) -> Result<(), Error> + Send + Sync + 'static,
{
    async fn handle(&self, out: &mut ResponseWriter, ctx: &RequestContext) -> Result<(), Error> {
        (self.0)(out, ctx)
    }
}

/// Wrap a synchronous closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&mut ResponseWriter, &RequestContext) -> Result<(), Error> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// A handler that redirects to `location`.
pub fn redirect(location: impl Into<String>) -> Arc<dyn Handler> {
    let location = location.into();
    handler_fn(move |out, _| {
        out.redirect(&location);
        Ok(())
    })
}
