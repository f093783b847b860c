//! Bound descriptors: the resolved, type-erased role set of one controller.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use serde_json::Value;

use crate::controller::{
    Action, ErrorBoundary, Guard, Handler, Loader, PanicBoundary, Renderer, RouterProvider,
    StreamSource, ViewModel,
};
use crate::error::Error;
use crate::serve::request::RequestContext;
use crate::serve::response::ResponseWriter;
use crate::template::{OutletMarker, Template};

bitflags! {
    /// The roles a controller fulfils.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Roles: u16 {
        const HANDLER = 1 << 0;
        const LOADER = 1 << 1;
        const ACTION = 1 << 2;
        const RENDERER = 1 << 3;
        const STREAM = 1 << 4;
        const ERROR_BOUNDARY = 1 << 5;
        const PANIC_BOUNDARY = 1 << 6;
        const ROUTER = 1 << 7;
        const PLUGIN = 1 << 8;

        /// Roles that cannot share a node with a raw handler.
        const HIGH_LEVEL = Self::LOADER.bits()
            | Self::ACTION.bits()
            | Self::RENDERER.bits()
            | Self::ROUTER.bits();
    }
}

impl Default for Roles {
    fn default() -> Self {
        Roles::empty()
    }
}

/// A view model with its concrete type erased.
pub(crate) trait ErasedViewModel: Send + Sync {
    fn to_json(&self) -> Result<Value, Error>;
    fn as_any(&self) -> &dyn Any;
}

impl<VM: ViewModel> ErasedViewModel for VM {
    fn to_json(&self) -> Result<Value, Error> {
        Ok(serde_json::to_value(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) type Model = Box<dyn ErasedViewModel>;

/// The concrete type flowing through a typed role.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ModelType {
    pub id: TypeId,
    pub name: &'static str,
}

impl ModelType {
    pub fn of<VM: 'static>() -> Self {
        Self {
            id: TypeId::of::<VM>(),
            name: std::any::type_name::<VM>(),
        }
    }
}

#[async_trait]
pub(crate) trait ErasedLoader: Send + Sync {
    async fn load(&self, ctx: &RequestContext) -> Result<Model, Error>;
}

pub(crate) struct LoaderAdapter<VM: ViewModel>(pub Arc<dyn Loader<VM>>);

#[async_trait]
impl<VM: ViewModel> ErasedLoader for LoaderAdapter<VM> {
    async fn load(&self, ctx: &RequestContext) -> Result<Model, Error> {
        let model = self.0.load(ctx).await?;
        Ok(Box::new(model))
    }
}

#[async_trait]
pub(crate) trait ErasedRenderer: Send + Sync {
    async fn render(
        &self,
        out: &mut ResponseWriter,
        ctx: &RequestContext,
        model: &dyn ErasedViewModel,
    ) -> Result<(), Error>;
}

pub(crate) struct RendererAdapter<VM: ViewModel>(pub Arc<dyn Renderer<VM>>);

#[async_trait]
impl<VM: ViewModel> ErasedRenderer for RendererAdapter<VM> {
    async fn render(
        &self,
        out: &mut ResponseWriter,
        ctx: &RequestContext,
        model: &dyn ErasedViewModel,
    ) -> Result<(), Error> {
        let model = model.as_any().downcast_ref::<VM>().ok_or_else(|| {
            Error::internal(format!(
                "renderer expected view model {}",
                std::any::type_name::<VM>()
            ))
        })?;
        self.0.render(out, ctx, model).await
    }
}

/// How a node renders.
#[derive(Clone)]
pub(crate) enum BoundRenderer {
    /// Synthesized from the view model's template.
    Template(Arc<Template>),
    Custom(Arc<dyn ErasedRenderer>),
}

/// The resolved roles of one controller. Immutable once built.
#[derive(Clone, Default)]
pub struct ControllerDescriptor {
    pub(crate) roles: Roles,
    pub(crate) model: Option<ModelType>,
    pub(crate) handler: Option<Arc<dyn Handler>>,
    pub(crate) loader: Option<Arc<dyn ErasedLoader>>,
    pub(crate) action: Option<Arc<dyn Action>>,
    pub(crate) renderer: Option<BoundRenderer>,
    pub(crate) streams: Vec<(Option<String>, Arc<dyn StreamSource>)>,
    pub(crate) error_boundary: Option<Arc<dyn ErrorBoundary>>,
    pub(crate) panic_boundary: Option<Arc<dyn PanicBoundary>>,
    pub(crate) router: Option<Arc<dyn RouterProvider>>,
    pub(crate) guards: Vec<Arc<dyn Guard>>,
}

impl ControllerDescriptor {
    pub fn roles(&self) -> Roles {
        self.roles
    }

    /// Outlet of the node's template; absent for custom and missing renderers.
    pub fn outlet(&self) -> OutletMarker {
        match &self.renderer {
            Some(BoundRenderer::Template(t)) => t.outlet(),
            _ => OutletMarker::ABSENT,
        }
    }

    pub fn view_model(&self) -> Option<&'static str> {
        self.model.map(|m| m.name)
    }

    pub(crate) fn has_render_path(&self) -> bool {
        self.loader.is_some() || self.renderer.is_some()
    }
}

impl fmt::Debug for ControllerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("roles", &self.roles)
            .field("view_model", &self.view_model())
            .field("outlet", &self.outlet())
            .field("streams", &self.streams.len())
            .field("guards", &self.guards.len())
            .finish()
    }
}
