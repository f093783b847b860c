//! Capability binder.
//!
//! Turns a controller into a [`ControllerDescriptor`] once, at tree assembly.
//! [`bind`] walks the [`Controller`] accessors; [`DescriptorBuilder`] is the
//! lower-level API it feeds and can also be used directly to assemble a node
//! from separate role objects.

use std::sync::Arc;

use crate::controller::descriptor::{
    BoundRenderer, ControllerDescriptor, LoaderAdapter, ModelType, RendererAdapter, Roles,
};
use crate::controller::{
    Action, Controller, ErrorBoundary, Handler, Loader, PanicBoundary, Plugin, PluginScope,
    Renderer, RouterProvider, StreamSource, ViewModel,
};
use crate::error::BindError;
use crate::template::TemplateEngine;

/// Resolve every role `controller` fulfils.
///
/// A custom renderer takes precedence over the view model's template.
pub fn bind<C: Controller>(
    pattern: &str,
    controller: Arc<C>,
    engine: &TemplateEngine,
) -> Result<ControllerDescriptor, BindError> {
    let mut builder = DescriptorBuilder::new(pattern, engine);

    if let Some(handler) = controller.handler() {
        builder = builder.handler(handler);
    }
    if let Some(loader) = controller.loader() {
        builder = builder.loader(loader);
    }
    if let Some(action) = controller.action() {
        builder = builder.action(action);
    }
    match controller.renderer() {
        Some(renderer) => builder = builder.renderer(renderer),
        // A raw handler owns its output, so no template is synthesized for it.
        None if !builder.has(Roles::HANDLER) => {
            if let Some(source) = C::ViewModel::template() {
                builder = builder.template::<C::ViewModel>(source);
            }
        }
        None => {}
    }
    if let Some(source) = controller.stream_source() {
        builder = builder.stream(source);
    }
    for (name, source) in controller.named_streams() {
        builder = builder.named_stream(name, source);
    }
    if let Some(boundary) = controller.error_boundary() {
        builder = builder.error_boundary(boundary);
    }
    if let Some(boundary) = controller.panic_boundary() {
        builder = builder.panic_boundary(boundary);
    }
    if let Some(router) = controller.router() {
        builder = builder.router(router);
    }
    if let Some(provider) = controller.plugin_provider() {
        for plugin in provider.plugins() {
            builder = builder.plugin(plugin);
        }
    }

    builder.build()
}

/// Incrementally records roles, then validates them in [`build`](Self::build).
///
/// The first failure is kept and reported by `build`.
pub struct DescriptorBuilder<'e> {
    pattern: String,
    engine: &'e TemplateEngine,
    descriptor: ControllerDescriptor,
    /// View model expected by the renderer, with the role that declared it.
    render_model: Option<(&'static str, ModelType)>,
    custom_renderer: bool,
    plugins: Vec<Arc<dyn Plugin>>,
    error: Option<BindError>,
}

impl<'e> DescriptorBuilder<'e> {
    pub fn new(pattern: &str, engine: &'e TemplateEngine) -> Self {
        Self {
            pattern: pattern.to_string(),
            engine,
            descriptor: ControllerDescriptor::default(),
            render_model: None,
            custom_renderer: false,
            plugins: Vec::new(),
            error: None,
        }
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.descriptor.roles |= Roles::HANDLER;
        self.descriptor.handler = Some(handler);
        self
    }

    pub fn loader<VM: ViewModel>(mut self, loader: Arc<dyn Loader<VM>>) -> Self {
        self.descriptor.roles |= Roles::LOADER;
        self.descriptor.model = Some(ModelType::of::<VM>());
        self.descriptor.loader = Some(Arc::new(LoaderAdapter(loader)));
        self
    }

    pub fn action(mut self, action: Arc<dyn Action>) -> Self {
        self.descriptor.roles |= Roles::ACTION;
        self.descriptor.action = Some(action);
        self
    }

    pub fn renderer<VM: ViewModel>(mut self, renderer: Arc<dyn Renderer<VM>>) -> Self {
        self.descriptor.roles |= Roles::RENDERER;
        self.render_model = Some(("renderer", ModelType::of::<VM>()));
        self.custom_renderer = true;
        self.descriptor.renderer = Some(BoundRenderer::Custom(Arc::new(RendererAdapter(renderer))));
        self
    }

    /// Render with a compiled template fed by a `VM` loader.
    pub fn template<VM: ViewModel>(mut self, source: &str) -> Self {
        let name = std::any::type_name::<VM>();
        match self.engine.compile(name, source) {
            Ok(template) => {
                self.descriptor.roles |= Roles::RENDERER;
                self.render_model = Some(("template", ModelType::of::<VM>()));
                self.custom_renderer = false;
                self.descriptor.renderer = Some(BoundRenderer::Template(Arc::new(template)));
            }
            Err(e) => self.fail(BindError::from_template(name, e)),
        }
        self
    }

    pub fn stream(mut self, source: Arc<dyn StreamSource>) -> Self {
        self.descriptor.roles |= Roles::STREAM;
        self.descriptor.streams.push((None, source));
        self
    }

    pub fn named_stream(mut self, name: impl Into<String>, source: Arc<dyn StreamSource>) -> Self {
        self.descriptor.roles |= Roles::STREAM;
        self.descriptor.streams.push((Some(name.into()), source));
        self
    }

    pub fn error_boundary(mut self, boundary: Arc<dyn ErrorBoundary>) -> Self {
        self.descriptor.roles |= Roles::ERROR_BOUNDARY;
        self.descriptor.error_boundary = Some(boundary);
        self
    }

    pub fn panic_boundary(mut self, boundary: Arc<dyn PanicBoundary>) -> Self {
        self.descriptor.roles |= Roles::PANIC_BOUNDARY;
        self.descriptor.panic_boundary = Some(boundary);
        self
    }

    pub fn router(mut self, router: Arc<dyn RouterProvider>) -> Self {
        self.descriptor.roles |= Roles::ROUTER;
        self.descriptor.router = Some(router);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.descriptor.roles |= Roles::PLUGIN;
        self.plugins.push(plugin);
        self
    }

    pub fn has(&self, roles: Roles) -> bool {
        self.descriptor.roles.contains(roles)
    }

    fn fail(&mut self, error: BindError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn build(mut self) -> Result<ControllerDescriptor, BindError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let roles = self.descriptor.roles;
        if roles.contains(Roles::HANDLER) && roles.intersects(Roles::HIGH_LEVEL) {
            return Err(BindError::ExclusiveRoles {
                pattern: self.pattern,
                roles: roles & Roles::HIGH_LEVEL,
            });
        }

        match (self.render_model, self.descriptor.model) {
            (Some((role, expected)), Some(found)) if expected.id != found.id => {
                return Err(BindError::ViewModelMismatch {
                    role,
                    expected: expected.name,
                    found: found.name,
                });
            }
            (Some(_), None) if self.custom_renderer => {
                return Err(BindError::MissingLoader {
                    pattern: self.pattern,
                });
            }
            (Some((_, expected)), None) => self.descriptor.model = Some(expected),
            _ => {}
        }

        let mut guards = Vec::new();
        for plugin in &self.plugins {
            let mut scope = PluginScope::new(&self.pattern, &mut guards);
            plugin.install(&mut scope);
            tracing::debug!(plugin = plugin.name(), pattern = %self.pattern, "plugin installed");
        }
        self.descriptor.guards = guards;

        Ok(self.descriptor)
    }
}
