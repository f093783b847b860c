//! Arbor: a controller-tree request framework.
//!
//! Controllers opt into roles (loader, action, renderer, stream source,
//! error and panic boundaries, router, plugins) and are bound once into a
//! handler tree. A request matched to a leaf is rendered leaf first, then
//! spliced outward into the `outlet` of each template-rendering ancestor.
//!
//! # Modules
//!
//! - [`controller`]: role traits and the capability binder
//! - [`template`]: the template engine and static outlet analysis
//! - [`serve`]: tree, dispatcher, streaming adapters and the hyper host
//! - [`error`]: binding, lifecycle and host errors
//! - [`logging`]: subscriber set-up for lifecycle events

// Allow some clippy lints that are stylistic and not critical
#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod controller;
pub mod error;
pub mod logging;
pub mod serve;
pub mod template;

pub use controller::{
    handler_fn, redirect, Action, Controller, ControllerDescriptor, DescriptorBuilder,
    ErrorBoundary, Guard, Handler, Loader, PanicBoundary, Plugin, PluginProvider, PluginScope,
    Recovery, Renderer, Roles, RouterProvider, StreamSource, ViewModel,
};
pub use error::{BindError, Error, ServeError, TemplateError};
pub use serve::{
    serve, serve_until, App, AppBuilder, Event, EventSender, RequestContext, ResponseWriter,
    ServerConfig, SubRouter,
};
