//! Handler tree.
//!
//! Nodes live in an arena indexed by [`NodeId`]; a child refers to its parent
//! by index, so the tree has no reference cycles and nodes are never
//! reparented. The tree is assembled through [`TreeBuilder`] and
//! [`SubRouter`], then sealed into an immutable [`HandlerTree`] that any number
//! of requests can read concurrently.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::controller::{bind, Controller, ControllerDescriptor};
use crate::error::BindError;
use crate::serve::router::{specificity, Pattern};
use crate::template::TemplateEngine;

pub type NodeId = usize;

/// The implicit root every top-level route hangs from.
pub const ROOT: NodeId = 0;

#[derive(Debug)]
pub struct HandlerNode {
    pub(crate) pattern: Pattern,
    local: Pattern,
    pub(crate) descriptor: ControllerDescriptor,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    depth: usize,
}

impl HandlerNode {
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn descriptor(&self) -> &ControllerDescriptor {
        &self.descriptor
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// A node answers requests when it has any request-serving role.
    fn is_endpoint(&self) -> bool {
        let d = &self.descriptor;
        d.handler.is_some() || d.has_render_path() || d.action.is_some() || !d.streams.is_empty()
    }
}

/// Mutable tree under construction.
#[derive(Debug)]
pub struct TreeBuilder {
    nodes: Vec<HandlerNode>,
    engine: TemplateEngine,
}

impl TreeBuilder {
    pub fn new(engine: TemplateEngine) -> Self {
        Self {
            nodes: vec![HandlerNode {
                pattern: Pattern::root(),
                local: Pattern::root(),
                descriptor: ControllerDescriptor::default(),
                parent: None,
                children: Vec::new(),
                depth: 0,
            }],
            engine,
        }
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    /// Router for top-level routes.
    pub fn root(&mut self) -> SubRouter<'_> {
        SubRouter {
            builder: self,
            parent: ROOT,
        }
    }

    /// Router for children of an already mounted node.
    pub fn at(&mut self, node: NodeId) -> SubRouter<'_> {
        SubRouter {
            builder: self,
            parent: node,
        }
    }

    fn insert(
        &mut self,
        parent: NodeId,
        raw: &str,
        bind_node: impl FnOnce(&str, &TemplateEngine) -> Result<ControllerDescriptor, BindError>,
    ) -> Result<NodeId, BindError> {
        let local = Pattern::parse(raw)?;
        let pattern = self.nodes[parent].pattern.join(&local)?;

        let duplicate = self.nodes[parent]
            .children
            .iter()
            .any(|&c| self.nodes[c].local == local);
        if duplicate {
            return Err(BindError::DuplicateRoute {
                pattern: pattern.to_string(),
            });
        }

        let descriptor = bind_node(&pattern.to_string(), &self.engine)?;
        let router = descriptor.router.clone();

        let id = self.nodes.len();
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(HandlerNode {
            pattern,
            local,
            descriptor,
            parent: Some(parent),
            children: Vec::new(),
            depth,
        });
        self.nodes[parent].children.push(id);

        if let Some(router) = router {
            let mut sub = SubRouter {
                builder: self,
                parent: id,
            };
            router.routes(&mut sub)?;
        }

        Ok(id)
    }

    /// Freeze the tree and precompute routing order.
    pub fn seal(self, dev_mode: bool) -> HandlerTree {
        let mut routes: Vec<NodeId> = (0..self.nodes.len())
            .filter(|&id| self.nodes[id].is_endpoint())
            .collect();
        routes.sort_by(|&a, &b| {
            let (na, nb) = (&self.nodes[a], &self.nodes[b]);
            match specificity((&na.pattern, na.depth), (&nb.pattern, nb.depth)) {
                Ordering::Equal => a.cmp(&b),
                other => other,
            }
        });

        let tree = HandlerTree {
            nodes: self.nodes,
            routes,
        };
        if dev_mode {
            for (child, parent) in tree.orphaned_outlets() {
                tracing::warn!(
                    event = "orphaned_outlet",
                    child = %tree.nodes[child].pattern,
                    parent = %tree.nodes[parent].pattern,
                    "parent renderer has no outlet; child output will not be composed"
                );
            }
        }
        tree
    }
}

/// Registration handle scoped to one node.
pub struct SubRouter<'a> {
    builder: &'a mut TreeBuilder,
    parent: NodeId,
}

impl SubRouter<'_> {
    /// Bind `controller` and mount it under this node.
    pub fn mount<C: Controller>(&mut self, pattern: &str, controller: C) -> Result<NodeId, BindError> {
        self.mount_shared(pattern, Arc::new(controller))
    }

    pub fn mount_shared<C: Controller>(
        &mut self,
        pattern: &str,
        controller: Arc<C>,
    ) -> Result<NodeId, BindError> {
        self.builder
            .insert(self.parent, pattern, |full, engine| bind(full, controller, engine))
    }

    /// Mount a descriptor assembled with [`DescriptorBuilder`](crate::controller::DescriptorBuilder).
    pub fn mount_descriptor(
        &mut self,
        pattern: &str,
        descriptor: ControllerDescriptor,
    ) -> Result<NodeId, BindError> {
        self.builder.insert(self.parent, pattern, |_, _| Ok(descriptor))
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.builder.engine
    }

    pub fn node(&self) -> NodeId {
        self.parent
    }

    pub fn pattern(&self) -> String {
        self.builder.nodes[self.parent].pattern.to_string()
    }
}

/// Sealed, read-only handler tree.
#[derive(Debug)]
pub struct HandlerTree {
    nodes: Vec<HandlerNode>,
    routes: Vec<NodeId>,
}

/// A matched route: the chain from the root's first child to the leaf, and
/// the captured path parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub chain: Vec<NodeId>,
    pub params: HashMap<String, String>,
}

impl RouteMatch {
    pub fn leaf(&self) -> NodeId {
        self.chain.last().copied().unwrap_or(ROOT)
    }
}

impl HandlerTree {
    pub fn node(&self, id: NodeId) -> &HandlerNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most specific endpoint for `path`.
    pub fn find(&self, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|&id| {
            self.nodes[id].pattern.matches(path).map(|params| RouteMatch {
                chain: self.chain(id),
                params,
            })
        })
    }

    /// Nodes from the top-level ancestor down to `leaf`.
    pub fn chain(&self, leaf: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = Some(leaf);
        while let Some(id) = current {
            if id == ROOT {
                break;
            }
            chain.push(id);
            current = self.nodes[id].parent;
        }
        chain.reverse();
        chain
    }

    /// `(child, parent)` pairs where the child renders but the parent's
    /// renderer has nowhere to put it.
    pub fn orphaned_outlets(&self) -> Vec<(NodeId, NodeId)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.descriptor.renderer.is_some())
            .filter_map(|(id, node)| {
                let parent = node.parent?;
                let pd = &self.nodes[parent].descriptor;
                (pd.renderer.is_some() && !pd.outlet().present).then_some((id, parent))
            })
            .collect()
    }
}
