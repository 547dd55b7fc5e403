//! Hierarchical component tree.
//!
//! Model parts implement [`Component`] and live in a [`ComponentTree`]
//! arena. Each node owns its children (insertion-ordered) and keeps a
//! non-owning parent id. Nodes are only ever attached below an existing
//! parent, so the tree cannot contain cycles.
//!
//! # Lifecycle
//!
//! - `init` and `sim_start` run top-down (parent before children, siblings
//!   in insertion order) when a run starts.
//! - `sim_end` and `produce_results` run in the exact reverse of that order,
//!   so every child is finalized before its parent.
//!
//! Result keys are scoped by the component's hierarchical name
//! (`sim.shop.m1.utilization`), so equally named parts in different
//! branches never collide.

use std::any::Any;

use slotmap::SlotMap;

use crate::error::ModelResult;
use crate::id::ComponentId;
use crate::results::{ResultMap, ResultScope};
use crate::simulation::Simulation;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A model part attached to the simulation's component tree.
///
/// All hooks default to no-ops, so components only override what they use.
pub trait Component: Send + std::fmt::Debug {
    /// Called once before the first event is dispatched.
    fn init(&mut self, sim: &Simulation) -> ModelResult {
        let _ = sim;
        Ok(())
    }

    /// Called after every component has been initialized.
    fn sim_start(&mut self, sim: &Simulation) -> ModelResult {
        let _ = sim;
        Ok(())
    }

    /// Called after the event loop stopped.
    fn sim_end(&mut self, sim: &Simulation) -> ModelResult {
        let _ = sim;
        Ok(())
    }

    /// Write this component's results. Keys are prefixed with the
    /// component's hierarchical name.
    fn produce_results(&mut self, results: &mut ResultScope<'_>) {
        let _ = results;
    }

    /// Downcast to `&dyn Any` for typed access to concrete components.
    fn as_any(&self) -> &dyn Any;

    /// Downcast to `&mut dyn Any` for typed mutable access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A component without behavior, used to group children.
#[derive(Debug, Default, Clone)]
pub struct Group;

impl Component for Group {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ComponentError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("component not found: {0:?}")]
    NotFound(ComponentId),
    #[error("component '{parent}' already has a child named '{name}'")]
    DuplicateName { parent: String, name: String },
    #[error("invalid component name '{0}': must be non-empty and contain no '.'")]
    InvalidName(String),
}

// ---------------------------------------------------------------------------
// ComponentTree
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ComponentNode {
    name: String,
    parent: Option<ComponentId>,
    children: Vec<ComponentId>,
    /// `None` while the component is detached to run one of its hooks.
    component: Option<Box<dyn Component>>,
}

/// Arena of components rooted at a single [`Group`].
#[derive(Debug)]
pub struct ComponentTree {
    nodes: SlotMap<ComponentId, ComponentNode>,
    root: ComponentId,
}

impl ComponentTree {
    /// Create a tree holding only the root group.
    pub fn new(root_name: impl Into<String>) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(ComponentNode {
            name: root_name.into(),
            parent: None,
            children: Vec::new(),
            component: Some(Box::new(Group)),
        });
        Self { nodes, root }
    }

    /// The root node. It always exists.
    pub fn root(&self) -> ComponentId {
        self.root
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root is never removed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Attach a component below `parent`.
    pub fn add_child<C: Component + 'static>(
        &mut self,
        parent: ComponentId,
        name: impl Into<String>,
        component: C,
    ) -> Result<ComponentId, ComponentError> {
        self.add_boxed(parent, name, Box::new(component))
    }

    /// Attach an already boxed component. Fails on an unknown parent, a
    /// name containing '.', or a duplicate sibling name.
    pub fn add_boxed(
        &mut self,
        parent: ComponentId,
        name: impl Into<String>,
        component: Box<dyn Component>,
    ) -> Result<ComponentId, ComponentError> {
        let name = name.into();
        if name.is_empty() || name.contains('.') {
            return Err(ComponentError::InvalidName(name));
        }
        let parent_node = self
            .nodes
            .get(parent)
            .ok_or(ComponentError::NotFound(parent))?;
        if self.component_by_name(parent, &name).is_some() {
            return Err(ComponentError::DuplicateName {
                parent: parent_node.name.clone(),
                name,
            });
        }

        let id = self.nodes.insert(ComponentNode {
            name,
            parent: Some(parent),
            children: Vec::new(),
            component: Some(component),
        });
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// Local name of a node.
    pub fn name(&self, id: ComponentId) -> Option<&str> {
        self.nodes.get(id).map(|n| n.name.as_str())
    }

    /// Parent of a node; `None` for the root or an unknown id.
    pub fn parent(&self, id: ComponentId) -> Option<ComponentId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    /// Children in insertion order.
    pub fn children(&self, id: ComponentId) -> &[ComponentId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Direct child of `parent` with the given name.
    pub fn component_by_name(&self, parent: ComponentId, name: &str) -> Option<ComponentId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.nodes[c].name == name)
    }

    /// Resolve a dot-separated path starting with the root name, e.g.
    /// `sim.shop.m1`.
    pub fn component_by_hierarchical_name(&self, path: &str) -> Option<ComponentId> {
        let mut segments = path.split('.');
        if segments.next()? != self.nodes[self.root].name {
            return None;
        }
        segments.try_fold(self.root, |current, segment| {
            self.component_by_name(current, segment)
        })
    }

    /// Dot-separated path from the root to `id`.
    pub fn hierarchical_name(&self, id: ComponentId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let node = self.nodes.get(c)?;
            names.push(node.name.as_str());
            current = node.parent;
        }
        names.reverse();
        Some(names.join("."))
    }

    /// Typed access to a component.
    pub fn get<T: Component + 'static>(&self, id: ComponentId) -> Option<&T> {
        self.nodes
            .get(id)
            .and_then(|n| n.component.as_deref())
            .and_then(|c| c.as_any().downcast_ref::<T>())
    }

    /// Typed mutable access to a component.
    pub fn get_mut<T: Component + 'static>(&mut self, id: ComponentId) -> Option<&mut T> {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.component.as_deref_mut())
            .and_then(|c| c.as_any_mut().downcast_mut::<T>())
    }

    /// Pre-order traversal: parents before children, siblings in insertion
    /// order.
    pub fn top_down(&self) -> Vec<ComponentId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        order
    }

    /// Reverse of [`top_down`](Self::top_down): every child before its parent.
    pub fn bottom_up(&self) -> Vec<ComponentId> {
        let mut order = self.top_down();
        order.reverse();
        order
    }

    /// Detach a component so a hook can run without the tree borrowed.
    pub(crate) fn take(&mut self, id: ComponentId) -> Option<Box<dyn Component>> {
        self.nodes.get_mut(id).and_then(|n| n.component.take())
    }

    pub(crate) fn restore(&mut self, id: ComponentId, component: Box<dyn Component>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.component = Some(component);
        }
    }

    /// Collect results bottom-up into `results`.
    pub(crate) fn produce_results(&mut self, results: &mut ResultMap) {
        for id in self.bottom_up() {
            let Some(prefix) = self.hierarchical_name(id) else {
                continue;
            };
            if let Some(component) = self.nodes.get_mut(id).and_then(|n| n.component.as_mut()) {
                let mut scope = ResultScope::new(&prefix, results);
                component.produce_results(&mut scope);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
