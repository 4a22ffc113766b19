//! Component tree and patch model
//!
//! The server owns application state; the client holds a `Component` tree and
//! mutates it only through addressed `Action`s. Children live behind `Arc` so
//! applying a patch clones just the path from the root to each touched node.

mod action;
mod patch;

pub use action::{Action, ActionsResponse, ResponseItem, Target};
pub use patch::{apply_action, apply_actions, get_element_at_address, get_node_at_address};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::PatchError;

/// Open-ended component props, kept in insertion order.
pub type Props = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Path of child indices from a tree (or fragment) root.
///
/// The last element is the position an action operates on; the preceding
/// elements descend through `children`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Vec<usize>);

impl Address {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// `self` followed by `suffix`.
    pub fn join(&self, suffix: &Address) -> Address {
        let mut segments = Vec::with_capacity(self.0.len() + suffix.0.len());
        segments.extend_from_slice(&self.0);
        segments.extend_from_slice(&suffix.0);
        Address(segments)
    }

    /// The address without its first `n` segments.
    pub fn skip(&self, n: usize) -> Address {
        Address(self.0.iter().skip(n).copied().collect())
    }

    pub fn push(&mut self, index: usize) {
        self.0.push(index);
    }

    pub fn into_inner(self) -> Vec<usize> {
        self.0
    }
}

impl Deref for Address {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for Address {
    fn from(segments: Vec<usize>) -> Self {
        Address(segments)
    }
}

impl From<&[usize]> for Address {
    fn from(segments: &[usize]) -> Self {
        Address(segments.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Address {
    fn from(segments: [usize; N]) -> Self {
        Address(segments.to_vec())
    }
}

impl FromIterator<usize> for Address {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Address(iter.into_iter().collect())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

fn is_false(value: &bool) -> bool {
    !*value
}

/// One node of the server-driven UI tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Session-unique identity.
    pub key: String,
    /// Node kind, resolved to a renderable by the rendering layer.
    pub name: String,
    #[serde(default)]
    pub props: Props,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Arc<Component>>>,
    /// Informational path from the root, as sent by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    /// Content is outdated and waiting for a fresher patch.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stale: bool,
    /// Rendered without a presentational wrapper.
    #[serde(default, rename = "virtual", skip_serializing_if = "is_false")]
    pub is_virtual: bool,
}

impl Component {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            props: Props::new(),
            children: None,
            address: None,
            stale: false,
            is_virtual: false,
        }
    }

    /// Empty root node used when a session starts without a bootstrap tree.
    pub fn root() -> Self {
        Self {
            children: Some(Vec::new()),
            ..Self::new("root", "root")
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    pub fn with_child(mut self, child: Component) -> Self {
        self.children
            .get_or_insert_with(Vec::new)
            .push(Arc::new(child));
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Component>) -> Self {
        self.children
            .get_or_insert_with(Vec::new)
            .extend(children.into_iter().map(Arc::new));
        self
    }

    pub fn with_stale(mut self, stale: bool) -> Self {
        self.stale = stale;
        self
    }

    /// Children in order; empty when none were ever created.
    pub fn children(&self) -> &[Arc<Component>] {
        self.children.as_deref().unwrap_or(&[])
    }

    pub fn child(&self, index: usize) -> Option<&Component> {
        self.children().get(index).map(Arc::as_ref)
    }

    pub fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }

    /// Keys of the direct children, in order.
    pub fn child_keys(&self) -> Vec<&str> {
        self.children().iter().map(|c| c.key.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// Authoritative tree of a session, with a change counter.
///
/// Snapshots handed out by [`Tree::snapshot`] share structure with the live
/// tree; a successful non-empty [`Tree::apply`] installs a new root and bumps
/// [`Tree::version`], so observers can detect change by pointer or version.
#[derive(Debug, Clone)]
pub struct Tree {
    root: Arc<Component>,
    version: u64,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new(Component::root())
    }
}

impl Tree {
    pub fn new(root: Component) -> Self {
        Self {
            root: Arc::new(root),
            version: 0,
        }
    }

    pub fn root(&self) -> &Component {
        &self.root
    }

    pub fn snapshot(&self) -> Arc<Component> {
        Arc::clone(&self.root)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply `actions` atomically.
    ///
    /// Either every action applies and the new root is installed, or the
    /// first failure is returned and the tree is left untouched. Returns
    /// `false` for an empty batch.
    pub fn apply(&mut self, actions: &[Action]) -> Result<bool, PatchError> {
        if actions.is_empty() {
            return Ok(false);
        }
        let mut working = Arc::clone(&self.root);
        apply_actions(&mut working, actions)?;
        // Force a fresh root identity even when nothing else held the old one.
        if Arc::ptr_eq(&working, &self.root) {
            working = Arc::new(Component::clone(&working));
        }
        self.root = working;
        self.version += 1;
        Ok(true)
    }

    pub fn get(&self, address: &Address) -> Result<&Component, PatchError> {
        get_element_at_address(&self.root, address)
    }

    pub fn get_shared(&self, address: &Address) -> Result<Arc<Component>, PatchError> {
        get_node_at_address(&self.root, address).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_component_deserializes_wire_shape() {
        let c: Component = serde_json::from_value(json!({
            "key": "a",
            "name": "text",
            "props": {"body": "hello", "level": 2},
            "virtual": true
        }))
        .unwrap();
        assert_eq!(c.key, "a");
        assert_eq!(c.props["body"], "hello");
        assert!(c.is_virtual);
        assert!(!c.stale);
        assert!(c.children.is_none());
    }

    #[test]
    fn test_component_serialization_omits_defaults() {
        let c = Component::new("a", "text");
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value, json!({"key": "a", "name": "text", "props": {}}));
    }

    #[test]
    fn test_props_keep_insertion_order() {
        let c = Component::new("a", "text")
            .with_prop("zeta", 1)
            .with_prop("alpha", 2);
        let keys: Vec<_> = c.props.keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_address_join_and_skip() {
        let base = Address::from([2, 3]);
        assert_eq!(base.join(&Address::from([0])), Address::from([2, 3, 0]));
        assert_eq!(Address::from([0, 1, 4]).skip(1), Address::from([1, 4]));
        assert_eq!(base.to_string(), "[2, 3]");
    }

    #[test]
    fn test_tree_apply_bumps_version_and_identity() {
        let mut tree = Tree::default();
        let before = tree.snapshot();
        let changed = tree
            .apply(&[Action::add([0], Component::new("a", "text"))])
            .unwrap();
        assert!(changed);
        assert_eq!(tree.version(), 1);
        assert!(!Arc::ptr_eq(&before, &tree.snapshot()));
        assert!(before.children().is_empty());
    }

    #[test]
    fn test_tree_apply_identity_changes_without_outstanding_snapshot() {
        let mut tree = Tree::default();
        // A weak handle keeps the old allocation alive so its address is not reused.
        let before = Arc::downgrade(&tree.root);
        tree.apply(&[Action::no_change(Address::new())]).unwrap();
        assert_ne!(before.as_ptr(), Arc::as_ptr(&tree.root));
        assert_eq!(tree.version(), 1);
    }

    #[test]
    fn test_tree_apply_empty_batch_is_noop() {
        let mut tree = Tree::default();
        assert!(!tree.apply(&[]).unwrap());
        assert_eq!(tree.version(), 0);
    }

    #[test]
    fn test_tree_apply_failure_leaves_tree_untouched() {
        let mut tree = Tree::default();
        let err = tree
            .apply(&[
                Action::add([0], Component::new("a", "text")),
                Action::remove([5]),
            ])
            .unwrap_err();
        assert!(matches!(err, PatchError::IndexOutOfBounds { index: 5, .. }));
        assert!(tree.root().children().is_empty());
        assert_eq!(tree.version(), 0);
    }

    #[test]
    fn test_unchanged_siblings_are_shared_after_patch() {
        let mut tree = Tree::new(
            Component::root()
                .with_child(Component::new("a", "text"))
                .with_child(Component::new("b", "text")),
        );
        let before = tree.snapshot();
        tree.apply(&[Action::update([0], Props::new())]).unwrap();
        let after = tree.snapshot();
        assert!(Arc::ptr_eq(&before.children()[1], &after.children()[1]));
        assert!(!Arc::ptr_eq(&before.children()[0], &after.children()[0]));
    }
}
