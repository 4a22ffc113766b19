//! Patch application
//!
//! Every function here works on `&mut Arc<Component>` and goes through
//! `Arc::make_mut`, so nodes shared with an outstanding snapshot are cloned
//! on the way down and untouched siblings stay shared.

use std::sync::Arc;

use tracing::trace;

use super::{Action, Address, Component};
use crate::error::PatchError;

/// Apply `actions` in order against `root`.
///
/// Stops at the first failing action; actions before it stay applied on
/// `root`. Use [`super::Tree::apply`] for all-or-nothing semantics.
pub fn apply_actions(root: &mut Arc<Component>, actions: &[Action]) -> Result<(), PatchError> {
    for action in actions {
        apply_action(root, action)?;
    }
    Ok(())
}

/// Apply a single action against `root`.
pub fn apply_action(root: &mut Arc<Component>, action: &Action) -> Result<(), PatchError> {
    let address = action.address();
    trace!(kind = action.kind(), %address, "applying action");

    match action {
        Action::Add { element, .. } => {
            let (index, path) = split_position(address, "add")?;
            let siblings = children_at_mut(root, path, address)?;
            if index > siblings.len() {
                return Err(out_of_bounds(address, index, siblings.len()));
            }
            siblings.insert(index, Arc::new(element.clone()));
        }
        Action::Remove { .. } => {
            let (index, path) = split_position(address, "remove")?;
            let siblings = children_at_mut(root, path, address)?;
            if index >= siblings.len() {
                return Err(out_of_bounds(address, index, siblings.len()));
            }
            siblings.remove(index);
        }
        Action::Set { element, .. } => match address.split_last() {
            None => {
                let replaced = replace_node(root, element);
                *root = Arc::new(replaced);
            }
            Some((&index, path)) => {
                let siblings = children_at_mut(root, path, address)?;
                let len = siblings.len();
                if index < len {
                    let replaced = replace_node(&siblings[index], element);
                    siblings[index] = Arc::new(replaced);
                } else if index == len {
                    let mut fresh = element.clone();
                    fresh.stale = false;
                    siblings.push(Arc::new(fresh));
                } else {
                    return Err(out_of_bounds(address, index, len));
                }
            }
        },
        Action::Update { props, .. } => {
            let node = node_at_mut(root, address)?;
            node.props = props.clone();
            node.stale = false;
        }
        Action::NoChange { .. } => {
            // Skip the clone-on-write when there is nothing to clear.
            if get_element_at_address(root, address)?.stale {
                node_at_mut(root, address)?.stale = false;
            }
        }
        Action::FreshBoundary { .. } => match address.split_last() {
            None => {
                let node = Arc::make_mut(root);
                if let Some(children) = node.children.as_mut() {
                    mark_stale_from(children, 0);
                }
            }
            Some((&index, path)) => {
                let siblings = children_at_mut(root, path, address)?;
                mark_stale_from(siblings, index + 1);
            }
        },
        // Sweeps the whole tree; the address is not consulted.
        Action::Last { .. } => {
            if has_stale_descendant(&**root) {
                sweep_stale(Arc::make_mut(root));
            }
        }
    }
    Ok(())
}

/// Resolve the node at `address`; an empty address is the root itself.
pub fn get_element_at_address<'a>(
    root: &'a Component,
    address: &Address,
) -> Result<&'a Component, PatchError> {
    let mut node = root;
    for &index in address.iter() {
        node = node
            .child(index)
            .ok_or_else(|| PatchError::NotFound {
                address: address.clone(),
            })?;
    }
    Ok(node)
}

/// Like [`get_element_at_address`] but yields the shared handle.
pub fn get_node_at_address<'a>(
    root: &'a Arc<Component>,
    address: &Address,
) -> Result<&'a Arc<Component>, PatchError> {
    let mut node = root;
    for &index in address.iter() {
        node = node
            .children()
            .get(index)
            .ok_or_else(|| PatchError::NotFound {
                address: address.clone(),
            })?;
    }
    Ok(node)
}

fn split_position<'a>(
    address: &'a Address,
    kind: &'static str,
) -> Result<(usize, &'a [usize]), PatchError> {
    address
        .split_last()
        .map(|(&index, path)| (index, path))
        .ok_or(PatchError::EmptyAddress { kind })
}

fn out_of_bounds(address: &Address, index: usize, len: usize) -> PatchError {
    PatchError::IndexOutOfBounds {
        address: address.clone(),
        index,
        len,
    }
}

/// Descend `path` from `root`, creating absent `children` lists on the way.
fn node_at_mut<'a>(
    root: &'a mut Arc<Component>,
    path: &[usize],
) -> Result<&'a mut Component, PatchError> {
    let mut node = Arc::make_mut(root);
    for &index in path {
        node = match node.children.get_or_insert_with(Vec::new).get_mut(index) {
            Some(child) => Arc::make_mut(child),
            None => {
                return Err(PatchError::NotFound {
                    address: Address::from(path),
                })
            }
        };
    }
    Ok(node)
}

/// The (lazily created) children list of the node at `path`.
fn children_at_mut<'a>(
    root: &'a mut Arc<Component>,
    path: &[usize],
    address: &Address,
) -> Result<&'a mut Vec<Arc<Component>>, PatchError> {
    let node = node_at_mut(root, path).map_err(|_| PatchError::NotFound {
        address: address.clone(),
    })?;
    Ok(node.children.get_or_insert_with(Vec::new))
}

/// `element` in place of `existing`, keeping `existing`'s children when the
/// key matches and it has any. The result is never stale.
fn replace_node(existing: &Component, element: &Component) -> Component {
    let mut next = element.clone();
    if existing.key == element.key && !existing.children().is_empty() {
        next.children = existing.children.clone();
    }
    next.stale = false;
    next
}

fn mark_stale_from(siblings: &mut [Arc<Component>], start: usize) {
    for sibling in siblings.iter_mut().skip(start) {
        mark_stale(sibling);
    }
}

/// Leaves become stale; a parent becomes stale once all its children are.
fn mark_stale(node: &mut Arc<Component>) {
    if node.is_leaf() {
        if !node.stale {
            Arc::make_mut(node).stale = true;
        }
        return;
    }
    let node = Arc::make_mut(node);
    if let Some(children) = node.children.as_mut() {
        for child in children.iter_mut() {
            mark_stale(child);
        }
        node.stale = children.iter().all(|c| c.stale);
    }
}

fn has_stale_descendant(node: &Component) -> bool {
    node.children()
        .iter()
        .any(|c| c.stale || has_stale_descendant(c))
}

fn sweep_stale(node: &mut Component) {
    let Some(children) = node.children.as_mut() else {
        return;
    };
    children.retain(|c| !c.stale);
    for child in children.iter_mut() {
        if has_stale_descendant(child) {
            sweep_stale(Arc::make_mut(child));
        }
    }
}
