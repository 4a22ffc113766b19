//! Patch actions and the response envelopes that carry them

use serde::{Deserialize, Serialize};

use super::{Address, Component, Props};

/// Which manager ultimately applies a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The top-level tree.
    #[default]
    App,
    /// The requesting fragment's local coordinate space.
    Fragment,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::App => "app",
            Target::Fragment => "fragment",
        }
    }
}

/// One atomic instruction to mutate the tree at an address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Add {
        address: Address,
        element: Component,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    Remove {
        address: Address,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    Set {
        address: Address,
        element: Component,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    Update {
        address: Address,
        #[serde(default)]
        props: Props,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    FreshBoundary {
        address: Address,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    Last {
        #[serde(default)]
        address: Address,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    NoChange {
        address: Address,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
}

impl Action {
    pub fn add(address: impl Into<Address>, element: Component) -> Self {
        Action::Add {
            address: address.into(),
            element,
            target: None,
        }
    }

    pub fn remove(address: impl Into<Address>) -> Self {
        Action::Remove {
            address: address.into(),
            target: None,
        }
    }

    pub fn set(address: impl Into<Address>, element: Component) -> Self {
        Action::Set {
            address: address.into(),
            element,
            target: None,
        }
    }

    pub fn update(address: impl Into<Address>, props: Props) -> Self {
        Action::Update {
            address: address.into(),
            props,
            target: None,
        }
    }

    pub fn fresh_boundary(address: impl Into<Address>) -> Self {
        Action::FreshBoundary {
            address: address.into(),
            target: None,
        }
    }

    pub fn last(address: impl Into<Address>) -> Self {
        Action::Last {
            address: address.into(),
            target: None,
        }
    }

    pub fn no_change(address: impl Into<Address>) -> Self {
        Action::NoChange {
            address: address.into(),
            target: None,
        }
    }

    /// Wire name of the action kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Add { .. } => "add",
            Action::Remove { .. } => "remove",
            Action::Set { .. } => "set",
            Action::Update { .. } => "update",
            Action::FreshBoundary { .. } => "fresh_boundary",
            Action::Last { .. } => "last",
            Action::NoChange { .. } => "no_change",
        }
    }

    pub fn address(&self) -> &Address {
        match self {
            Action::Add { address, .. }
            | Action::Remove { address, .. }
            | Action::Set { address, .. }
            | Action::Update { address, .. }
            | Action::FreshBoundary { address, .. }
            | Action::Last { address, .. }
            | Action::NoChange { address, .. } => address,
        }
    }

    fn address_mut(&mut self) -> &mut Address {
        match self {
            Action::Add { address, .. }
            | Action::Remove { address, .. }
            | Action::Set { address, .. }
            | Action::Update { address, .. }
            | Action::FreshBoundary { address, .. }
            | Action::Last { address, .. }
            | Action::NoChange { address, .. } => address,
        }
    }

    pub fn target(&self) -> Option<Target> {
        match self {
            Action::Add { target, .. }
            | Action::Remove { target, .. }
            | Action::Set { target, .. }
            | Action::Update { target, .. }
            | Action::FreshBoundary { target, .. }
            | Action::Last { target, .. }
            | Action::NoChange { target, .. } => *target,
        }
    }

    pub fn with_target(mut self, value: Target) -> Self {
        match &mut self {
            Action::Add { target, .. }
            | Action::Remove { target, .. }
            | Action::Set { target, .. }
            | Action::Update { target, .. }
            | Action::FreshBoundary { target, .. }
            | Action::Last { target, .. }
            | Action::NoChange { target, .. } => *target = Some(value),
        }
        self
    }

    /// Same action with `prefix` prepended to its address.
    pub fn prefixed(&self, prefix: &Address) -> Action {
        let mut action = self.clone();
        let joined = prefix.join(action.address());
        *action.address_mut() = joined;
        action
    }
}

/// A batch of actions and the manager that should apply them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionsResponse {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub target: Target,
}

impl ActionsResponse {
    pub fn new(actions: Vec<Action>, target: Target) -> Self {
        Self { actions, target }
    }

    pub fn app(actions: Vec<Action>) -> Self {
        Self::new(actions, Target::App)
    }

    pub fn fragment(actions: Vec<Action>) -> Self {
        Self::new(actions, Target::Fragment)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Same response with every action address prefixed.
    pub fn prefixed(&self, prefix: &Address) -> ActionsResponse {
        ActionsResponse {
            actions: self.actions.iter().map(|a| a.prefixed(prefix)).collect(),
            target: self.target,
        }
    }
}

/// One item yielded by a response: either a full batch or a bare action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseItem {
    Actions(ActionsResponse),
    Action(Action),
}

impl From<ActionsResponse> for ResponseItem {
    fn from(response: ActionsResponse) -> Self {
        ResponseItem::Actions(response)
    }
}

impl From<Action> for ResponseItem {
    fn from(action: Action) -> Self {
        ResponseItem::Action(action)
    }
}
