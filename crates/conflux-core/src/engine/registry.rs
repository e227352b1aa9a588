//! Action registry.
//!
//! A simple name-indexed registry of action descriptors. The engine uses it
//! to validate action input and to tell synchronous actions from
//! asynchronous ones before anything is persisted.

use std::collections::HashMap;

use conflux_types::definition::InputParam;
use serde_json::{Map, Value};

use super::error::EngineError;
use super::input::validate_input;

/// What the engine needs to know about an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    /// Synchronous actions return their result from the executor call.
    pub is_sync: bool,
    /// Declared parameters; `None` accepts any input.
    pub params: Option<Vec<InputParam>>,
}

impl ActionDescriptor {
    pub fn sync(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            is_sync: true,
            params: None,
        }
    }

    pub fn asynchronous(name: impl Into<String>) -> Self {
        Self {
            is_sync: false,
            ..Self::sync(name)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_params(mut self, params: Vec<InputParam>) -> Self {
        self.params = Some(params);
        self
    }
}

/// Registry of available actions, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionDescriptor>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. A descriptor with the same name is replaced.
    pub fn register(&mut self, descriptor: ActionDescriptor) {
        self.actions.insert(descriptor.name.clone(), descriptor);
    }

    /// Builder form of [`ActionRegistry::register`].
    pub fn with(mut self, descriptor: ActionDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ActionDescriptor> {
        self.actions.get(name)
    }

    /// Look up an action, failing with an input error when it is unknown.
    pub fn resolve(&self, name: &str) -> Result<&ActionDescriptor, EngineError> {
        self.get(name)
            .ok_or_else(|| EngineError::Input(format!("Action not found [action_name={name}]")))
    }

    /// Validate `input` against the action's declared parameters and apply
    /// defaults.
    pub fn check_input(
        &self,
        name: &str,
        input: Map<String, Value>,
    ) -> Result<Map<String, Value>, EngineError> {
        let descriptor = self.resolve(name)?;
        match &descriptor.params {
            Some(params) => validate_input(name, "action", params, input),
            None => Ok(input),
        }
    }

    /// Registered action names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
