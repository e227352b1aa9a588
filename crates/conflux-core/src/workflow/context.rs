//! Layered expression contexts.
//!
//! Expressions see several maps at once: the task marker, the task's inbound
//! context, the environment, the workflow's global context and its input.
//! [`ContextView`] hides how the layers are combined:
//!
//! - [`PrecedenceView`] reads through the layers without copying; the first
//!   layer that has a top-level key wins.
//! - [`MergedView`] eagerly deep-merges all layers into one map, higher
//!   layers overriding lower ones key by key at every depth.
//!
//! [`LayeredContext`] picks one of the two from [`ContextStrategy`].

use std::borrow::Cow;
use std::collections::HashSet;

use conflux_types::config::ContextStrategy;
use serde_json::{Map, Value};

/// Read-only view over a key/value context.
pub trait ContextView {
    fn get(&self, key: &str) -> Option<&Value>;

    fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Visible keys, each once.
    fn keys(&self) -> Vec<&str>;

    /// Materialize the view.
    fn to_map(&self) -> Map<String, Value>;

    fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }
}

impl ContextView for Map<String, Value> {
    fn get(&self, key: &str) -> Option<&Value> {
        Map::get(self, key)
    }

    fn keys(&self) -> Vec<&str> {
        Map::keys(self).map(String::as_str).collect()
    }

    fn to_map(&self) -> Map<String, Value> {
        self.clone()
    }
}

// ---------------------------------------------------------------------------
// Deep merge
// ---------------------------------------------------------------------------

/// Deep-merge `source` into `target`. Nested objects merge key by key; any
/// other value in `source` replaces the one in `target`.
pub fn merge_maps(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) = (target.get_mut(key), value) {
            merge_maps(existing, incoming);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

/// Deep-merge two maps into a new one, `right` winning.
pub fn merged(left: &Map<String, Value>, right: &Map<String, Value>) -> Map<String, Value> {
    let mut out = left.clone();
    merge_maps(&mut out, right);
    out
}

// ---------------------------------------------------------------------------
// Precedence view
// ---------------------------------------------------------------------------

/// Non-copying view; layers are ordered highest precedence first.
#[derive(Debug, Clone, Default)]
pub struct PrecedenceView<'a> {
    layers: Vec<Cow<'a, Map<String, Value>>>,
}

impl<'a> PrecedenceView<'a> {
    pub fn new(layers: Vec<Cow<'a, Map<String, Value>>>) -> Self {
        Self { layers }
    }
}

impl ContextView for PrecedenceView<'_> {
    fn get(&self, key: &str) -> Option<&Value> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }

    fn keys(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.layers
            .iter()
            .flat_map(|layer| layer.keys())
            .map(String::as_str)
            .filter(|key| seen.insert(*key))
            .collect()
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for layer in self.layers.iter().rev() {
            for (key, value) in layer.iter() {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Merged view
// ---------------------------------------------------------------------------

/// Eagerly merged view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedView {
    merged: Map<String, Value>,
}

impl MergedView {
    /// Layers are ordered highest precedence first, as for [`PrecedenceView`].
    pub fn new<'a>(layers: impl DoubleEndedIterator<Item = &'a Map<String, Value>>) -> Self {
        let mut merged = Map::new();
        for layer in layers.rev() {
            merge_maps(&mut merged, layer);
        }
        Self { merged }
    }
}

impl ContextView for MergedView {
    fn get(&self, key: &str) -> Option<&Value> {
        self.merged.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.merged.keys().map(String::as_str).collect()
    }

    fn to_map(&self) -> Map<String, Value> {
        self.merged.clone()
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// A context built with the configured [`ContextStrategy`].
#[derive(Debug, Clone)]
pub enum LayeredContext<'a> {
    Precedence(PrecedenceView<'a>),
    Merged(MergedView),
}

impl<'a> LayeredContext<'a> {
    pub fn build(strategy: ContextStrategy, layers: Vec<Cow<'a, Map<String, Value>>>) -> Self {
        match strategy {
            ContextStrategy::Precedence => Self::Precedence(PrecedenceView::new(layers)),
            ContextStrategy::Merge => {
                Self::Merged(MergedView::new(layers.iter().map(|layer| &**layer)))
            }
        }
    }
}

impl ContextView for LayeredContext<'_> {
    fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Precedence(view) => view.get(key),
            Self::Merged(view) => view.get(key),
        }
    }

    fn keys(&self) -> Vec<&str> {
        match self {
            Self::Precedence(view) => view.keys(),
            Self::Merged(view) => view.keys(),
        }
    }

    fn to_map(&self) -> Map<String, Value> {
        match self {
            Self::Precedence(view) => view.to_map(),
            Self::Merged(view) => view.to_map(),
        }
    }
}
