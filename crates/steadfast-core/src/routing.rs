//! Fallback routing over an ordered, deduplicated chain of models.

use std::collections::HashSet;

/// Cursor over the models to try for one execution.
///
/// The primary model comes first, followed by the fallbacks in order.
/// Duplicates keep their first position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRouting {
    models: Vec<String>,
    current_index: usize,
}

impl FallbackRouting {
    /// Build the chain for `primary` followed by `fallbacks`.
    pub fn new<I, S>(primary: impl Into<String>, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let primary = primary.into();
        let mut seen = HashSet::new();
        let models = std::iter::once(primary)
            .chain(fallbacks.into_iter().map(|m| m.as_ref().to_string()))
            .filter(|m| seen.insert(m.clone()))
            .collect();

        Self {
            models,
            current_index: 0,
        }
    }

    /// The model currently selected, or `None` once exhausted.
    pub fn current_model(&self) -> Option<&str> {
        self.models.get(self.current_index).map(String::as_str)
    }

    /// Move to the next model and return it, or `None` if that exhausts the chain.
    pub fn advance(&mut self) -> Option<&str> {
        if self.current_index < self.models.len() {
            self.current_index += 1;
        }
        self.current_model()
    }

    /// Whether a model remains after the current one.
    pub fn has_more(&self) -> bool {
        self.current_index + 1 < self.models.len()
    }

    /// Whether every model has been passed.
    pub fn is_exhausted(&self) -> bool {
        self.current_index >= self.models.len()
    }

    /// Rewind to the primary model.
    pub fn reset(&mut self) {
        self.current_index = 0;
    }

    /// Models reached so far, including the current one.
    pub fn tried_models(&self) -> &[String] {
        if self.models.is_empty() {
            return &[];
        }
        let last = self.current_index.min(self.models.len() - 1);
        &self.models[..=last]
    }

    /// The full deduplicated chain.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Position of the current model.
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Number of models in the chain.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the chain holds no models at all.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
