//! Request parameters for list, watch and delete calls.
use crate::labels::Selector;

/// Common query parameters for list calls
#[derive(Clone, Debug, Default)]
pub struct ListParams {
    /// Restrict the returned objects by their labels; `None` selects all
    pub label_selector: Option<Selector>,
}

impl ListParams {
    /// Restrict the list to objects matching a selector
    #[must_use]
    pub fn labels(mut self, selector: Selector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    /// Whether an object's labels pass this parameter set
    pub fn accepts(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        self.label_selector.as_ref().is_none_or(|s| s.matches(labels))
    }
}

/// Parameters for delete calls
#[derive(Clone, Debug, Default)]
pub struct DeleteParams {
    /// Require the current resource version to match before deleting
    pub preconditions_resource_version: Option<String>,
}
