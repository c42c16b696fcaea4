use std::collections::BTreeSet;

use crate::component::{ComponentId, ComponentRegistry};
use crate::error::WorldError;

/// Archetype filter algebra. A filter is evaluated against an entity's
/// component set; iteration over matches is deterministic for a fixed
/// component registration order.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Component set equals the given set exactly.
    Exact(BTreeSet<ComponentId>),
    /// Component set is a superset of the given set.
    Contains(BTreeSet<ComponentId>),
    Not(Box<Filter>),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn exact(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        Filter::Exact(ids.into_iter().collect())
    }

    pub fn contains(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        Filter::Contains(ids.into_iter().collect())
    }

    /// Builds an `Exact` filter from component names.
    pub fn exact_named(registry: &ComponentRegistry, names: &[&str]) -> Result<Self, WorldError> {
        Ok(Filter::Exact(resolve_names(registry, names)?))
    }

    /// Builds a `Contains` filter from component names.
    pub fn contains_named(
        registry: &ComponentRegistry,
        names: &[&str],
    ) -> Result<Self, WorldError> {
        Ok(Filter::Contains(resolve_names(registry, names)?))
    }

    pub fn not(inner: Filter) -> Self {
        Filter::Not(Box::new(inner))
    }

    pub fn and(left: Filter, right: Filter) -> Self {
        Filter::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Filter, right: Filter) -> Self {
        Filter::Or(Box::new(left), Box::new(right))
    }

    pub fn matches(&self, components: &BTreeSet<ComponentId>) -> bool {
        match self {
            Filter::Exact(set) => components == set,
            Filter::Contains(set) => set.is_subset(components),
            Filter::Not(inner) => !inner.matches(components),
            Filter::And(left, right) => left.matches(components) && right.matches(components),
            Filter::Or(left, right) => left.matches(components) || right.matches(components),
        }
    }
}

fn resolve_names(
    registry: &ComponentRegistry,
    names: &[&str],
) -> Result<BTreeSet<ComponentId>, WorldError> {
    let mut ids = BTreeSet::new();
    for name in names {
        ids.insert(registry.id_by_name(name)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[ComponentId]) -> BTreeSet<ComponentId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn exact_matches_only_identical_sets() {
        let filter = Filter::exact([0, 1]);
        assert!(filter.matches(&set(&[0, 1])));
        assert!(!filter.matches(&set(&[0])));
        assert!(!filter.matches(&set(&[0, 1, 2])));
    }

    #[test]
    fn contains_matches_supersets() {
        let filter = Filter::contains([0]);
        assert!(filter.matches(&set(&[0])));
        assert!(filter.matches(&set(&[0, 1])));
        assert!(!filter.matches(&set(&[1])));
    }

    #[test]
    fn boolean_combinators() {
        let alpha = Filter::contains([0]);
        let beta = Filter::contains([1]);
        let both = Filter::and(alpha.clone(), beta.clone());
        assert!(both.matches(&set(&[0, 1])));
        assert!(!both.matches(&set(&[0])));

        let either = Filter::or(alpha.clone(), beta.clone());
        assert!(either.matches(&set(&[0])));
        assert!(either.matches(&set(&[1])));
        assert!(!either.matches(&set(&[2])));

        let neither = Filter::not(either);
        assert!(neither.matches(&set(&[2])));
        assert!(!neither.matches(&set(&[0])));
    }

    #[test]
    fn named_filters_resolve_through_registry() {
        let mut registry = ComponentRegistry::new();
        registry.register("alpha").expect("register");
        registry.register("beta").expect("register");
        let filter = Filter::contains_named(&registry, &["alpha", "beta"]).expect("filter");
        assert!(filter.matches(&set(&[0, 1, 2])));
        assert!(Filter::contains_named(&registry, &["missing"]).is_err());
    }
}
