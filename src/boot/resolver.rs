use super::ServiceDescriptor;
use crate::core::{BootError, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{Level, event};

/// Groups services into waves by layered topological sort.
pub struct ServiceDependencyResolver;

impl ServiceDependencyResolver {
    /// Every dependency of a service lands in a strictly earlier wave. Names
    /// inside a wave are sorted ascending.
    ///
    /// Dependencies on names that are not declared are dropped with a
    /// warning. A cycle is reported with every name that could not be
    /// placed.
    pub fn resolve_waves(descriptors: &[ServiceDescriptor]) -> Result<Vec<Vec<String>>> {
        let mut pending: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for descriptor in descriptors {
            if pending.contains_key(descriptor.name.as_str()) {
                return Err(BootError::DuplicateService(descriptor.name.clone()));
            }
            pending.insert(descriptor.name.as_str(), BTreeSet::new());
        }

        for descriptor in descriptors {
            let mut deps = BTreeSet::new();
            for dependency in &descriptor.dependencies {
                if pending.contains_key(dependency.as_str()) {
                    deps.insert(dependency.as_str());
                } else {
                    event!(
                        Level::WARN,
                        service = %descriptor.name,
                        dependency = %dependency,
                        "ignoring dependency on undeclared service"
                    );
                }
            }
            pending.insert(descriptor.name.as_str(), deps);
        }

        let mut resolved: HashSet<&str> = HashSet::new();
        let mut waves = Vec::new();

        while !pending.is_empty() {
            // BTreeMap iteration keeps the wave sorted by name.
            let wave: Vec<&str> = pending
                .iter()
                .filter(|(_, deps)| deps.iter().all(|dep| resolved.contains(dep)))
                .map(|(name, _)| *name)
                .collect();

            if wave.is_empty() {
                let services: Vec<String> = pending.keys().map(|name| name.to_string()).collect();
                event!(Level::ERROR, services = ?services, "dependency cycle detected");
                return Err(BootError::DependencyCycle { services });
            }

            for name in &wave {
                pending.remove(name);
                resolved.insert(*name);
            }
            waves.push(wave.into_iter().map(str::to_string).collect());
        }

        Ok(waves)
    }

    /// Flattened wave order, for starting services one at a time.
    pub fn initialization_order(descriptors: &[ServiceDescriptor]) -> Result<Vec<String>> {
        Ok(Self::resolve_waves(descriptors)?.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, deps: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor::from_fn(name, |_| async { Ok(()) }).depends_on_all(deps.iter().copied())
    }

    #[test]
    fn test_waves_are_sorted_by_name() {
        let services = vec![service("zeta", &[]), service("alpha", &[]), service("mid", &["zeta"])];
        let waves = ServiceDependencyResolver::resolve_waves(&services).unwrap();
        assert_eq!(waves, vec![vec!["alpha", "zeta"], vec!["mid"]]);
    }

    #[test]
    fn test_undeclared_dependency_is_ignored() {
        let services = vec![service("api", &["ghost"])];
        let waves = ServiceDependencyResolver::resolve_waves(&services).unwrap();
        assert_eq!(waves, vec![vec!["api"]]);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let services = vec![service("db", &[]), service("db", &[])];
        let err = ServiceDependencyResolver::resolve_waves(&services).unwrap_err();
        assert!(matches!(err, BootError::DuplicateService(name) if name == "db"));
    }

    #[test]
    fn test_cycle_names_only_unplaceable_services() {
        let services = vec![
            service("base", &[]),
            service("a", &["base", "b"]),
            service("b", &["a"]),
            service("c", &["b"]),
        ];
        let err = ServiceDependencyResolver::resolve_waves(&services).unwrap_err();
        match err {
            BootError::DependencyCycle { services } => {
                assert_eq!(services, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let services = vec![service("loop", &["loop"])];
        assert!(ServiceDependencyResolver::resolve_waves(&services).is_err());
    }

    #[test]
    fn test_initialization_order_flattens_waves() {
        let services = vec![service("c", &["a", "b"]), service("b", &[]), service("a", &[])];
        let order = ServiceDependencyResolver::initialization_order(&services).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
