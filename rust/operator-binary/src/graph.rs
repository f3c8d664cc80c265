//! Acyclic package-dependency graph. Packages reference each other by name;
//! the graph stores them in an arena and traverses by integer index.

use std::collections::BTreeMap;

use snafu::Snafu;

use crate::crd::{Package, Stage};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("package {package} depends on unknown package {dependency}"))]
    UnknownDependency { package: String, dependency: String },

    #[snafu(display("package dependency cycle through {package}"))]
    DependencyCycle { package: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// Dependency edges as indices into `names`, per package.
    deps: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds and validates the graph: every referenced dependency must exist
    /// and the edges must form a DAG.
    pub fn build(packages: &BTreeMap<String, Package>) -> Result<Self> {
        let names: Vec<String> = packages.keys().cloned().collect();
        let index: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(at, name)| (name.as_str(), at))
            .collect();

        let mut deps = Vec::with_capacity(names.len());
        for name in &names {
            let package = &packages[name];
            let mut edges = Vec::with_capacity(package.depends_on.len());
            for dependency in &package.depends_on {
                let at = index.get(dependency.as_str()).copied().ok_or_else(|| {
                    Error::UnknownDependency {
                        package: name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                edges.push(at);
            }
            deps.push(edges);
        }

        let graph = DependencyGraph { names, deps };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut mark = vec![0u8; self.names.len()];
        for start in 0..self.names.len() {
            self.visit(start, &mut mark)?;
        }
        Ok(())
    }

    fn visit(&self, at: usize, mark: &mut [u8]) -> Result<()> {
        match mark[at] {
            1 => {
                return DependencyCycleSnafu {
                    package: self.names[at].clone(),
                }
                .fail();
            }
            2 => return Ok(()),
            _ => {}
        }
        mark[at] = 1;
        for &dep in &self.deps[at] {
            self.visit(dep, mark)?;
        }
        mark[at] = 2;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        let at = self.names.iter().position(|n| n == name);
        at.into_iter()
            .flat_map(move |at| self.deps[at].iter().map(|&dep| self.names[dep].as_str()))
    }

    /// True when every dependency of `name` has reached at least `stage`'s
    /// progress level according to `reached`. Compared by
    /// [`Stage::progress`], so a dependency mid-upgrade counts as apply-level
    /// at best. Packages without dependencies are always ready.
    pub fn ready_at(
        &self,
        name: &str,
        stage: Stage,
        reached: impl Fn(&str) -> Option<Stage>,
    ) -> bool {
        self.dependencies_of(name)
            .all(|dep| reached(dep).is_some_and(|done| done.progress() >= stage.progress()))
    }

    /// Names whose dependencies are all satisfied per `reached`, i.e. the
    /// frontier that may run now.
    pub fn frontier(&self, stage: Stage, reached: impl Fn(&str) -> Option<Stage>) -> Vec<&str> {
        self.names
            .iter()
            .map(String::as_str)
            .filter(|name| self.ready_at(name, stage, &reached))
            .collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn packages(specs: &[(&str, &[&str])]) -> BTreeMap<String, Package> {
        specs
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    Package {
                        name: name.to_string(),
                        version: "1.0.0".to_string(),
                        image: format!("example/{name}"),
                        depends_on: deps.iter().map(|d| d.to_string()).collect(),
                        ..Package::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_graph_is_valid() {
        let graph = DependencyGraph::build(&BTreeMap::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.frontier(Stage::Apply, |_| None).is_empty());
    }

    #[test]
    fn test_every_package_ready_without_dependencies() {
        let graph =
            DependencyGraph::build(&packages(&[("a", &[]), ("b", &[]), ("c", &[])])).unwrap();
        assert_eq!(graph.frontier(Stage::Apply, |_| None), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = DependencyGraph::build(&packages(&[("a", &["ghost"])])).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let err =
            DependencyGraph::build(&packages(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { .. }));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let err = DependencyGraph::build(&packages(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { .. }));
    }

    #[test]
    fn test_frontier_respects_dependency_stage() {
        let graph = DependencyGraph::build(&packages(&[("base", &[]), ("top", &["base"])])).unwrap();

        // base not yet applied: only base may run
        assert_eq!(graph.frontier(Stage::Apply, |_| None), vec!["base"]);

        // base applied: both may run apply-level work
        let applied = |name: &str| (name == "base").then_some(Stage::Apply);
        assert_eq!(graph.frontier(Stage::Apply, applied), vec!["base", "top"]);

        // but top may not pass config until base has
        assert!(!graph.ready_at("top", Stage::Config, applied));
        let configured = |name: &str| (name == "base").then_some(Stage::Config);
        assert!(graph.ready_at("top", Stage::Config, configured));
    }

    #[test]
    fn test_upgrade_counts_as_apply_level_progress_only() {
        let graph = DependencyGraph::build(&packages(&[("base", &[]), ("top", &["base"])])).unwrap();
        let upgrading = |name: &str| (name == "base").then_some(Stage::Upgrade);
        assert!(graph.ready_at("top", Stage::Apply, upgrading));
        assert!(!graph.ready_at("top", Stage::Config, upgrading));

        // an uninstalled dependency carries no progress at all
        let uninstalled = |name: &str| (name == "base").then_some(Stage::Uninstall);
        assert!(!graph.ready_at("top", Stage::Apply, uninstalled));
    }

    #[test]
    fn test_dependencies_of() {
        let graph = DependencyGraph::build(&packages(&[
            ("c", &["b", "a"]),
            ("b", &["a"]),
            ("a", &[]),
        ]))
        .unwrap();
        let deps: Vec<&str> = graph.dependencies_of("c").collect();
        assert_eq!(deps, vec!["b", "a"]);
        assert_eq!(graph.dependencies_of("a").count(), 0);
    }
}
