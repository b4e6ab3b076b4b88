//! Resolved dependency graphs.

use super::error::Dependent;
use crate::lockfile::{LockView, LockedVersion};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use strand_schema::{
    Blake3Hash, Environment, ExtraName, Fingerprint, PackageName, PackageVersion, Requirement,
    Version,
};
use thiserror::Error;

/// A package selected in one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    /// The selected version's metadata.
    pub package: Arc<PackageVersion>,
    /// Extras some dependent activated.
    pub extras: BTreeSet<ExtraName>,
}

impl ResolvedPackage {
    /// The selected version.
    pub fn version(&self) -> Version {
        self.package.version
    }

    /// Digest of the selected artifact.
    pub fn digest(&self) -> &Blake3Hash {
        &self.package.digest
    }
}

/// A selection that does not satisfy a reachable requirement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Nothing was selected for a required package.
    #[error("{environment}: {dependent} requires {requirement}, but nothing was selected")]
    Missing {
        /// Environment being checked.
        environment: Environment,
        /// Who declared the requirement.
        dependent: Dependent,
        /// The requirement.
        requirement: Requirement,
    },

    /// The selected version falls outside a requirement.
    #[error("{environment}: {dependent} requires {requirement}, but {found} was selected")]
    Unsatisfied {
        /// Environment being checked.
        environment: Environment,
        /// Who declared the requirement.
        dependent: Dependent,
        /// The requirement.
        requirement: Requirement,
        /// The selected version.
        found: Version,
    },

    /// The selected artifact does not install in the environment.
    #[error("{environment}: {name} {version} does not support this environment")]
    Unsupported {
        /// Environment being checked.
        environment: Environment,
        /// Package name.
        name: PackageName,
        /// Selected version.
        version: Version,
    },
}

/// The output of a resolution: one package set per target environment.
///
/// Every requirement reachable from the roots in an environment (markers
/// evaluated against that environment) is satisfied by the package selected
/// for its name in that environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionGraph {
    roots: Vec<Requirement>,
    environments: BTreeMap<Environment, BTreeMap<PackageName, ResolvedPackage>>,
}

impl ResolutionGraph {
    /// Walk `roots` in every environment, taking versions from `pick`.
    pub(crate) fn build<F>(roots: &[Requirement], envs: &[Environment], mut pick: F) -> Result<Self, Violation>
    where
        F: FnMut(&Environment, &PackageName) -> Option<Arc<PackageVersion>>,
    {
        let mut environments = BTreeMap::new();
        for env in envs {
            let packages = walk(roots, env, &mut |name| pick(env, name))?;
            environments.insert(*env, packages);
        }
        Ok(Self {
            roots: roots.to_vec(),
            environments,
        })
    }

    /// The root requirements this graph was resolved for.
    pub fn roots(&self) -> &[Requirement] {
        &self.roots
    }

    /// Fingerprint of [`ResolutionGraph::roots`].
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.roots)
    }

    /// Target environments, in order.
    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.environments.keys()
    }

    /// Packages selected for `env`.
    pub fn packages(&self, env: &Environment) -> Option<&BTreeMap<PackageName, ResolvedPackage>> {
        self.environments.get(env)
    }

    /// The package selected for `name` in `env`.
    pub fn get(&self, env: &Environment, name: &PackageName) -> Option<&ResolvedPackage> {
        self.environments.get(env)?.get(name)
    }

    /// Every environment with its selection.
    pub fn iter(&self) -> impl Iterator<Item = (&Environment, &BTreeMap<PackageName, ResolvedPackage>)> {
        self.environments.iter()
    }

    /// Digests of every selected artifact.
    pub fn digests(&self) -> BTreeSet<Blake3Hash> {
        self.environments
            .values()
            .flat_map(|packages| packages.values().map(|p| p.digest().clone()))
            .collect()
    }

    /// Selected versions as resolver preferences. When environments
    /// disagree, the first environment wins.
    pub fn preferences(&self) -> BTreeMap<PackageName, Version> {
        let mut preferences = BTreeMap::new();
        for packages in self.environments.values() {
            for (name, resolved) in packages {
                preferences
                    .entry(name.clone())
                    .or_insert_with(|| resolved.version());
            }
        }
        preferences
    }

    /// Environment → name → (version, digest).
    pub fn view(&self) -> LockView {
        let mut view = LockView::default();
        for (env, packages) in &self.environments {
            view.add_environment(*env);
            for (name, resolved) in packages {
                view.insert(
                    *env,
                    name.clone(),
                    LockedVersion {
                        version: resolved.version(),
                        digest: resolved.digest().clone(),
                    },
                );
            }
        }
        view
    }

    /// Re-check every reachable requirement against the selection.
    ///
    /// # Errors
    ///
    /// Returns the first [`Violation`] found.
    pub fn verify(&self) -> Result<(), Violation> {
        for (env, packages) in &self.environments {
            walk(&self.roots, env, &mut |name| {
                packages.get(name).map(|p| Arc::clone(&p.package))
            })?;
        }
        Ok(())
    }

    /// This graph restricted to what `roots` reach, if it still satisfies
    /// them in exactly `envs`.
    pub(crate) fn reuse(&self, roots: &[Requirement], envs: &[Environment]) -> Option<Self> {
        let same_envs = envs.len() == self.environments.len()
            && envs.iter().all(|env| self.environments.contains_key(env));
        if !same_envs {
            return None;
        }
        Self::build(roots, envs, |env, name| {
            self.get(env, name).map(|p| Arc::clone(&p.package))
        })
        .ok()
    }
}

/// Breadth-first walk from `roots` in `env`. Each name settles on the first
/// version `pick` returns; later requirements on it are checked against that
/// version and may only add extras.
fn walk<F>(
    roots: &[Requirement],
    env: &Environment,
    pick: &mut F,
) -> Result<BTreeMap<PackageName, ResolvedPackage>, Violation>
where
    F: FnMut(&PackageName) -> Option<Arc<PackageVersion>>,
{
    let mut settled: BTreeMap<PackageName, ResolvedPackage> = BTreeMap::new();
    let mut queue: VecDeque<(Dependent, Requirement)> = roots
        .iter()
        .map(|r| (Dependent::Root, r.clone()))
        .collect();

    let unsatisfied = |dependent: Dependent, requirement: Requirement, found: Version| Violation::Unsatisfied {
        environment: *env,
        dependent,
        requirement,
        found,
    };

    while let Some((dependent, requirement)) = queue.pop_front() {
        if !requirement.applies_to(env) {
            continue;
        }

        if let Some(existing) = settled.get_mut(&requirement.name) {
            if !requirement.is_satisfied_by(&existing.version()) {
                return Err(unsatisfied(dependent, requirement, existing.version()));
            }
            for extra in &requirement.extras {
                if existing.extras.insert(extra.clone()) {
                    enqueue_extra(&existing.package, extra, &mut queue);
                }
            }
            continue;
        }

        let Some(package) = pick(&requirement.name) else {
            return Err(Violation::Missing {
                environment: *env,
                dependent,
                requirement,
            });
        };
        if !requirement.is_satisfied_by(&package.version) {
            return Err(unsatisfied(dependent, requirement, package.version));
        }
        if !package.supports(env) {
            return Err(Violation::Unsupported {
                environment: *env,
                name: package.name.clone(),
                version: package.version,
            });
        }

        let parent = Dependent::Package {
            name: package.name.clone(),
            version: package.version,
            extra: None,
        };
        queue.extend(package.requires.iter().map(|r| (parent.clone(), r.clone())));
        for extra in &requirement.extras {
            enqueue_extra(&package, extra, &mut queue);
        }

        settled.insert(
            requirement.name.clone(),
            ResolvedPackage {
                package,
                extras: requirement.extras.clone(),
            },
        );
    }

    Ok(settled)
}

fn enqueue_extra(package: &PackageVersion, extra: &ExtraName, queue: &mut VecDeque<(Dependent, Requirement)>) {
    let parent = Dependent::Package {
        name: package.name.clone(),
        version: package.version,
        extra: Some(extra.clone()),
    };
    for requirement in package.extra(extra).unwrap_or_default() {
        queue.push_back((parent.clone(), requirement.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::parse("3.12-linux-x86_64").unwrap()
    }

    fn pkg(name: &str, version: &str, requires: &[&str]) -> Arc<PackageVersion> {
        Arc::new(PackageVersion {
            name: PackageName::new(name),
            version: Version::parse(version).unwrap(),
            requires: requires.iter().map(|r| Requirement::parse(r).unwrap()).collect(),
            extras: BTreeMap::new(),
            environments: vec![],
            digest: Blake3Hash::compute(format!("{name}{version}").as_bytes()),
            published: None,
        })
    }

    fn roots(reqs: &[&str]) -> Vec<Requirement> {
        reqs.iter().map(|r| Requirement::parse(r).unwrap()).collect()
    }

    fn picks(list: &[Arc<PackageVersion>]) -> BTreeMap<PackageName, Arc<PackageVersion>> {
        list.iter().map(|p| (p.name.clone(), Arc::clone(p))).collect()
    }

    #[test]
    fn walk_keeps_only_reachable_packages() {
        let selection = picks(&[pkg("a", "1.0", &["b"]), pkg("b", "1.0", &[]), pkg("c", "1.0", &[])]);
        let graph = ResolutionGraph::build(&roots(&["a"]), &[env()], |_, name| selection.get(name).cloned()).unwrap();

        let names: Vec<&str> = graph.packages(&env()).unwrap().keys().map(PackageName::as_str).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn walk_reports_unsatisfied_requirement() {
        let selection = picks(&[pkg("a", "1.0", &["b<2.0"]), pkg("b", "2.0", &[])]);
        let err = ResolutionGraph::build(&roots(&["a"]), &[env()], |_, name| selection.get(name).cloned()).unwrap_err();
        assert!(matches!(err, Violation::Unsatisfied { found, .. } if found == Version::new(2, 0, 0)));
    }

    #[test]
    fn walk_reports_missing_package() {
        let selection = picks(&[pkg("a", "1.0", &["b"])]);
        let err = ResolutionGraph::build(&roots(&["a"]), &[env()], |_, name| selection.get(name).cloned()).unwrap_err();
        assert!(matches!(err, Violation::Missing { .. }));
    }

    #[test]
    fn extras_activated_later_are_merged() {
        let mut b = (*pkg("b", "1.0", &[])).clone();
        b.extras.insert(ExtraName::new("x"), roots(&["c"]));
        let selection = picks(&[pkg("a", "1.0", &["b[x]"]), Arc::new(b), pkg("c", "1.0", &[])]);

        let graph = ResolutionGraph::build(&roots(&["b", "a"]), &[env()], |_, name| selection.get(name).cloned()).unwrap();
        let resolved_b = graph.get(&env(), &PackageName::new("b")).unwrap();
        assert!(resolved_b.extras.contains(&ExtraName::new("x")));
        assert!(graph.get(&env(), &PackageName::new("c")).is_some());
    }

    #[test]
    fn reuse_rejects_new_environments_and_broken_roots() {
        let selection = picks(&[pkg("a", "1.0", &[])]);
        let graph = ResolutionGraph::build(&roots(&["a"]), &[env()], |_, name| selection.get(name).cloned()).unwrap();

        assert!(graph.reuse(&roots(&["a>=1.0"]), &[env()]).is_some());
        assert!(graph.reuse(&roots(&["a>=2.0"]), &[env()]).is_none());
        assert!(graph.reuse(&roots(&["a", "z"]), &[env()]).is_none());
        let other = Environment::parse("3.12-macos-aarch64").unwrap();
        assert!(graph.reuse(&roots(&["a"]), &[env(), other]).is_none());
    }
}
