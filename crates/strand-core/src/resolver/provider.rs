//! `PubGrub` adapter.
//!
//! Packages are modelled as [`Node`]s. An extra is its own node that pins the
//! base package to the same version and adds the extra's requirements, which
//! keeps the solver's view of each package a plain set of versions.

use super::error::{Conflict, Dependent, ResolveError, UnsatisfiableError};
use super::options::{ResolutionMode, ResolveOptions};
use super::snapshot::CatalogSnapshot;
use pubgrub::error::PubGrubError;
use pubgrub::range::Range;
use pubgrub::report::{DefaultStringReporter, DerivationTree, External, Reporter};
use pubgrub::solver::{Dependencies, DependencyConstraints, DependencyProvider};
use pubgrub::version::SemanticVersion;
use std::borrow::Borrow;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use strand_schema::{
    Comparator, Environment, ExtraName, Operator, PackageName, PackageVersion, Requirement,
    Version, VersionSpec,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A solver package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum Node {
    /// The synthetic package depending on the root requirements.
    Root,
    /// A real package.
    Package(PackageName),
    /// A package with one extra activated.
    Extra(PackageName, ExtraName),
}

impl Node {
    fn name(&self) -> Option<&PackageName> {
        match self {
            Self::Root => None,
            Self::Package(name) | Self::Extra(name, _) => Some(name),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Package(name) => write!(f, "{name}"),
            Self::Extra(name, extra) => write!(f, "{name}[{extra}]"),
        }
    }
}

#[derive(Debug, Error)]
#[error("resolution cancelled")]
struct Cancelled;

pub(crate) fn to_semver(version: Version) -> SemanticVersion {
    SemanticVersion::new(version.major, version.minor, version.patch)
}

fn from_semver(version: SemanticVersion) -> Option<Version> {
    Version::parse(&version.to_string()).ok()
}

fn comparator_range(comparator: &Comparator) -> Range<SemanticVersion> {
    let v = to_semver(comparator.version());
    let prefix = || {
        let upper = comparator
            .upper_exclusive()
            .map_or_else(|| v.bump_patch(), to_semver);
        Range::between(v, upper)
    };
    match comparator.operator() {
        Operator::Equal => Range::exact(v),
        Operator::NotEqual => Range::exact(v).negate(),
        Operator::Greater => Range::higher_than(v.bump_patch()),
        Operator::GreaterEq => Range::higher_than(v),
        Operator::Less => Range::strictly_lower_than(v),
        Operator::LessEq => Range::strictly_lower_than(v.bump_patch()),
        Operator::Compatible | Operator::EqualPrefix => prefix(),
        Operator::NotEqualPrefix => prefix().negate(),
    }
}

/// The solver range equivalent to a version spec.
pub(crate) fn spec_range(spec: &VersionSpec) -> Range<SemanticVersion> {
    spec.comparators()
        .iter()
        .fold(Range::any(), |acc, c| acc.intersection(&comparator_range(c)))
}

/// Which environments one solver pass serves.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scope<'a> {
    /// A requirement is followed when its marker matches any of these.
    pub(crate) active: &'a [Environment],
    /// Candidates must install on every one of these.
    pub(crate) supported: &'a [Environment],
    /// Candidates installing on all of these are tried first.
    pub(crate) preferred: &'a [Environment],
}

impl<'a> Scope<'a> {
    /// One solution for every environment.
    pub(crate) fn universal(envs: &'a [Environment]) -> Self {
        Self {
            active: envs,
            supported: envs,
            preferred: &[],
        }
    }

    /// One environment of a split resolution.
    pub(crate) fn single(env: &'a Environment, all: &'a [Environment]) -> Self {
        Self {
            active: std::slice::from_ref(env),
            supported: std::slice::from_ref(env),
            preferred: all,
        }
    }
}

type Declared = HashMap<(Node, SemanticVersion), Vec<(Node, Requirement)>>;

/// Serves a [`CatalogSnapshot`] to the solver.
#[derive(Debug)]
pub(crate) struct StrandProvider<'a> {
    snapshot: &'a CatalogSnapshot,
    roots: &'a [Requirement],
    scope: Scope<'a>,
    cancel: &'a CancellationToken,
    /// Usable versions per package, in the order they should be tried.
    candidates: HashMap<PackageName, Vec<SemanticVersion>>,
    /// Requirements behind each dependency handed to the solver, kept to
    /// explain failures in terms of what was declared.
    declared: RefCell<Declared>,
}

impl<'a> StrandProvider<'a> {
    pub(crate) fn new(
        snapshot: &'a CatalogSnapshot,
        roots: &'a [Requirement],
        scope: Scope<'a>,
        options: &ResolveOptions,
        cancel: &'a CancellationToken,
    ) -> Self {
        let candidates = snapshot
            .iter()
            .map(|(name, versions)| {
                (
                    name.clone(),
                    order_candidates(versions, scope, options, options.preferences.get(name)),
                )
            })
            .collect();
        Self {
            snapshot,
            roots,
            scope,
            cancel,
            candidates,
            declared: RefCell::new(HashMap::new()),
        }
    }

    fn candidates_for(&self, node: &Node) -> &[SemanticVersion] {
        node.name()
            .and_then(|name| self.candidates.get(name))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn lookup(&self, name: &PackageName, version: SemanticVersion) -> Option<&Arc<PackageVersion>> {
        from_semver(version).and_then(|v| self.snapshot.get(name, &v))
    }

    fn check_cancelled(&self) -> Result<(), Box<dyn Error>> {
        if self.cancel.is_cancelled() {
            return Err(Box::new(Cancelled));
        }
        Ok(())
    }

    /// Build the explanation for a failed resolution.
    pub(crate) fn explain(&self, tree: &DerivationTree<Node, SemanticVersion>) -> UnsatisfiableError {
        let mut externals = Vec::new();
        collect_externals(tree, &mut externals);

        let declared = self.declared.borrow();
        let mut conflicts = Vec::new();
        let mut missing = BTreeSet::new();
        let mut cite = |node: &Node, range: &Range<SemanticVersion>, target: Option<&Node>| {
            for ((dependent, version), deps) in declared.iter() {
                if dependent != node || !range.contains(version) {
                    continue;
                }
                for (to, requirement) in deps {
                    if target.is_none_or(|t| t == to) {
                        conflicts.push(Conflict {
                            dependent: to_dependent(dependent, *version),
                            requirement: requirement.clone(),
                        });
                    }
                }
            }
        };

        for external in externals {
            match external {
                External::FromDependencyOf(node, range, target, _) => cite(node, range, Some(target)),
                External::UnavailableDependencies(node, range) => cite(node, range, None),
                External::NoVersions(node, _) => {
                    if let Some(name) = node.name() {
                        if self.candidates_for(node).is_empty() {
                            missing.insert(name.clone());
                        }
                    }
                }
                External::NotRoot(..) => {}
            }
        }

        conflicts.sort_by(|a, b| {
            a.dependent
                .cmp(&b.dependent)
                .then_with(|| a.requirement.to_string().cmp(&b.requirement.to_string()))
        });
        conflicts.dedup();

        // Only the report is collapsed; `NoVersions` leaves name what is missing.
        let mut collapsed = tree.clone();
        collapsed.collapse_no_versions();
        UnsatisfiableError {
            environment: None,
            conflicts,
            missing: missing.into_iter().collect(),
            explanation: DefaultStringReporter::report(&collapsed),
        }
    }
}

fn order_candidates(
    versions: &[Arc<PackageVersion>],
    scope: Scope<'_>,
    options: &ResolveOptions,
    preferred_version: Option<&Version>,
) -> Vec<SemanticVersion> {
    let mut usable: Vec<&Arc<PackageVersion>> = versions
        .iter()
        .filter(|p| p.supports_all(scope.supported))
        .collect();
    if options.mode == ResolutionMode::Highest {
        usable.reverse();
    }
    // Stable: mode order is kept within each group.
    usable.sort_by_key(|p| !p.supports_all(scope.preferred));
    if let Some(preferred) = preferred_version {
        if let Some(idx) = usable.iter().position(|p| p.version == *preferred) {
            let pick = usable.remove(idx);
            usable.insert(0, pick);
        }
    }
    usable.into_iter().map(|p| to_semver(p.version)).collect()
}

fn to_dependent(node: &Node, version: SemanticVersion) -> Dependent {
    let version = from_semver(version).unwrap_or_default();
    match node {
        Node::Root => Dependent::Root,
        Node::Package(name) => Dependent::Package {
            name: name.clone(),
            version,
            extra: None,
        },
        Node::Extra(name, extra) => Dependent::Package {
            name: name.clone(),
            version,
            extra: Some(extra.clone()),
        },
    }
}

fn collect_externals<'t>(
    tree: &'t DerivationTree<Node, SemanticVersion>,
    out: &mut Vec<&'t External<Node, SemanticVersion>>,
) {
    match tree {
        DerivationTree::External(external) => out.push(external),
        DerivationTree::Derived(derived) => {
            collect_externals(&derived.cause1, out);
            collect_externals(&derived.cause2, out);
        }
    }
}

impl DependencyProvider<Node, SemanticVersion> for StrandProvider<'_> {
    fn choose_package_version<T: Borrow<Node>, U: Borrow<Range<SemanticVersion>>>(
        &self,
        potential_packages: impl Iterator<Item = (T, U)>,
    ) -> Result<(T, Option<SemanticVersion>), Box<dyn Error>> {
        self.check_cancelled()?;

        // Most constrained package first; name order breaks ties.
        let mut best: Option<(usize, T, U)> = None;
        for (node, range) in potential_packages {
            let count = {
                let candidate: &Node = node.borrow();
                let range: &Range<SemanticVersion> = range.borrow();
                self.candidates_for(candidate)
                    .iter()
                    .filter(|v| range.contains(v))
                    .count()
            };
            let better = match &best {
                None => true,
                Some((best_count, best_node, _)) => {
                    let candidate: &Node = node.borrow();
                    let incumbent: &Node = best_node.borrow();
                    (count, candidate) < (*best_count, incumbent)
                }
            };
            if better {
                best = Some((count, node, range));
            }
        }
        let (_, node, range) = best.ok_or("solver offered no packages")?;

        let version = {
            let chosen: &Node = node.borrow();
            let range: &Range<SemanticVersion> = range.borrow();
            let version = if *chosen == Node::Root {
                Some(SemanticVersion::zero())
            } else {
                self.candidates_for(chosen)
                    .iter()
                    .find(|v| range.contains(v))
                    .copied()
            };
            trace!(package = %chosen, ?version, "chose candidate");
            version
        };
        Ok((node, version))
    }

    fn get_dependencies(
        &self,
        node: &Node,
        version: &SemanticVersion,
    ) -> Result<Dependencies<Node, SemanticVersion>, Box<dyn Error>> {
        self.check_cancelled()?;

        let mut constraints: DependencyConstraints<Node, SemanticVersion> = DependencyConstraints::default();
        let requirements: Vec<&Requirement> = match node {
            Node::Root => self.roots.iter().collect(),
            Node::Package(name) => match self.lookup(name, *version) {
                Some(package) => package.requires.iter().collect(),
                None => return Ok(Dependencies::Unknown),
            },
            Node::Extra(name, extra) => {
                let Some(package) = self.lookup(name, *version) else {
                    return Ok(Dependencies::Unknown);
                };
                constraints.insert(Node::Package(name.clone()), Range::exact(*version));
                if package.extra(extra).is_none() {
                    trace!(package = %name, %extra, "extra not declared, ignoring");
                }
                package.extra(extra).unwrap_or_default().iter().collect()
            }
        };

        let mut declared = Vec::new();
        let mut unusable = false;
        for requirement in requirements {
            if !requirement.marker.matches_any(self.scope.active) {
                continue;
            }
            let range = spec_range(&requirement.spec);
            let targets = std::iter::once(Node::Package(requirement.name.clone())).chain(
                requirement
                    .extras
                    .iter()
                    .map(|extra| Node::Extra(requirement.name.clone(), extra.clone())),
            );
            for target in targets {
                declared.push((target.clone(), requirement.clone()));
                if target == *node {
                    // A package requiring itself only matters if it excludes
                    // this version.
                    if !range.contains(version) {
                        unusable = true;
                    }
                    continue;
                }
                let merged = match constraints.get(&target) {
                    Some(existing) => existing.intersection(&range),
                    None => range.clone(),
                };
                if merged == Range::none() {
                    unusable = true;
                }
                constraints.insert(target, merged);
            }
        }

        self.declared
            .borrow_mut()
            .insert((node.clone(), *version), declared);

        if unusable {
            trace!(package = %node, %version, "version has contradictory requirements");
            return Ok(Dependencies::Unknown);
        }
        Ok(Dependencies::Known(constraints))
    }

    fn should_cancel(&self) -> Result<(), Box<dyn Error>> {
        self.check_cancelled()
    }
}

fn classify(error: &(dyn Error + 'static)) -> ResolveError {
    if error.downcast_ref::<Cancelled>().is_some() {
        ResolveError::Cancelled
    } else {
        ResolveError::Internal(error.to_string())
    }
}

/// Run one solver pass. Returns the selected version of every package.
pub(crate) fn solve(
    snapshot: &CatalogSnapshot,
    roots: &[Requirement],
    scope: Scope<'_>,
    options: &ResolveOptions,
    cancel: &CancellationToken,
) -> Result<BTreeMap<PackageName, Arc<PackageVersion>>, ResolveError> {
    let provider = StrandProvider::new(snapshot, roots, scope, options, cancel);

    match pubgrub::solver::resolve(&provider, Node::Root, SemanticVersion::zero()) {
        Ok(solution) => {
            let mut picks = BTreeMap::new();
            for (node, version) in solution {
                if let Node::Package(name) = node {
                    let package = provider.lookup(&name, version).ok_or_else(|| {
                        ResolveError::Internal(format!("solver selected unknown version {name} {version}"))
                    })?;
                    picks.insert(name, Arc::clone(package));
                }
            }
            Ok(picks)
        }
        Err(PubGrubError::NoSolution(tree)) => Err(provider.explain(&tree).into()),
        Err(PubGrubError::ErrorChoosingPackageVersion(e) | PubGrubError::ErrorInShouldCancel(e)) => {
            Err(classify(e.as_ref()))
        }
        Err(PubGrubError::ErrorRetrievingDependencies { source, .. }) => Err(classify(source.as_ref())),
        Err(other) => Err(ResolveError::Internal(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    fn range(spec: &str) -> Range<SemanticVersion> {
        spec_range(&VersionSpec::parse(spec).unwrap())
    }

    fn sv(s: &str) -> SemanticVersion {
        to_semver(Version::parse(s).unwrap())
    }

    #[test]
    fn ranges_agree_with_spec_matching() {
        let specs = [
            ">=1.0,<2.0",
            "~=1.4",
            "~=1.4.2",
            "==1.2.*",
            "!=1.2.*",
            ">1.0",
            "<=1.5",
            "!=1.1",
            "==1.1",
            "*",
        ];
        let versions = ["0.9", "1.0", "1.0.1", "1.1", "1.2", "1.2.9", "1.4", "1.4.2", "1.4.9", "1.5", "1.9", "2.0"];
        for spec in specs {
            let parsed = VersionSpec::parse(spec).unwrap();
            let r = spec_range(&parsed);
            for v in versions {
                let version = Version::parse(v).unwrap();
                assert_eq!(
                    r.contains(&to_semver(version)),
                    parsed.contains(&version),
                    "{spec} vs {v}"
                );
            }
        }
    }

    #[test]
    fn contradictory_spec_is_empty() {
        assert_eq!(range(">=2.0,<1.0"), Range::none());
        assert!(range(">=1.0").contains(&sv("1.0")));
    }

    async fn snapshot_for(catalog: &InMemoryCatalog, roots: &[Requirement], envs: &[Environment]) -> CatalogSnapshot {
        super::super::snapshot::prefetch(
            catalog,
            roots,
            envs,
            &ResolveOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        catalog.publish("a", "1.0", &["b<2.0"]).unwrap();
        catalog.publish("b", "1.0", &[]).unwrap();
        catalog.publish("b", "2.5", &[]).unwrap();
        catalog
    }

    #[tokio::test]
    async fn solve_starts_from_root() {
        let catalog = catalog();
        let roots = [req("a>=1.0"), req("b>=1.0")];
        let envs = [Environment::parse("3.11-linux-x86_64").unwrap()];
        let snapshot = snapshot_for(&catalog, &roots, &envs).await;

        let picks = solve(
            &snapshot,
            &roots,
            Scope::universal(&envs),
            &ResolveOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        let versions: Vec<(String, String)> = picks
            .iter()
            .map(|(name, p)| (name.to_string(), p.version.to_string()))
            .collect();
        assert_eq!(
            versions,
            vec![
                ("a".to_string(), "1.0.0".to_string()),
                ("b".to_string(), "1.0.0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn solve_reports_unknown_packages() {
        let catalog = catalog();
        let roots = [req("a"), req("ghost>=1.0")];
        let envs = [Environment::parse("3.11-linux-x86_64").unwrap()];
        let snapshot = snapshot_for(&catalog, &roots, &envs).await;

        let err = solve(
            &snapshot,
            &roots,
            Scope::universal(&envs),
            &ResolveOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        let ResolveError::Unsatisfiable(err) = err else {
            panic!("expected an unsatisfiable error, got {err}");
        };
        assert_eq!(err.missing, vec![PackageName::new("ghost")]);
        assert!(!err.explanation.is_empty());
    }

    #[test]
    fn nodes_display_with_extras() {
        let node = Node::Extra(PackageName::new("a"), ExtraName::new("x"));
        assert_eq!(node.to_string(), "a[x]");
        assert_eq!(Node::Root.to_string(), "root");
    }
}
