use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::context::SubsystemContext;
use crate::error::KernelError;
use crate::facet::{Contract, FacetEntry, FacetObject, FacetParts, FacetSet};

type HookFactory =
    Box<dyn for<'a> FnOnce(&BuildContext<'a>) -> Result<FacetParts, KernelError> + Send>;

/// Declarative descriptor of one capability to install on a subsystem.
///
/// Hooks are resolved into a dependency graph over their `kind` names and
/// run level by level; each produced facet receives an `order_index` equal
/// to the hook's declaration position.
pub struct Hook {
    kind: String,
    requires: Vec<String>,
    overwrite: bool,
    attach: bool,
    contract: Option<Contract>,
    factory: HookFactory,
}

impl Hook {
    pub fn new<F>(kind: impl Into<String>, factory: F) -> Self
    where
        F: for<'a> FnOnce(&BuildContext<'a>) -> Result<FacetParts, KernelError> + Send + 'static,
    {
        Self {
            kind: kind.into(),
            requires: Vec::new(),
            overwrite: false,
            attach: false,
            contract: None,
            factory: Box::new(factory),
        }
    }

    /// Declare facet kinds that must be produced before this hook runs.
    pub fn requires(mut self, kinds: &[&str]) -> Self {
        self.requires = kinds.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Allow this hook to install a second facet of an already-present kind
    /// (last-installed wins on `find`).
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Expose the produced facet on the subsystem api under this hook's
    /// kind, unless that name is already taken.
    pub fn attach(mut self) -> Self {
        self.attach = true;
        self
    }

    pub fn contract(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("requires", &self.requires)
            .field("overwrite", &self.overwrite)
            .field("attach", &self.attach)
            .finish()
    }
}

/// What a hook factory sees: the subsystem name, the shared context, and
/// every facet produced by earlier levels of the current build.
pub struct BuildContext<'a> {
    subsystem: &'a str,
    ctx: &'a SubsystemContext,
    facets: &'a FacetSet,
}

impl<'a> BuildContext<'a> {
    pub fn subsystem(&self) -> &str {
        self.subsystem
    }

    pub fn context(&self) -> &SubsystemContext {
        self.ctx
    }

    pub fn facets(&self) -> &FacetSet {
        self.facets
    }

    /// Typed lookup of a facet produced earlier in this build; missing or
    /// wrongly-typed facets are build errors.
    pub fn facet<T: Send + Sync + 'static>(&self, kind: &str) -> Result<Arc<T>, KernelError> {
        self.facets.get::<T>(kind).ok_or_else(|| {
            KernelError::build(format!(
                "hook on subsystem '{}' needs facet '{}' which is not built",
                self.subsystem, kind
            ))
        })
    }
}

// ── Dependency resolution ───────────────────────────────────────────────────

/// The resolved execution order: levels with no intra-level dependency
/// edges, holding hook declaration indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub levels: Vec<Vec<usize>>,
}

/// Cache of resolved [`BuildPlan`]s keyed by the hook-set signature, shared
/// through the [`SubsystemContext`] so child subsystems with the same
/// default hooks skip re-sorting.
#[derive(Default)]
pub struct GraphCache {
    inner: Mutex<HashMap<u64, Arc<BuildPlan>>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("graph cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_resolve(&self, hooks: &[Hook]) -> Result<Arc<BuildPlan>, KernelError> {
        let key = fingerprint(hooks);
        if let Some(plan) = self.inner.lock().expect("graph cache poisoned").get(&key) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(resolve_plan(hooks)?);
        self.inner
            .lock()
            .expect("graph cache poisoned")
            .insert(key, Arc::clone(&plan));
        Ok(plan)
    }
}

fn fingerprint(hooks: &[Hook]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for hook in hooks {
        hook.kind.hash(&mut hasher);
        hook.requires.hash(&mut hasher);
        hook.overwrite.hash(&mut hasher);
    }
    hasher.finish()
}

/// Validate the hook set and compute dependency levels (Kahn's algorithm,
/// peeled level by level). Configuration errors — duplicate kinds without
/// `overwrite`, unsatisfiable `requires`, cycles — are detected here,
/// before any factory or init runs.
fn resolve_plan(hooks: &[Hook]) -> Result<BuildPlan, KernelError> {
    let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, hook) in hooks.iter().enumerate() {
        let entry = producers.entry(hook.kind.as_str()).or_default();
        if !entry.is_empty() && !hook.overwrite {
            return Err(KernelError::build(format!(
                "duplicate hook kind '{}' (set overwrite to allow coexistence)",
                hook.kind
            )));
        }
        entry.push(index);
    }

    // Edges: every producer of a required kind runs before the consumer.
    let mut in_degree = vec![0usize; hooks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); hooks.len()];
    for (consumer, hook) in hooks.iter().enumerate() {
        for required in &hook.requires {
            let Some(producer_indices) = producers.get(required.as_str()) else {
                return Err(KernelError::build(format!(
                    "hook '{}' requires '{}' but no hook produces it",
                    hook.kind, required
                )));
            };
            for &producer in producer_indices {
                if producer == consumer {
                    continue;
                }
                dependents[producer].push(consumer);
                in_degree[consumer] += 1;
            }
        }
    }

    let mut remaining = hooks.len();
    let mut levels = Vec::new();
    let mut ready: Vec<usize> = (0..hooks.len()).filter(|&i| in_degree[i] == 0).collect();
    while !ready.is_empty() {
        ready.sort_unstable();
        remaining -= ready.len();
        let mut next = Vec::new();
        for &index in &ready {
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        levels.push(std::mem::replace(&mut ready, next));
    }

    if remaining > 0 {
        let cycle: Vec<&str> = (0..hooks.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| hooks[i].kind.as_str())
            .collect();
        return Err(KernelError::build(format!(
            "dependency cycle between hooks: {}",
            cycle.join(" -> ")
        )));
    }

    Ok(BuildPlan { levels })
}

// ── Build execution ─────────────────────────────────────────────────────────

/// Run a hook set to completion: construct facets level by level, verify
/// contracts, attach to the api, and run inits. Any failure disposes every
/// facet already added in this transaction (reverse order) and surfaces the
/// original error as `build_error`.
pub(crate) async fn run_build(
    subsystem: &str,
    ctx: &SubsystemContext,
    hooks: Vec<Hook>,
    cache: &GraphCache,
) -> Result<(FacetSet, HashMap<String, FacetObject>), KernelError> {
    let plan = cache.get_or_resolve(&hooks)?;
    let mut slots: Vec<Option<Hook>> = hooks.into_iter().map(Some).collect();
    let mut facets = FacetSet::new();
    let mut api: HashMap<String, FacetObject> = HashMap::new();

    for level in &plan.levels {
        for &index in level {
            let hook = slots[index].take().expect("hook scheduled twice");
            let produced = {
                let build_ctx = BuildContext {
                    subsystem,
                    ctx,
                    facets: &facets,
                };
                (hook.factory)(&build_ctx)
            };
            let parts = match produced {
                Ok(parts) => parts,
                Err(err) => {
                    facets.dispose_all();
                    return Err(KernelError::with_cause(
                        crate::ErrorKind::BuildError,
                        format!("hook '{}' failed to construct its facet", hook.kind),
                        err,
                    ));
                }
            };

            if let Some(contract) = &hook.contract {
                if !contract.satisfied_by(&parts.object) {
                    facets.dispose_all();
                    return Err(KernelError::build(format!(
                        "facet '{}' violates contract '{}'",
                        hook.kind,
                        contract.name()
                    )));
                }
            }

            let object = Arc::clone(&parts.object);
            facets.insert(FacetEntry::new(
                hook.kind.clone(),
                index,
                Arc::clone(&object),
                parts.dispose,
            ));
            if hook.attach && !api.contains_key(&hook.kind) {
                api.insert(hook.kind.clone(), object);
            }

            if let Some(init) = parts.init {
                if let Err(err) = init().await {
                    facets.dispose_all();
                    return Err(KernelError::with_cause(
                        crate::ErrorKind::BuildError,
                        format!("init of facet '{}' failed", hook.kind),
                        err,
                    ));
                }
            }
        }
    }

    Ok((facets, api))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plain(kind: &str) -> Hook {
        Hook::new(kind, |_ctx| Ok(FacetParts::new(())))
    }

    fn ctx() -> SubsystemContext {
        SubsystemContext::new()
    }

    #[test]
    fn independent_hooks_share_one_level() {
        let hooks = vec![plain("a"), plain("b"), plain("c")];
        let plan = resolve_plan(&hooks).unwrap();
        assert_eq!(plan.levels, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn requires_splits_levels() {
        let hooks = vec![
            plain("a"),
            plain("b").requires(&["a"]),
            plain("c").requires(&["b"]),
            plain("d"),
        ];
        let plan = resolve_plan(&hooks).unwrap();
        assert_eq!(plan.levels, vec![vec![0, 3], vec![1], vec![2]]);
    }

    #[test]
    fn missing_requirement_is_a_build_error() {
        let hooks = vec![plain("b").requires(&["a"])];
        let err = resolve_plan(&hooks).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BuildError);
        assert!(err.message().contains("requires 'a'"));
    }

    #[test]
    fn cycle_is_detected_before_any_init() {
        let hooks = vec![plain("a").requires(&["b"]), plain("b").requires(&["a"])];
        let err = resolve_plan(&hooks).unwrap_err();
        assert!(err.message().contains("cycle"));
    }

    #[test]
    fn duplicate_kind_without_overwrite_fails() {
        let hooks = vec![plain("a"), plain("a")];
        assert!(resolve_plan(&hooks).is_err());
    }

    #[test]
    fn duplicate_kind_with_overwrite_is_allowed() {
        let hooks = vec![plain("a"), plain("a").overwrite()];
        let plan = resolve_plan(&hooks).unwrap();
        assert_eq!(plan.levels, vec![vec![0, 1]]);
    }

    #[test]
    fn graph_cache_reuses_plans() {
        let cache = GraphCache::new();
        let hooks = vec![plain("a"), plain("b").requires(&["a"])];
        let first = cache.get_or_resolve(&hooks).unwrap();
        let hooks_again = vec![plain("a"), plain("b").requires(&["a"])];
        let second = cache.get_or_resolve(&hooks_again).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn build_constructs_in_dependency_order() {
        struct Base(u32);
        struct Derived(u32);

        let hooks = vec![
            Hook::new("derived", |ctx: &BuildContext<'_>| {
                let base = ctx.facet::<Base>("base")?;
                Ok(FacetParts::new(Derived(base.0 + 1)))
            })
            .requires(&["base"]),
            Hook::new("base", |_ctx| Ok(FacetParts::new(Base(41)))),
        ];
        let (facets, _api) = run_build("test", &ctx(), hooks, &GraphCache::new())
            .await
            .unwrap();
        assert_eq!(facets.get::<Derived>("derived").unwrap().0, 42);
    }

    #[tokio::test]
    async fn init_failure_rolls_back_everything() {
        let disposed = Arc::new(AtomicUsize::new(0));

        let d1 = disposed.clone();
        let d2 = disposed.clone();
        let hooks = vec![
            Hook::new("a", move |_ctx| {
                Ok(FacetParts::new(())
                    .with_dispose(move || {
                        d1.fetch_add(1, Ordering::SeqCst);
                    })
                    .with_init(|| async { Err(KernelError::internal("boom")) }))
            }),
            Hook::new("b", move |_ctx| {
                Ok(FacetParts::new(()).with_dispose(move || {
                    d2.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .requires(&["a"]),
        ];

        let err = run_build("test", &ctx(), hooks, &GraphCache::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BuildError);
        assert_eq!(err.cause().unwrap().message(), "boom");
        // Only facet 'a' was constructed; its dispose ran during rollback.
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_init_failure_disposes_earlier_facets_in_reverse() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        let o2 = order.clone();
        let hooks = vec![
            Hook::new("first", move |_ctx| {
                Ok(FacetParts::new(()).with_dispose(move || o1.lock().unwrap().push("first")))
            }),
            Hook::new("second", move |_ctx| {
                Ok(FacetParts::new(())
                    .with_dispose(move || o2.lock().unwrap().push("second"))
                    .with_init(|| async { Err(KernelError::internal("late")) }))
            })
            .requires(&["first"]),
        ];

        run_build("test", &ctx(), hooks, &GraphCache::new())
            .await
            .unwrap_err();
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn contract_violation_fails_the_build() {
        struct Expected;
        let hooks = vec![
            Hook::new("typed", |_ctx| Ok(FacetParts::new(42u32)))
                .contract(Contract::of::<Expected>("expected")),
        ];
        let err = run_build("test", &ctx(), hooks, &GraphCache::new())
            .await
            .unwrap_err();
        assert!(err.message().contains("violates contract"));
    }

    #[tokio::test]
    async fn attach_exposes_first_facet_only() {
        let hooks = vec![
            Hook::new("thing", |_ctx| Ok(FacetParts::new(1u32))).attach(),
            Hook::new("thing", |_ctx| Ok(FacetParts::new(2u32)))
                .overwrite()
                .attach(),
        ];
        let (facets, api) = run_build("test", &ctx(), hooks, &GraphCache::new())
            .await
            .unwrap();
        // find() answers with the overwriting facet...
        assert_eq!(*facets.get::<u32>("thing").unwrap(), 2);
        // ...but the api name was already taken by the first.
        let attached = Arc::clone(api.get("thing").unwrap());
        assert_eq!(*attached.downcast::<u32>().unwrap(), 1);
    }

    #[tokio::test]
    async fn factory_error_is_wrapped_as_build_error() {
        let hooks = vec![Hook::new("broken", |_ctx| {
            Err(KernelError::validation("bad config"))
        })];
        let err = run_build("test", &ctx(), hooks, &GraphCache::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BuildError);
        assert_eq!(err.cause().unwrap().kind(), crate::ErrorKind::Validation);
    }
}
