use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::KernelError;

/// Type-erased capability object attached to a subsystem.
pub type FacetObject = Arc<dyn Any + Send + Sync>;

pub(crate) type InitFn =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), KernelError>> + Send>> + Send>;
// Dispose callbacks live inside the shared facet set, so they need Sync on
// top of Send.
pub(crate) type DisposeFn = Box<dyn FnOnce() + Send + Sync>;

/// Runtime-checkable contract a hook can declare for the facet it produces.
///
/// The check is a downcast probe: the produced object must be the declared
/// concrete type. Violations fail the build before any init runs for the
/// offending facet.
#[derive(Clone, Copy)]
pub struct Contract {
    name: &'static str,
    check: fn(&FacetObject) -> bool,
}

impl Contract {
    /// Contract satisfied only by facets of type `T`.
    pub fn of<T: Send + Sync + 'static>(name: &'static str) -> Self {
        fn probe<T: Send + Sync + 'static>(object: &FacetObject) -> bool {
            object.as_ref().is::<T>()
        }
        Self {
            name,
            check: probe::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn satisfied_by(&self, object: &FacetObject) -> bool {
        (self.check)(object)
    }
}

impl std::fmt::Debug for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Contract({})", self.name)
    }
}

/// What a hook factory produces: the facet object plus optional init and
/// dispose callbacks.
///
/// `init` runs during the build transaction (failure rolls the whole
/// transaction back); `dispose` runs in reverse order on subsystem dispose
/// or rollback.
pub struct FacetParts {
    pub(crate) object: FacetObject,
    pub(crate) init: Option<InitFn>,
    pub(crate) dispose: Option<DisposeFn>,
}

impl FacetParts {
    pub fn new<T: Send + Sync + 'static>(object: T) -> Self {
        Self::from_arc(Arc::new(object))
    }

    pub fn from_arc<T: Send + Sync + 'static>(object: Arc<T>) -> Self {
        Self {
            object: object as FacetObject,
            init: None,
            dispose: None,
        }
    }

    pub fn with_init<F, Fut>(mut self, init: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), KernelError>> + Send + 'static,
    {
        self.init = Some(Box::new(move || Box::pin(init())));
        self
    }

    pub fn with_dispose<F>(mut self, dispose: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.dispose = Some(Box::new(dispose));
        self
    }
}

/// One installed facet.
pub struct FacetEntry {
    kind: String,
    order_index: usize,
    object: FacetObject,
    dispose: Option<DisposeFn>,
}

impl FacetEntry {
    pub(crate) fn new(
        kind: String,
        order_index: usize,
        object: FacetObject,
        dispose: Option<DisposeFn>,
    ) -> Self {
        Self {
            kind,
            order_index,
            object,
            dispose,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn order_index(&self) -> usize {
        self.order_index
    }

    pub fn object(&self) -> FacetObject {
        Arc::clone(&self.object)
    }

    /// Downcast the facet object to its concrete type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.object).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for FacetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacetEntry")
            .field("kind", &self.kind)
            .field("order_index", &self.order_index)
            .finish()
    }
}

/// The ordered collection of facets installed on a subsystem.
///
/// Multiple facets of a kind may coexist; [`find`](Self::find) answers with
/// the highest `order_index` — last installed wins.
#[derive(Default)]
pub struct FacetSet {
    entries: Vec<FacetEntry>,
}

impl FacetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, entry: FacetEntry) {
        self.entries.push(entry);
    }

    /// The latest-installed facet of `kind`.
    pub fn find(&self, kind: &str) -> Option<&FacetEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .max_by_key(|e| e.order_index)
    }

    /// All facets of `kind`, in install order.
    pub fn find_all(&self, kind: &str) -> Vec<&FacetEntry> {
        let mut found: Vec<&FacetEntry> = self.entries.iter().filter(|e| e.kind == kind).collect();
        found.sort_by_key(|e| e.order_index);
        found
    }

    /// Typed accessor for the latest facet of `kind`.
    pub fn get<T: Send + Sync + 'static>(&self, kind: &str) -> Option<Arc<T>> {
        self.find(kind).and_then(FacetEntry::downcast)
    }

    /// Distinct kinds currently installed.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.entries.iter().map(|e| e.kind.clone()).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispose every facet in reverse `order_index` order and clear the set.
    pub(crate) fn dispose_all(&mut self) {
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|e| e.order_index);
        for mut entry in entries.into_iter().rev() {
            if let Some(dispose) = entry.dispose.take() {
                dispose();
            }
        }
    }
}

impl std::fmt::Debug for FacetSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacetSet")
            .field("len", &self.entries.len())
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Widget {
        tag: &'static str,
    }

    #[test]
    fn find_returns_highest_order_index() {
        let mut set = FacetSet::new();
        set.insert(FacetEntry::new(
            "widget".into(),
            0,
            Arc::new(Widget { tag: "first" }),
            None,
        ));
        set.insert(FacetEntry::new(
            "widget".into(),
            3,
            Arc::new(Widget { tag: "last" }),
            None,
        ));
        let found = set.get::<Widget>("widget").unwrap();
        assert_eq!(found.tag, "last");
        assert_eq!(set.find_all("widget").len(), 2);
    }

    #[test]
    fn get_rejects_wrong_type() {
        let mut set = FacetSet::new();
        set.insert(FacetEntry::new(
            "widget".into(),
            0,
            Arc::new(Widget { tag: "x" }),
            None,
        ));
        assert!(set.get::<String>("widget").is_none());
    }

    #[test]
    fn dispose_all_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut set = FacetSet::new();
        for index in 0..3 {
            let order = order.clone();
            set.insert(FacetEntry::new(
                format!("f{index}"),
                index,
                Arc::new(()),
                Some(Box::new(move || order.lock().unwrap().push(index))),
            ));
        }
        set.dispose_all();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(set.is_empty());
    }

    #[test]
    fn contract_probe_checks_concrete_type() {
        let contract = Contract::of::<Widget>("widget");
        let good: FacetObject = Arc::new(Widget { tag: "x" });
        let bad: FacetObject = Arc::new(42u32);
        assert!(contract.satisfied_by(&good));
        assert!(!contract.satisfied_by(&bad));
    }

    #[tokio::test]
    async fn facet_parts_init_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let parts = FacetParts::new(()).with_init(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (parts.init.unwrap())().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
