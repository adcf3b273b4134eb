//! Dependency propagation between entities.
//!
//! Hosts declare edges from a child entity type to a parent entity type,
//! each with a resolver that maps a concrete child to its parent instance.
//! Touching an entity bumps its freshness signal and walks the declared
//! edges, bumping every transitive parent synchronously, so keys derived
//! from any ancestor change before the touch call returns.
//!
//! Cycles are rejected when an edge is declared, not discovered during a
//! walk. Diamonds are fine: a shared ancestor is bumped exactly once per
//! touch.
//!
//! There is no persistence framework underneath, so current signals live in
//! the [`FreshnessTracker`] ledger. Hosts seed it when an entity is first
//! loaded and read it back through [`FreshnessTracker::tracked`] when
//! deriving keys.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use crate::entity::{Cacheable, EntityRef, FreshnessSignal};
use crate::error::CacheError;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "touch";

type ParentResolver = Box<dyn Fn(&EntityRef) -> Option<EntityRef> + Send + Sync>;

struct Edge {
    parent_type: &'static str,
    resolve: ParentResolver,
}

/// Declared child-to-parent edges, keyed by child entity type.
#[derive(Default)]
pub struct DependencyGraph {
    edges: RwLock<HashMap<&'static str, Vec<Edge>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that entities of `child_type` have a parent of `parent_type`,
    /// found through `resolve`. Returns `CyclicDependency` if the edge would
    /// let a type reach itself; the graph is left unchanged in that case.
    ///
    /// `resolve` may return `None` for children without a parent instance
    /// (an orphan simply ends the chain there).
    pub fn declare_edge(
        &self,
        child_type: &'static str,
        parent_type: &'static str,
        resolve: impl Fn(&EntityRef) -> Option<EntityRef> + Send + Sync + 'static,
    ) -> Result<(), CacheError> {
        let mut edges = rw_write(&self.edges, SOURCE, "declare_edge");
        if child_type == parent_type || reaches(&edges, parent_type, child_type) {
            return Err(CacheError::CyclicDependency {
                child: child_type,
                parent: parent_type,
            });
        }
        edges.entry(child_type).or_default().push(Edge {
            parent_type,
            resolve: Box::new(resolve),
        });
        tracing::debug!(child = child_type, parent = parent_type, "dependency edge declared");
        Ok(())
    }

    /// Parent types declared for `child_type`, in declaration order.
    pub fn parent_types(&self, child_type: &str) -> Vec<&'static str> {
        rw_read(&self.edges, SOURCE, "parent_types")
            .get(child_type)
            .map(|out| out.iter().map(|edge| edge.parent_type).collect())
            .unwrap_or_default()
    }

    /// Resolve the parent instances of `child`. Resolvers run under the
    /// graph read lock and must not declare edges.
    fn parents_of(&self, child: &EntityRef) -> Vec<EntityRef> {
        rw_read(&self.edges, SOURCE, "parents_of")
            .get(child.entity_type)
            .map(|out| out.iter().filter_map(|edge| (edge.resolve)(child)).collect())
            .unwrap_or_default()
    }
}

/// Would `to` be reachable from `from` over the declared type edges?
fn reaches(edges: &HashMap<&'static str, Vec<Edge>>, from: &'static str, to: &'static str) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(out) = edges.get(current) {
            stack.extend(out.iter().map(|edge| edge.parent_type));
        }
    }
    false
}

/// Ledger of current freshness signals per entity instance.
#[derive(Debug, Default)]
pub struct FreshnessTracker {
    signals: DashMap<EntityRef, FreshnessSignal>,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the signal for an entity as loaded from the host's system of
    /// record. Overwrites whatever the ledger held.
    pub fn seed(&self, entity: EntityRef, signal: FreshnessSignal) {
        self.signals.insert(entity, signal);
    }

    pub fn signal(&self, entity: &EntityRef) -> Option<FreshnessSignal> {
        self.signals.get(entity).map(|slot| *slot.value())
    }

    /// Advance the signal for `entity`, creating one if the ledger has
    /// never seen it. The result always differs from the previous signal,
    /// whatever the clock does.
    pub fn bump(&self, entity: &EntityRef, at: OffsetDateTime) -> FreshnessSignal {
        match self.signals.entry(entity.clone()) {
            Entry::Vacant(slot) => {
                let signal = FreshnessSignal::Timestamp(at);
                slot.insert(signal);
                signal
            }
            Entry::Occupied(mut slot) => {
                let next = slot.get().bumped(at);
                *slot.get_mut() = next;
                next
            }
        }
    }

    /// A view of `entity` that reads its freshness from this ledger, for
    /// handing to the key deriver. Unseeded entities derive with a zero
    /// version signal, so their keys are stable until the first touch.
    pub fn tracked(&self, entity: EntityRef) -> Tracked<'_> {
        Tracked {
            tracker: self,
            entity,
        }
    }

    pub fn clear(&self) {
        self.signals.clear();
    }
}

/// [`Cacheable`] view over a ledger entry; see [`FreshnessTracker::tracked`].
pub struct Tracked<'a> {
    tracker: &'a FreshnessTracker,
    entity: EntityRef,
}

impl Cacheable for Tracked<'_> {
    fn cache_prefix(&self) -> &'static str {
        self.entity.entity_type
    }

    fn cache_id(&self) -> String {
        self.entity.id.clone()
    }

    fn freshness(&self) -> FreshnessSignal {
        self.tracker
            .signal(&self.entity)
            .unwrap_or(FreshnessSignal::Version(0))
    }
}

/// Graph plus ledger: the full touch-chain mechanism.
#[derive(Default)]
pub struct TouchPropagator {
    graph: DependencyGraph,
    tracker: FreshnessTracker,
}

impl TouchPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_edge(
        &self,
        child_type: &'static str,
        parent_type: &'static str,
        resolve: impl Fn(&EntityRef) -> Option<EntityRef> + Send + Sync + 'static,
    ) -> Result<(), CacheError> {
        self.graph.declare_edge(child_type, parent_type, resolve)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn tracker(&self) -> &FreshnessTracker {
        &self.tracker
    }

    /// Bump `entity` and every transitive parent at `at`. Returns the
    /// bumped refs, the touched entity first, each exactly once even when
    /// paths converge. Runs synchronously; once this returns, keys derived
    /// from any returned ref differ from all previously derived ones.
    pub fn touch(&self, entity: &EntityRef, at: OffsetDateTime) -> Vec<EntityRef> {
        let mut bumped = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([entity.clone()]);

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            self.tracker.bump(&current, at);
            queue.extend(self.graph.parents_of(&current));
            bumped.push(current);
        }

        tracing::debug!(entity = %entity, bumped = bumped.len(), "touch propagated");
        bumped
    }
}
