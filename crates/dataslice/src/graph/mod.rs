//! Dependency graph over registered entity types.
//!
//! This module provides:
//! - Graph construction from the foreign-key relations in a [`SchemaRegistry`]
//! - Cycle detection naming every member of the cycle
//! - Deterministic topological ordering (Kahn's algorithm, earliest
//!   registration first among ready nodes)
//! - Memoized transitive dependencies
//! - Strongly connected components, used for deferred-constraint loading
//!
//! Edges point from the dependent entity to the entity it references.
//! Self-references are recorded but never influence ordering.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::registry::SchemaRegistry;
use crate::core::schema::{ColumnRef, EntityType};
use crate::error::{Result, SliceError};

/// A foreign-key edge: `from.field` references `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: EntityType,
    pub field: String,
    pub to: EntityType,
}

impl Edge {
    pub fn column(&self) -> ColumnRef {
        ColumnRef::new(self.from.clone(), self.field.clone())
    }

    pub fn is_self_reference(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.from, self.field, self.to)
    }
}

/// Result of [`DependencyGraph::compute_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOrder {
    /// Every registered entity, dependencies first.
    pub order: Vec<EntityType>,
    /// Edges removed through the excluded-columns override.
    pub dropped_edges: Vec<Edge>,
}

impl ExecutionOrder {
    pub fn position(&self, entity: &EntityType) -> Option<usize> {
        self.order.iter().position(|e| e == entity)
    }
}

#[derive(Debug, Clone)]
struct IndexedEdge {
    from: usize,
    field: String,
    to: usize,
}

/// Dependency graph for a fixed set of registered entities.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Nodes in registration order; the index doubles as the tie-break rank.
    nodes: Vec<EntityType>,
    index: HashMap<EntityType, usize>,
    edges: Vec<IndexedEdge>,
    closure: Vec<OnceLock<BTreeSet<EntityType>>>,
}

impl DependencyGraph {
    /// Build the graph from every relation in the registry.
    ///
    /// Fails with `UnresolvedRelation` if a relation targets an entity that
    /// is not registered.
    pub fn build(registry: &SchemaRegistry) -> Result<Self> {
        let nodes: Vec<EntityType> = registry.iter().map(|d| d.entity.clone()).collect();
        let index: HashMap<EntityType, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, e)| (e.clone(), i))
            .collect();

        let mut edges = Vec::new();
        for (from, descriptor) in registry.iter().enumerate() {
            for relation in &descriptor.relations {
                let to = *index.get(&relation.target).ok_or_else(|| {
                    SliceError::UnresolvedRelation {
                        entity: descriptor.entity.clone(),
                        field: relation.field.clone(),
                        target: relation.target.clone(),
                    }
                })?;
                edges.push(IndexedEdge {
                    from,
                    field: relation.field.clone(),
                    to,
                });
            }
        }

        debug!(
            "Built dependency graph: {} entities, {} relations",
            nodes.len(),
            edges.len()
        );

        let closure = nodes.iter().map(|_| OnceLock::new()).collect();
        Ok(Self {
            nodes,
            index,
            edges,
            closure,
        })
    }

    /// Entities in registration order.
    pub fn entities(&self) -> &[EntityType] {
        &self.nodes
    }

    pub fn contains(&self, entity: &EntityType) -> bool {
        self.index.contains_key(entity)
    }

    /// All edges, self-references included, in declaration order.
    pub fn edges(&self) -> Vec<Edge> {
        self.edges.iter().map(|e| self.edge(e)).collect()
    }

    fn edge(&self, e: &IndexedEdge) -> Edge {
        Edge {
            from: self.nodes[e.from].clone(),
            field: e.field.clone(),
            to: self.nodes[e.to].clone(),
        }
    }

    fn node(&self, entity: &EntityType) -> Result<usize> {
        self.index
            .get(entity)
            .copied()
            .ok_or_else(|| SliceError::UnregisteredEntity(entity.clone()))
    }

    /// Entities `entity` references directly, excluding itself.
    pub fn direct_dependencies(&self, entity: &EntityType) -> Result<BTreeSet<EntityType>> {
        let n = self.node(entity)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| e.from == n && e.to != n)
            .map(|e| self.nodes[e.to].clone())
            .collect())
    }

    /// Entities that reference `entity` directly, excluding itself.
    pub fn dependents(&self, entity: &EntityType) -> Result<BTreeSet<EntityType>> {
        let n = self.node(entity)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| e.to == n && e.from != n)
            .map(|e| self.nodes[e.from].clone())
            .collect())
    }

    pub fn is_self_referencing(&self, entity: &EntityType) -> bool {
        self.index
            .get(entity)
            .is_some_and(|&n| self.edges.iter().any(|e| e.from == n && e.to == n))
    }

    /// Transitive dependencies of `entity` (never including itself),
    /// computed once per node.
    pub fn dependencies_of(&self, entity: &EntityType) -> Result<&BTreeSet<EntityType>> {
        let n = self.node(entity)?;
        Ok(self.closure[n].get_or_init(|| {
            let mut seen = vec![false; self.nodes.len()];
            let mut stack = vec![n];
            seen[n] = true;
            let mut deps = BTreeSet::new();
            while let Some(current) = stack.pop() {
                for e in self.edges.iter().filter(|e| e.from == current) {
                    if !seen[e.to] {
                        seen[e.to] = true;
                        deps.insert(self.nodes[e.to].clone());
                        stack.push(e.to);
                    }
                }
            }
            deps
        }))
    }

    /// Check that every excluded column names a relation in the graph.
    pub fn check_exclusions(&self, excluded: &BTreeSet<ColumnRef>) -> Result<()> {
        for column in excluded {
            let known = self.index.get(&column.entity).is_some_and(|&n| {
                self.edges
                    .iter()
                    .any(|e| e.from == n && e.field == column.field)
            });
            if !known {
                return Err(SliceError::InvalidExclusion(column.to_string()));
            }
        }
        Ok(())
    }

    fn is_excluded(&self, e: &IndexedEdge, excluded: &BTreeSet<ColumnRef>) -> bool {
        excluded
            .iter()
            .any(|c| c.field == e.field && c.entity == self.nodes[e.from])
    }

    /// Adjacency over edges that take part in ordering.
    fn active_adjacency(&self, excluded: &BTreeSet<ColumnRef>) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.nodes.len()];
        for e in &self.edges {
            if e.from != e.to && !self.is_excluded(e, excluded) && !adj[e.from].contains(&e.to) {
                adj[e.from].push(e.to);
            }
        }
        adj
    }

    /// Find a cycle among distinct entities, ignoring self-references and
    /// excluded edges.
    ///
    /// Returns the cycle path with the first member repeated at the end.
    pub fn find_cycle(&self, excluded: &BTreeSet<ColumnRef>) -> Option<Vec<EntityType>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let adj = self.active_adjacency(excluded);
        let mut marks = vec![Mark::White; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::White {
                continue;
            }
            // (node, next neighbour to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::Gray;

            while let Some(&(node, next)) = stack.last() {
                if let Some(&to) = adj[node].get(next) {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match marks[to] {
                        Mark::White => {
                            marks[to] = Mark::Gray;
                            stack.push((to, 0));
                        }
                        Mark::Gray => {
                            let begin = stack.iter().position(|&(n, _)| n == to).unwrap_or(0);
                            let mut cycle: Vec<EntityType> = stack[begin..]
                                .iter()
                                .map(|&(n, _)| self.nodes[n].clone())
                                .collect();
                            cycle.push(self.nodes[to].clone());
                            return Some(cycle);
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[node] = Mark::Black;
                    stack.pop();
                }
            }
        }
        None
    }

    /// Compute the execution order.
    ///
    /// Excluded edges are dropped first. Any remaining cycle fails with
    /// `CircularDependency`. Members of a broken cycle are kept contiguous so
    /// they can be loaded as one group.
    pub fn compute_order(&self, excluded: &BTreeSet<ColumnRef>) -> Result<ExecutionOrder> {
        self.check_exclusions(excluded)?;
        if let Some(cycle) = self.find_cycle(excluded) {
            return Err(SliceError::CircularDependency { cycle });
        }

        let adj = self.active_adjacency(excluded);
        let components = self.components();
        let mut component_of = vec![0usize; self.nodes.len()];
        for (c, members) in components.iter().enumerate() {
            for &m in members {
                component_of[m] = c;
            }
        }

        // Kahn over components; rank = earliest registration among members.
        let rank: Vec<usize> = components
            .iter()
            .map(|m| m.iter().copied().min().unwrap_or(usize::MAX))
            .collect();
        let mut pending = vec![0usize; components.len()];
        let mut waiting_on_me: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
        for (from, targets) in adj.iter().enumerate() {
            for &to in targets {
                let (cf, ct) = (component_of[from], component_of[to]);
                if cf != ct && !waiting_on_me[ct].contains(&cf) {
                    waiting_on_me[ct].push(cf);
                    pending[cf] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = pending
            .iter()
            .enumerate()
            .filter(|(_, &p)| p == 0)
            .map(|(c, _)| Reverse((rank[c], c)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, c))) = ready.pop() {
            for n in self.order_within(&components[c], &adj) {
                order.push(self.nodes[n].clone());
            }
            for &dependent in &waiting_on_me[c] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse((rank[dependent], dependent)));
                }
            }
        }

        let dropped_edges = self
            .edges
            .iter()
            .filter(|e| self.is_excluded(e, excluded))
            .map(|e| self.edge(e))
            .collect();

        Ok(ExecutionOrder {
            order,
            dropped_edges,
        })
    }

    /// Kahn inside one component over the active edges.
    fn order_within(&self, members: &[usize], adj: &[Vec<usize>]) -> Vec<usize> {
        if members.len() == 1 {
            return members.to_vec();
        }
        let mut pending: HashMap<usize, usize> = members.iter().map(|&m| (m, 0)).collect();
        for &m in members {
            let count = adj[m].iter().filter(|t| pending.contains_key(t)).count();
            pending.insert(m, count);
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .filter(|(_, &p)| p == 0)
            .map(|(&m, _)| Reverse(m))
            .collect();
        let mut out = Vec::with_capacity(members.len());
        while let Some(Reverse(n)) = ready.pop() {
            out.push(n);
            for &m in members {
                if adj[m].contains(&n) {
                    if let Some(p) = pending.get_mut(&m) {
                        *p -= 1;
                        if *p == 0 {
                            ready.push(Reverse(m));
                        }
                    }
                }
            }
        }
        out
    }

    /// Strongly connected components over all non-self edges (Tarjan).
    /// Members are sorted by registration index.
    fn components(&self) -> Vec<Vec<usize>> {
        struct Tarjan<'a> {
            adj: &'a [Vec<usize>],
            index: Vec<Option<usize>>,
            low: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            next: usize,
            out: Vec<Vec<usize>>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.index[v] = Some(self.next);
                self.low[v] = self.next;
                self.next += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                for &w in &self.adj[v] {
                    match self.index[w] {
                        None => {
                            self.visit(w);
                            self.low[v] = self.low[v].min(self.low[w]);
                        }
                        Some(iw) if self.on_stack[w] => {
                            self.low[v] = self.low[v].min(iw);
                        }
                        Some(_) => {}
                    }
                }

                if Some(self.low[v]) == self.index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    self.out.push(component);
                }
            }
        }

        let adj = self.active_adjacency(&BTreeSet::new());
        let n = self.nodes.len();
        let mut t = Tarjan {
            adj: &adj,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            out: Vec::new(),
        };
        for v in 0..n {
            if t.index[v].is_none() {
                t.visit(v);
            }
        }
        t.out
    }

    /// Groups of two or more entities that reference each other in a cycle,
    /// members in registration order.
    pub fn cyclic_groups(&self) -> Vec<Vec<EntityType>> {
        let mut groups: Vec<Vec<usize>> = self
            .components()
            .into_iter()
            .filter(|c| c.len() > 1)
            .collect();
        groups.sort_by_key(|c| c[0]);
        groups
            .into_iter()
            .map(|c| c.into_iter().map(|n| self.nodes[n].clone()).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{EntityDescriptor, FieldKind};

    fn entity(name: &str, fks: &[(&str, &str)]) -> EntityDescriptor {
        let mut b = EntityDescriptor::builder(name).field("id", FieldKind::BigInt);
        for (field, target) in fks {
            b = b.nullable_foreign_key(*field, *target);
        }
        b.build()
    }

    fn registry(entities: Vec<EntityDescriptor>) -> SchemaRegistry {
        let mut r = SchemaRegistry::new();
        r.register_all(entities).unwrap();
        r
    }

    fn names(order: &[EntityType]) -> Vec<&str> {
        order.iter().map(|e| e.as_str()).collect()
    }

    fn none() -> BTreeSet<ColumnRef> {
        BTreeSet::new()
    }

    #[test]
    fn test_topological_sort_simple() {
        let r = registry(vec![
            entity("Shop", &[("tenant_id", "Tenant")]),
            entity("Tenant", &[]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let order = g.compute_order(&none()).unwrap();
        assert_eq!(names(&order.order), vec!["Tenant", "Shop"]);
        assert!(order.dropped_edges.is_empty());
    }

    #[test]
    fn test_topological_sort_chain() {
        let r = registry(vec![
            entity("C", &[("b_id", "B")]),
            entity("B", &[("a_id", "A")]),
            entity("A", &[]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        assert_eq!(
            names(&g.compute_order(&none()).unwrap().order),
            vec!["A", "B", "C"]
        );
    }

    #[test]
    fn test_tie_break_follows_registration_order() {
        let r = registry(vec![
            entity("Zebra", &[]),
            entity("Apple", &[]),
            entity("Mango", &[("zebra_id", "Zebra")]),
            entity("Kiwi", &[]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let first = g.compute_order(&none()).unwrap();
        assert_eq!(names(&first.order), vec!["Zebra", "Apple", "Mango", "Kiwi"]);

        // Stable across rebuilds.
        let again = DependencyGraph::build(&r).unwrap().compute_order(&none()).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_self_reference_ignored() {
        let r = registry(vec![
            entity("Category", &[("parent_id", "Category")]),
            entity("Product", &[("category_id", "Category")]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        assert!(g.is_self_referencing(&"Category".into()));
        assert!(g.find_cycle(&none()).is_none());
        assert_eq!(
            names(&g.compute_order(&none()).unwrap().order),
            vec!["Category", "Product"]
        );
        assert!(g.direct_dependencies(&"Category".into()).unwrap().is_empty());
        assert!(g.cyclic_groups().is_empty());
    }

    #[test]
    fn test_cycle_detected_and_named() {
        let r = registry(vec![
            entity("Author", &[("favorite_book", "Book")]),
            entity("Book", &[("author_id", "Author")]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let err = g.compute_order(&none()).unwrap_err();
        match err {
            SliceError::CircularDependency { cycle } => {
                assert_eq!(names(&cycle), vec!["Author", "Book", "Author"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_three_member_cycle_names_all() {
        let r = registry(vec![
            entity("A", &[("b_id", "B")]),
            entity("B", &[("c_id", "C")]),
            entity("C", &[("a_id", "A")]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let cycle = g.find_cycle(&none()).unwrap();
        assert_eq!(names(&cycle), vec!["A", "B", "C", "A"]);
        assert_eq!(g.cyclic_groups().len(), 1);
        assert_eq!(g.cyclic_groups()[0].len(), 3);
    }

    #[test]
    fn test_exclusion_breaks_cycle() {
        let r = registry(vec![
            entity("Author", &[("favorite_book", "Book")]),
            entity("Book", &[("author_id", "Author")]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let excluded: BTreeSet<ColumnRef> = ["Author.favorite_book".parse().unwrap()].into();
        let order = g.compute_order(&excluded).unwrap();
        assert_eq!(names(&order.order), vec!["Author", "Book"]);
        assert_eq!(order.dropped_edges.len(), 1);
        assert_eq!(order.dropped_edges[0].to_string(), "Author.favorite_book -> Book");
        assert_eq!(g.cyclic_groups(), vec![vec![EntityType::new("Author"), EntityType::new("Book")]]);
    }

    #[test]
    fn test_broken_cycle_members_stay_contiguous() {
        let r = registry(vec![
            entity("A", &[("b_id", "B")]),
            entity("C", &[("a_id", "A")]),
            entity("B", &[("a_id", "A")]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let excluded: BTreeSet<ColumnRef> = ["A.b_id".parse().unwrap()].into();
        assert_eq!(
            names(&g.compute_order(&excluded).unwrap().order),
            vec!["A", "B", "C"]
        );
    }

    #[test]
    fn test_invalid_exclusion() {
        let r = registry(vec![entity("Tenant", &[])]);
        let g = DependencyGraph::build(&r).unwrap();
        let excluded: BTreeSet<ColumnRef> = ["Tenant.owner_id".parse().unwrap()].into();
        assert!(matches!(
            g.compute_order(&excluded),
            Err(SliceError::InvalidExclusion(_))
        ));
    }

    #[test]
    fn test_unresolved_relation_is_fatal() {
        let r = registry(vec![entity("Shop", &[("tenant_id", "Tenant")])]);
        let err = DependencyGraph::build(&r).unwrap_err();
        assert!(matches!(err, SliceError::UnresolvedRelation { .. }));
    }

    #[test]
    fn test_dependencies_of_is_transitive() {
        let r = registry(vec![
            entity("A", &[]),
            entity("B", &[("a_id", "A")]),
            entity("C", &[("b_id", "B"), ("self_id", "C")]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let deps = g.dependencies_of(&"C".into()).unwrap();
        assert_eq!(deps.iter().map(|e| e.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        // Memoized: same allocation on the second call.
        assert!(std::ptr::eq(deps, g.dependencies_of(&"C".into()).unwrap()));
        assert_eq!(
            g.dependents(&"A".into()).unwrap().into_iter().collect::<Vec<_>>(),
            vec![EntityType::new("B")]
        );
    }

    #[test]
    fn test_every_entity_after_its_dependencies() {
        let r = registry(vec![
            entity("OrderLine", &[("order_id", "Order"), ("product_id", "Product")]),
            entity("Order", &[("customer_id", "Customer"), ("shop_id", "Shop")]),
            entity("Product", &[("shop_id", "Shop")]),
            entity("Customer", &[("tenant_id", "Tenant")]),
            entity("Shop", &[("tenant_id", "Tenant")]),
            entity("Tenant", &[]),
        ]);
        let g = DependencyGraph::build(&r).unwrap();
        let order = g.compute_order(&none()).unwrap();
        for e in &order.order {
            let pos = order.position(e).unwrap();
            for dep in g.dependencies_of(e).unwrap() {
                assert!(order.position(dep).unwrap() < pos, "{dep} must precede {e}");
            }
        }
    }
}
