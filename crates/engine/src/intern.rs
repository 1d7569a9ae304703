//! Opt-in hash-consing of expressions.
//!
//! Interning makes structurally equal subtrees share one allocation, which
//! turns later equality checks into pointer comparisons. The table is
//! owned by one execution and never shared between threads.

use rustc_hash::FxHashSet;

use crate::expr::Expr;

#[derive(Debug, Default)]
pub struct InternTable {
    nodes: FxHashSet<Expr>,
    hits: usize,
    misses: usize,
}

impl InternTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical node for `e`, interning children first.
    pub fn intern(&mut self, e: &Expr) -> Expr {
        if let Some(existing) = self.nodes.get(e) {
            if existing.ptr_eq(e) || e.children().is_empty() {
                self.hits += 1;
                return existing.clone();
            }
        }
        let rebuilt = e.map_children(|c| self.intern(c));
        if let Some(existing) = self.nodes.get(&rebuilt) {
            self.hits += 1;
            return existing.clone();
        }
        self.misses += 1;
        self.nodes.insert(rebuilt.clone());
        rebuilt
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}
