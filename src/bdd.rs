//! The BDD manager.
//!
//! All Boolean functions of an analysis live in one [`Bdd`]: nodes are
//! hash-consed in a unique table, so two structurally equal functions are
//! always represented by the same [`Ref`]. Complement edges make negation free.
//!
//! The variable order is the order of variable ids and never changes.
//! Variables are handed out monotonically by [`Bdd::new_var`] and
//! [`Bdd::allocate_vars`].
//!
//! # Garbage collection
//!
//! [`Bdd::collect_garbage`] frees every node not reachable from the given
//! roots or from a pinned node. Single-variable nodes are pinned when
//! created, and long-lived predicates can be pinned with [`Bdd::pin`], so
//! field bits and domain constraints held by a registry survive collection.
//! Memo tables of compilers do not: build new compilers after collecting.
//!
//! # Threading
//!
//! The manager relies on `RefCell`/`Cell` interior mutability and is not
//! `Sync`. One manager belongs to one analysis; analyses running in parallel
//! must each own their manager. Handles from one manager are meaningless in
//! another.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Debug;

use log::{debug, trace};

use crate::cache::Cache;
use crate::node::Node;
use crate::reference::Ref;
use crate::table::Table;
use crate::types::{Lit, Var};

type Storage = Table<Node>;

/// Level used for terminals: below every variable.
const TERMINAL_LEVEL: u32 = u32::MAX;

/// Sizing knobs for a [`Bdd`] manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BddConfig {
    /// Initial unique-table size is `2^storage_bits` nodes.
    pub storage_bits: usize,
    /// Initial computed-table size is `2^cache_bits` entries.
    pub cache_bits: usize,
}

impl Default for BddConfig {
    fn default() -> Self {
        Self {
            storage_bits: 20,
            cache_bits: 16,
        }
    }
}

impl BddConfig {
    pub fn with_storage_bits(mut self, bits: usize) -> Self {
        self.storage_bits = bits;
        self
    }

    pub fn with_cache_bits(mut self, bits: usize) -> Self {
        self.cache_bits = bits;
        self
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum OpKey {
    Ite(Ref, Ref, Ref),
}

pub struct Bdd {
    storage: RefCell<Storage>,
    cache: RefCell<Cache<OpKey, Ref>>,
    num_vars: Cell<u32>,
    pinned: RefCell<HashSet<usize>>,
    zero: Ref,
    one: Ref,
}

impl Bdd {
    pub fn new(storage_bits: usize) -> Self {
        Self::with_config(BddConfig::default().with_storage_bits(storage_bits))
    }

    pub fn with_config(config: BddConfig) -> Self {
        assert!(
            config.storage_bits <= 31,
            "Storage bits should be in the range 0..=31"
        );
        debug!("Creating BDD manager with {:?}", config);

        let mut storage = Storage::new(config.storage_bits);

        // Allocate the terminal node:
        let one = storage.put(Node::default());
        assert_eq!(one, 1); // Make sure the terminal node is (1).
        let one = Ref::positive(one as u32);
        let zero = -one;

        Self {
            storage: RefCell::new(storage),
            cache: RefCell::new(Cache::new(config.cache_bits)),
            num_vars: Cell::new(0),
            pinned: RefCell::new(HashSet::new()),
            zero,
            one,
        }
    }
}

impl Default for Bdd {
    fn default() -> Self {
        Bdd::with_config(BddConfig::default())
    }
}

impl Debug for Bdd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let storage = self.storage.borrow();
        f.debug_struct("Bdd")
            .field("num_vars", &self.num_vars.get())
            .field("capacity", &storage.capacity())
            .field("size", &storage.size())
            .field("real_size", &storage.real_size())
            .finish()
    }
}

impl Bdd {
    pub fn zero(&self) -> Ref {
        self.zero
    }
    pub fn one(&self) -> Ref {
        self.one
    }

    pub fn is_zero(&self, node: Ref) -> bool {
        node == self.zero
    }
    pub fn is_one(&self, node: Ref) -> bool {
        node == self.one
    }
    pub fn is_terminal(&self, node: Ref) -> bool {
        node.index() == self.one.index()
    }

    /// Constant function for a Boolean value.
    pub fn constant(&self, value: bool) -> Ref {
        if value {
            self.one
        } else {
            self.zero
        }
    }

    /// Number of variables allocated so far.
    pub fn num_vars(&self) -> u32 {
        self.num_vars.get()
    }

    /// Allocate a fresh variable, placed after all existing ones in the order.
    pub fn new_var(&self) -> Var {
        let id = self.num_vars.get() + 1;
        self.num_vars.set(id);
        Var::new(id)
    }

    /// Allocate `n` consecutive fresh variables.
    pub fn allocate_vars(&self, n: usize) -> Vec<Var> {
        (0..n).map(|_| self.new_var()).collect()
    }

    /// Number of live nodes in the unique table (terminal included).
    pub fn num_nodes(&self) -> usize {
        self.storage.borrow().real_size()
    }

    pub fn cache_hits(&self) -> usize {
        self.cache.borrow().hits()
    }

    fn node(&self, index: usize) -> Node {
        *self.storage.borrow().value(index)
    }

    /// Raw variable id at the node, `0` for terminals.
    pub fn variable(&self, node: Ref) -> u32 {
        self.node(node.index()).variable
    }

    /// Decision variable at the node, `None` for terminals.
    pub fn var_of(&self, node: Ref) -> Option<Var> {
        if self.is_terminal(node) {
            None
        } else {
            Some(Var::new(self.variable(node)))
        }
    }

    fn level(&self, node: Ref) -> u32 {
        if self.is_terminal(node) {
            TERMINAL_LEVEL
        } else {
            self.variable(node)
        }
    }

    pub fn low_node(&self, node: Ref) -> Ref {
        let low = self.node(node.index()).low;
        if node.is_negated() {
            -low
        } else {
            low
        }
    }
    pub fn high_node(&self, node: Ref) -> Ref {
        let high = self.node(node.index()).high;
        if node.is_negated() {
            -high
        } else {
            high
        }
    }

    pub fn mk_node(&self, v: Var, low: Ref, high: Ref) -> Ref {
        trace!("mk(v = {}, low = {}, high = {})", v, low, high);

        // Handle canonicity
        if high.is_negated() {
            return -self.mk_node(v, -low, -high);
        }

        // Handle duplicates
        if low == high {
            return low;
        }

        debug_assert!(v.id() < self.level(low), "Variable order violated");
        debug_assert!(v.id() < self.level(high), "Variable order violated");

        let i = self.storage.borrow_mut().put(Node {
            variable: v.id(),
            low,
            high,
        });
        Ref::positive(i as u32)
    }

    pub fn mk_var(&self, v: Var) -> Ref {
        assert!(v.id() <= self.num_vars.get(), "Variable {} is not allocated", v);
        self.pin(self.mk_node(v, self.zero, self.one))
    }

    /// Keep `f` alive across every later garbage collection.
    pub fn pin(&self, f: Ref) -> Ref {
        if !self.is_terminal(f) {
            self.pinned.borrow_mut().insert(f.index());
        }
        f
    }

    pub fn is_pinned(&self, f: Ref) -> bool {
        self.is_terminal(f) || self.pinned.borrow().contains(&f.index())
    }

    pub fn mk_lit(&self, lit: Lit) -> Ref {
        let x = self.mk_var(lit.var());
        if lit.is_negated() {
            -x
        } else {
            x
        }
    }

    /// Conjunction of the given literals.
    pub fn mk_cube(&self, literals: impl IntoIterator<Item = impl Into<Lit>>) -> Ref {
        let mut literals: Vec<Lit> = literals.into_iter().map(Into::into).collect();
        literals.sort_by_key(|lit| std::cmp::Reverse(lit.var()));
        let mut current = self.one;
        for lit in literals {
            current = if lit.is_negated() {
                self.mk_node(lit.var(), current, self.zero)
            } else {
                self.mk_node(lit.var(), self.zero, current)
            };
        }
        current
    }

    fn top_cofactors(&self, node: Ref, v: u32) -> (Ref, Ref) {
        if self.level(node) > v {
            return (node, node);
        }
        debug_assert_eq!(v, self.variable(node));
        (self.low_node(node), self.high_node(node))
    }

    /// Apply the ITE operation to the arguments.
    ///
    /// ```text
    /// ITE(x, y, z) = (x ∧ y) ∨ (¬x ∧ z)
    /// ```
    pub fn apply_ite(&self, f: Ref, g: Ref, h: Ref) -> Ref {
        trace!("apply_ite(f = {}, g = {}, h = {})", f, g, h);

        // Base cases:
        //   ite(1,G,H) => G
        //   ite(0,G,H) => H
        if self.is_one(f) {
            return g;
        }
        if self.is_zero(f) {
            return h;
        }

        // More base cases:
        //   ite(F,G,G) => G
        //   ite(F,1,0) => F
        //   ite(F,0,1) => ~F
        //   ite(F,1,~F) => 1
        //   ite(F,F,1) => 1
        //   ite(F,~F,0) => 0
        //   ite(F,0,F) => 0
        if g == h {
            return g;
        }
        if self.is_one(g) && self.is_zero(h) {
            return f;
        }
        if self.is_zero(g) && self.is_one(h) {
            return -f;
        }
        if self.is_one(g) && h == -f {
            return self.one;
        }
        if g == f && self.is_one(h) {
            return self.one;
        }
        if g == -f && self.is_zero(h) {
            return self.zero;
        }
        if self.is_zero(g) && h == f {
            return self.zero;
        }

        // Standard triples:
        //   ite(F,F,H) => ite(F,1,H)
        //   ite(F,G,F) => ite(F,G,0)
        //   ite(F,~F,H) => ite(F,0,H)
        //   ite(F,G,~F) => ite(F,G,1)
        if g == f {
            return self.apply_ite(f, self.one, h);
        }
        if h == f {
            return self.apply_ite(f, g, self.zero);
        }
        if g == -f {
            return self.apply_ite(f, self.zero, h);
        }
        if h == -f {
            return self.apply_ite(f, g, self.one);
        }

        let i = self.level(f);
        let j = self.level(g);
        let k = self.level(h);

        // Equivalent pairs (choose the one with the lowest top variable):
        //   ite(F,1,H) == ite(H,1,F) == F ∨ H
        //   ite(F,G,0) == ite(G,F,0) == F ∧ G
        //   ite(F,G,1) == ite(~G,~F,1) == F -> G
        //   ite(F,0,H) == ite(~H,0,~F) == ~F ∧ H
        //   ite(F,G,~G) == ite(G,F,~F)
        if self.is_one(g) && k < i {
            return self.apply_ite(h, self.one, f);
        }
        if self.is_zero(h) && j < i {
            return self.apply_ite(g, f, self.zero);
        }
        if self.is_one(h) && j < i {
            return self.apply_ite(-g, -f, self.one);
        }
        if self.is_zero(g) && k < i {
            return self.apply_ite(-h, self.zero, -f);
        }
        if g == -h && j < i {
            return self.apply_ite(g, f, -f);
        }

        // Make sure the first two pointers (f and g) are regular (not negated)
        let (mut f, mut g, mut h) = (f, g, h);

        // ite(~F,G,H) => ite(F,H,G)
        if f.is_negated() {
            f = -f;
            std::mem::swap(&mut g, &mut h);
        }

        // ite(F,~G,H) => ~ite(F,G,~H)
        let mut n = false;
        if g.is_negated() {
            n = true;
            g = -g;
            h = -h;
        }

        let key = OpKey::Ite(f, g, h);
        if let Some(&res) = self.cache.borrow_mut().get(&key) {
            return if n { -res } else { res };
        }

        // Determine the top variable:
        let m = i.min(j).min(k);
        debug_assert_ne!(m, TERMINAL_LEVEL);

        let (f0, f1) = self.top_cofactors(f, m);
        let (g0, g1) = self.top_cofactors(g, m);
        let (h0, h1) = self.top_cofactors(h, m);

        let e = self.apply_ite(f0, g0, h0);
        let t = self.apply_ite(f1, g1, h1);

        let res = self.mk_node(Var::new(m), e, t);
        self.cache.borrow_mut().insert(key, res);

        if n {
            -res
        } else {
            res
        }
    }

    pub fn apply_not(&self, f: Ref) -> Ref {
        -f
    }

    pub fn apply_and(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, v, self.zero)
    }

    pub fn apply_or(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, self.one, v)
    }

    pub fn apply_xor(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, -v, v)
    }

    pub fn apply_eq(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, v, -v)
    }

    pub fn apply_imply(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, v, self.one)
    }

    /// `u ∧ ¬v`
    pub fn apply_diff(&self, u: Ref, v: Ref) -> Ref {
        self.apply_ite(u, -v, self.zero)
    }

    /// Conjunction of all `nodes`; the empty conjunction is ONE.
    ///
    /// Stops at the first ZERO.
    pub fn apply_and_many(&self, nodes: impl IntoIterator<Item = Ref>) -> Ref {
        let mut res = self.one;
        for node in nodes {
            if self.is_zero(node) {
                return self.zero;
            }
            if self.is_one(node) {
                continue;
            }
            res = self.apply_and(res, node);
            if self.is_zero(res) {
                return self.zero;
            }
        }
        res
    }

    /// Disjunction of all `nodes`; the empty disjunction is ZERO.
    ///
    /// Stops at the first ONE.
    pub fn apply_or_many(&self, nodes: impl IntoIterator<Item = Ref>) -> Ref {
        let mut res = self.zero;
        for node in nodes {
            if self.is_one(node) {
                return self.one;
            }
            if self.is_zero(node) {
                continue;
            }
            res = self.apply_or(res, node);
            if self.is_one(res) {
                return self.one;
            }
        }
        res
    }

    /// Whether `f` implies `g`, i.e. the set of `f` is a subset of `g`.
    pub fn is_implies(&self, f: Ref, g: Ref) -> bool {
        self.is_zero(self.apply_diff(f, g))
    }

    /// Whether `f ∧ g` is satisfiable.
    pub fn intersects(&self, f: Ref, g: Ref) -> bool {
        !self.is_zero(self.apply_and(f, g))
    }

    /// Existential quantification: `∃ vars. f`.
    pub fn exists(&self, f: Ref, vars: &[Var]) -> Ref {
        if vars.is_empty() {
            return f;
        }
        let set: HashSet<u32> = vars.iter().map(|v| v.id()).collect();
        let max = set.iter().copied().max().unwrap_or(0);
        let mut cache = HashMap::new();
        self.exists_(f, &set, max, &mut cache)
    }

    fn exists_(&self, f: Ref, vars: &HashSet<u32>, max: u32, cache: &mut HashMap<Ref, Ref>) -> Ref {
        let i = self.level(f);
        if i > max {
            // terminal, or 'f' does not depend on any quantified variable
            return f;
        }
        if let Some(&res) = cache.get(&f) {
            return res;
        }
        let low = self.exists_(self.low_node(f), vars, max, cache);
        let high = self.exists_(self.high_node(f), vars, max, cache);
        let res = if vars.contains(&i) {
            self.apply_or(low, high)
        } else {
            self.mk_node(Var::new(i), low, high)
        };
        cache.insert(f, res);
        res
    }

    /// Universal quantification: `∀ vars. f`.
    pub fn forall(&self, f: Ref, vars: &[Var]) -> Ref {
        -self.exists(-f, vars)
    }

    /// Cofactor of `f` with respect to a partial assignment.
    pub fn restrict(&self, f: Ref, values: &HashMap<Var, bool>) -> Ref {
        let mut cache = HashMap::new();
        self.restrict_(f, values, &mut cache)
    }

    fn restrict_(&self, f: Ref, values: &HashMap<Var, bool>, cache: &mut HashMap<Ref, Ref>) -> Ref {
        if self.is_terminal(f) || values.is_empty() {
            return f;
        }
        if let Some(&res) = cache.get(&f) {
            return res;
        }

        let v = Var::new(self.variable(f));
        let res = match values.get(&v) {
            Some(true) => self.restrict_(self.high_node(f), values, cache),
            Some(false) => self.restrict_(self.low_node(f), values, cache),
            None => {
                let low = self.restrict_(self.low_node(f), values, cache);
                let high = self.restrict_(self.high_node(f), values, cache);
                self.mk_node(v, low, high)
            }
        };
        cache.insert(f, res);
        res
    }

    /// Evaluate `f` under an assignment. Unassigned variables read as false.
    pub fn eval(&self, f: Ref, values: &HashMap<Var, bool>) -> bool {
        let mut current = f;
        while !self.is_terminal(current) {
            let v = Var::new(self.variable(current));
            current = if values.get(&v).copied().unwrap_or(false) {
                self.high_node(current)
            } else {
                self.low_node(current)
            };
        }
        self.is_one(current)
    }

    /// Set of variables `f` depends on.
    pub fn support(&self, f: Ref) -> BTreeSet<Var> {
        let mut visited = HashSet::new();
        let mut support = BTreeSet::new();
        let mut stack = vec![f.regular()];
        while let Some(node) = stack.pop() {
            if self.is_terminal(node) || !visited.insert(node.index()) {
                continue;
            }
            support.insert(Var::new(self.variable(node)));
            stack.push(self.low_node(node).regular());
            stack.push(self.high_node(node).regular());
        }
        support
    }

    /// Indices of all nodes reachable from `nodes`, terminal included.
    pub fn descendants(&self, nodes: impl IntoIterator<Item = Ref>) -> HashSet<usize> {
        let mut visited = HashSet::new();
        visited.insert(self.one.index());
        let mut stack: Vec<Ref> = nodes.into_iter().collect();

        while let Some(node) = stack.pop() {
            if visited.insert(node.index()) {
                stack.push(self.low_node(node));
                stack.push(self.high_node(node));
            }
        }

        visited
    }

    /// Number of nodes in the graph of `f`, terminal included.
    pub fn size(&self, f: Ref) -> usize {
        self.descendants([f]).len()
    }

    /// Free every node not reachable from `roots` or from a pinned node.
    ///
    /// Handles to freed nodes become dangling: only `roots`, pinned
    /// functions, and functions built from them afterwards stay valid.
    pub fn collect_garbage(&self, roots: &[Ref]) {
        debug!("Collecting garbage...");

        self.cache.borrow_mut().clear();

        let pinned: Vec<Ref> = self
            .pinned
            .borrow()
            .iter()
            .map(|&i| Ref::positive(i as u32))
            .collect();
        let alive = self.descendants(roots.iter().copied().chain(pinned));
        let mut storage = self.storage.borrow_mut();
        let before = storage.real_size();
        for i in 1..=storage.size() {
            if storage.is_occupied(i) && !alive.contains(&i) {
                storage.drop(i);
            }
        }
        storage.rebuild();

        debug!(
            "Garbage collected: {} -> {} nodes",
            before,
            storage.real_size()
        );
    }

    pub fn to_bracket_string(&self, node: Ref) -> String {
        if self.is_zero(node) {
            return "(0)".to_string();
        } else if self.is_one(node) {
            return "(1)".to_string();
        }

        let v = self.variable(node);
        let low = self.low_node(node);
        let high = self.high_node(node);

        format!(
            "{}:(x{}, {}, {})",
            node,
            v,
            self.to_bracket_string(high),
            self.to_bracket_string(low)
        )
    }
}
