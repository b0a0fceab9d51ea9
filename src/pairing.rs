//! Variable-to-variable substitution.
//!
//! A [`Pairing`] maps variables to variables. [`Bdd::replace`] applies all of
//! them at once, so a pairing that maps `a -> b` and `b -> a` swaps the two.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::bdd::Bdd;
use crate::reference::Ref;
use crate::types::Var;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Pairing {
    map: BTreeMap<Var, Var>,
}

impl Pairing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairing that maps `from[i]` to `to[i]`.
    ///
    /// # Panics
    ///
    /// Panics if the slices differ in length.
    pub fn from_vars(from: &[Var], to: &[Var]) -> Self {
        assert_eq!(from.len(), to.len(), "Paired variable lists must have equal length");
        let map = from.iter().copied().zip(to.iter().copied()).collect();
        Self { map }
    }

    /// Pairing that exchanges `a[i]` and `b[i]` in both directions.
    pub fn swap(a: &[Var], b: &[Var]) -> Self {
        Self::from_vars(a, b).compose(&Self::from_vars(b, a))
    }

    pub fn get(&self, v: Var) -> Option<Var> {
        self.map.get(&v).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Var, Var)> + '_ {
        self.map.iter().map(|(&k, &v)| (k, v))
    }

    /// Union of two pairings over disjoint source variables.
    ///
    /// Commutative: `a.compose(&b) == b.compose(&a)`.
    ///
    /// # Panics
    ///
    /// Panics if both pairings map the same source variable.
    pub fn compose(&self, other: &Pairing) -> Pairing {
        let mut map = self.map.clone();
        for (&k, &v) in &other.map {
            let prev = map.insert(k, v);
            assert!(prev.is_none(), "Pairings overlap on {}", k);
        }
        Pairing { map }
    }
}

impl Bdd {
    /// Rename the variables of `f` simultaneously according to `pairing`.
    pub fn replace(&self, f: Ref, pairing: &Pairing) -> Ref {
        if pairing.is_empty() {
            return f;
        }
        debug!("replace(f = {}, pairing of {} vars)", f, pairing.len());
        let mut cache = HashMap::new();
        self.replace_(f, pairing, &mut cache)
    }

    fn replace_(&self, f: Ref, pairing: &Pairing, cache: &mut HashMap<Ref, Ref>) -> Ref {
        let Some(v) = self.var_of(f) else {
            return f;
        };
        if let Some(&res) = cache.get(&f) {
            return res;
        }
        let low = self.replace_(self.low_node(f), pairing, cache);
        let high = self.replace_(self.high_node(f), pairing, cache);
        let target = pairing.get(v).unwrap_or(v);
        // The target may sit anywhere in the order, so rebuild through ITE.
        let res = self.apply_ite(self.mk_var(target), high, low);
        cache.insert(f, res);
        res
    }
}
