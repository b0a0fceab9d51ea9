//! Satisfying assignments and model counting.

use std::collections::HashMap;

use num_bigint::BigUint;

use crate::bdd::Bdd;
use crate::reference::Ref;
use crate::types::{Lit, Var};

impl Bdd {
    /// Returns one satisfying path of `node`, if any exists.
    ///
    /// Walks down from the root taking the low (false) branch whenever it is
    /// satisfiable, so integers decoded MSB-first come out as small as
    /// possible. Variables that do not appear on the path are free.
    ///
    /// Returns `None` if `node` is the constant false function.
    pub fn one_sat(&self, node: Ref) -> Option<Vec<Lit>> {
        if self.is_zero(node) {
            return None;
        }

        let mut path = Vec::new();
        let mut current = node;

        while let Some(var) = self.var_of(current) {
            let low = self.low_node(current);
            if !self.is_zero(low) {
                path.push(var.neg());
                current = low;
            } else {
                path.push(var.pos());
                current = self.high_node(current);
            }
        }

        Some(path)
    }

    /// One satisfying path of `node` as a variable assignment.
    pub fn one_sat_assignment(&self, node: Ref) -> Option<HashMap<Var, bool>> {
        self.one_sat(node)
            .map(|path| path.into_iter().map(|lit| (lit.var(), lit.value())).collect())
    }

    /// One complete assignment over `vars` (plus the support of `node`), as a cube.
    ///
    /// Free variables are set to false. The result implies `node`.
    pub fn full_sat_one(&self, node: Ref, vars: &[Var]) -> Option<Ref> {
        let mut assignment = self.one_sat_assignment(node)?;
        for &v in vars {
            assignment.entry(v).or_insert(false);
        }
        Some(self.mk_cube(assignment.into_iter().map(|(v, b)| Lit::new(v, !b))))
    }

    /// Whether `node` is a single cube assigning every variable in `vars`.
    pub fn is_full_assignment(&self, node: Ref, vars: &[Var]) -> bool {
        match self.one_sat(node) {
            None => false,
            Some(path) => {
                path.len() == self.support(node).len()
                    && self.mk_cube(path.iter().copied()) == node
                    && vars.iter().all(|v| path.iter().any(|lit| lit.var() == *v))
            }
        }
    }

    /// Up to `limit` satisfying paths of `node`.
    pub fn all_sat(&self, node: Ref, limit: usize) -> Vec<Vec<Lit>> {
        self.paths(node).take(limit).collect()
    }

    /// Number of satisfying assignments of `node` over `num_vars` variables.
    ///
    /// `num_vars` must cover the support of `node`.
    pub fn sat_count(&self, node: Ref, num_vars: usize) -> BigUint {
        let mut cache = HashMap::new();
        let max = BigUint::from(1u32) << num_vars;
        self.sat_count_(node, &max, &mut cache)
    }

    fn sat_count_(&self, node: Ref, max: &BigUint, cache: &mut HashMap<Ref, BigUint>) -> BigUint {
        if self.is_zero(node) {
            return BigUint::ZERO;
        } else if self.is_one(node) {
            return max.clone();
        }

        if let Some(count) = cache.get(&node) {
            return count.clone();
        }

        // Count the regular node, then complement if needed.
        let regular = node.regular();
        let count_low = self.sat_count_(self.low_node(regular), max, cache);
        let count_high = self.sat_count_(self.high_node(regular), max, cache);

        let count: BigUint = (count_low + count_high) >> 1;
        let count = if node.is_negated() { max - count } else { count };

        cache.insert(node, count.clone());
        count
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn setup(n: usize) -> (Bdd, Vec<Ref>) {
        let bdd = Bdd::default();
        let x = bdd.allocate_vars(n).into_iter().map(|v| bdd.mk_var(v)).collect();
        (bdd, x)
    }

    #[test]
    fn test_one_sat() {
        let (bdd, _) = setup(3);

        let f = bdd.mk_cube([1, -2, -3]);
        let model = bdd.one_sat(f);
        let expected: Vec<Lit> = vec![1, -2, -3].into_iter().map(Lit::from_dimacs).collect();
        assert_eq!(model, Some(expected));

        let g = bdd.apply_and(f, -bdd.mk_cube(model.unwrap()));
        assert_eq!(bdd.one_sat(g), None);
    }

    #[test]
    fn test_one_sat_prefers_low() {
        let (bdd, x) = setup(2);
        let f = bdd.apply_or(x[0], x[1]);
        let model = bdd.one_sat(f).unwrap();
        assert_eq!(model, vec![Lit::from_dimacs(-1), Lit::from_dimacs(2)]);
    }

    #[test]
    fn test_full_sat_one() {
        let (bdd, x) = setup(3);
        let vars: Vec<Var> = (1..=3).map(Var::new).collect();

        let f = x[1];
        let cube = bdd.full_sat_one(f, &vars).unwrap();
        assert_eq!(cube, bdd.mk_cube([-1, 2, -3]));
        assert!(bdd.is_implies(cube, f));
        assert!(bdd.is_full_assignment(cube, &vars));
        assert!(!bdd.is_full_assignment(f, &vars));
        assert_eq!(bdd.full_sat_one(bdd.zero(), &vars), None);
    }

    #[test]
    fn test_all_sat_limit() {
        let (bdd, x) = setup(3);
        let f = bdd.apply_or_many(x.clone());
        assert_eq!(bdd.all_sat(f, 100).len(), 3);
        assert_eq!(bdd.all_sat(f, 2).len(), 2);
        assert!(bdd.all_sat(bdd.zero(), 10).is_empty());
    }

    #[test]
    fn test_sat_count_terminal() {
        let (bdd, _) = setup(0);
        assert_eq!(bdd.sat_count(bdd.zero(), 3), BigUint::from(0u32));
        assert_eq!(bdd.sat_count(bdd.one(), 3), BigUint::from(8u32));
    }

    #[test]
    fn test_sat_count_clause() {
        let (bdd, x) = setup(2);
        let f = bdd.apply_or(x[0], x[1]);
        assert_eq!(bdd.sat_count(f, 2), BigUint::from(3u32));
        assert_eq!(bdd.sat_count(f, 4), BigUint::from(12u32));
        assert_eq!(bdd.sat_count(-f, 2), BigUint::from(1u32));
    }
}
