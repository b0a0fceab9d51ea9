//! Iterator over satisfying paths in a BDD.
//!
//! Each path is a conjunction of literals (the variables on the path from the
//! root to the ONE terminal). Variables not on a path are free.
//!
//! Paths are produced in depth-first order, low branch first, matching the
//! preference of [`Bdd::one_sat`]: the first path is the one `one_sat` returns.
//!
//! Note: the number of paths can be exponential in the number of variables,
//! so bound the iteration on large BDDs.

use crate::bdd::Bdd;
use crate::reference::Ref;
use crate::types::Lit;

impl Bdd {
    /// Returns an iterator over all paths to ONE in `f`.
    pub fn paths(&self, f: Ref) -> BddPaths<'_> {
        BddPaths::new(self, f)
    }
}

#[derive(Debug, Clone, Copy)]
enum Branch {
    Low,
    High,
    Done,
}

#[derive(Debug)]
struct StackFrame {
    node: Ref,
    next_branch: Branch,
}

/// An iterator over satisfying paths in a BDD.
///
/// Created by [`Bdd::paths()`].
pub struct BddPaths<'a> {
    bdd: &'a Bdd,
    stack: Vec<StackFrame>,
    current_path: Vec<Lit>,
}

impl<'a> BddPaths<'a> {
    pub fn new(bdd: &'a Bdd, f: Ref) -> Self {
        BddPaths {
            bdd,
            stack: vec![StackFrame {
                node: f,
                next_branch: Branch::Low,
            }],
            current_path: Vec::new(),
        }
    }

    fn backtrack(&mut self) {
        self.stack.pop();
        // Pop the literal that led us here (unless we're at the root)
        if !self.stack.is_empty() {
            self.current_path.pop();
        }
    }
}

impl Iterator for BddPaths<'_> {
    type Item = Vec<Lit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let node = frame.node;
            let next_branch = frame.next_branch;

            if self.bdd.is_one(node) {
                let result = self.current_path.clone();
                self.backtrack();
                return Some(result);
            }
            if self.bdd.is_zero(node) {
                self.backtrack();
                continue;
            }

            let Some(var) = self.bdd.var_of(node) else {
                unreachable!("non-terminal node without a variable");
            };
            match next_branch {
                Branch::Low => {
                    frame.next_branch = Branch::High;
                    self.current_path.push(var.neg());
                    self.stack.push(StackFrame {
                        node: self.bdd.low_node(node),
                        next_branch: Branch::Low,
                    });
                }
                Branch::High => {
                    frame.next_branch = Branch::Done;
                    self.current_path.push(var.pos());
                    self.stack.push(StackFrame {
                        node: self.bdd.high_node(node),
                        next_branch: Branch::Low,
                    });
                }
                Branch::Done => self.backtrack(),
            }
        }
    }
}
