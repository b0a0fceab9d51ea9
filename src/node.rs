use crate::reference::Ref;
use crate::utils::{pairing3, BucketHash};

/// A decision node: `if variable then high else low`.
///
/// Terminal slots use `variable == 0`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Node {
    pub variable: u32,
    pub low: Ref,
    pub high: Ref,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            variable: 0,
            low: Ref::positive(0),
            high: Ref::positive(0),
        }
    }
}

impl BucketHash for Node {
    fn bucket_hash(&self) -> u64 {
        pairing3(
            self.variable as u64,
            self.low.raw() as u64,
            self.high.raw() as u64,
        )
    }
}
