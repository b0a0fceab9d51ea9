//! Finite domains encoded into bitvectors.
//!
//! A [`FiniteDomain`] gives every value of a finite set its own code of a
//! bitvector. Codes that belong to no value are invalid; the validity
//! predicate is the OR of all value constraints.
//!
//! Value constraints and the validity predicate are pinned in the manager,
//! so a domain stays usable across garbage collections.

use std::collections::BTreeMap;
use std::fmt::Display;

use log::debug;

use crate::bdd::Bdd;
use crate::error::{Error, Result};
use crate::integer::{max_value, BddInteger, BitVector};
use crate::packet::PacketHeaders;
use crate::reference::Ref;
use crate::utils::bits_needed;

#[derive(Debug, Clone)]
pub struct FiniteDomain<T> {
    integer: BddInteger,
    values: Vec<T>,
    codes: BTreeMap<T, (u64, Ref)>,
    is_valid: Ref,
}

impl<T: Ord + Clone + Display> FiniteDomain<T> {
    /// Allocate a bitvector just wide enough for `values` and encode them in order.
    ///
    /// Duplicate values are encoded once.
    pub fn new(pkt: &mut PacketHeaders, name: &str, values: impl IntoIterator<Item = T>) -> Self {
        let values = dedup(values);
        let integer = pkt.allocate_bitvector(name, bits_needed(values.len()), false);
        let encoding = values.into_iter().zip(0..);
        Self::build(pkt.bdd(), integer, encoding)
    }

    /// Encode `values` in order into an existing, possibly oversized, bitvector.
    pub fn with_integer(bdd: &Bdd, integer: BddInteger, values: impl IntoIterator<Item = T>) -> Result<Self> {
        let values = dedup(values);
        if values.len() as u128 > max_value(integer.width()) as u128 + 1 {
            return Err(Error::DomainTooLarge {
                size: values.len(),
                width: integer.width(),
            });
        }
        let encoding = values.into_iter().zip(0..);
        Ok(Self::build(bdd, integer, encoding))
    }

    /// Encode values with explicitly chosen codes.
    ///
    /// Codes must be distinct and fit the bitvector.
    pub fn with_encoding(
        bdd: &Bdd,
        integer: BddInteger,
        encoding: impl IntoIterator<Item = (T, u64)>,
    ) -> Result<Self> {
        let encoding: Vec<(T, u64)> = encoding.into_iter().collect();
        for (_, code) in &encoding {
            integer.check_value(*code)?;
        }
        Ok(Self::build(bdd, integer, encoding))
    }

    /// Several domains sharing one bitvector, sized for the largest value set.
    ///
    /// Domains of different keys reuse the same codes, so their constraints
    /// are only meaningful within one key.
    pub fn shared<K: Ord + Clone>(
        pkt: &mut PacketHeaders,
        name: &str,
        values_by_key: &BTreeMap<K, Vec<T>>,
    ) -> BTreeMap<K, FiniteDomain<T>> {
        let largest = values_by_key.values().map(|vs| dedup(vs.iter().cloned()).len()).max();
        let integer = pkt.allocate_bitvector(name, bits_needed(largest.unwrap_or(0)), false);
        values_by_key
            .iter()
            .map(|(key, values)| {
                let encoding = dedup(values.iter().cloned()).into_iter().zip(0..);
                (key.clone(), Self::build(pkt.bdd(), integer.clone(), encoding))
            })
            .collect()
    }

    fn build(bdd: &Bdd, integer: BddInteger, encoding: impl IntoIterator<Item = (T, u64)>) -> Self {
        let mut values = Vec::new();
        let mut codes = BTreeMap::new();
        for (value, code) in encoding {
            if codes.contains_key(&value) {
                continue;
            }
            // Codes were range-checked by every caller.
            let constraint = bdd.apply_and_many(integer.bits().iter().enumerate().map(|(i, &bit)| {
                if (code >> (integer.width() - 1 - i)) & 1 == 1 {
                    bit
                } else {
                    -bit
                }
            }));
            values.push(value.clone());
            codes.insert(value, (code, bdd.pin(constraint)));
        }
        let is_valid = bdd.pin(bdd.apply_or_many(codes.values().map(|&(_, c)| c)));
        debug!("Encoded {} values into {} bits", values.len(), integer.width());
        Self {
            integer,
            values,
            codes,
            is_valid,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn integer(&self) -> &BddInteger {
        &self.integer
    }

    /// Predicate "the encoded value is `value`".
    pub fn constraint_for_value(&self, value: &T) -> Result<Ref> {
        match self.codes.get(value) {
            Some(&(_, constraint)) => Ok(constraint),
            None => Err(Error::UnknownValue {
                value: value.to_string(),
            }),
        }
    }

    /// Predicate "the encoding is one of the registered values".
    pub fn is_valid_value(&self) -> Ref {
        self.is_valid
    }

    /// Registered value of one satisfying assignment of `f`.
    ///
    /// Returns `None` if `f` allows no valid encoding.
    pub fn value_from_assignment(&self, bdd: &Bdd, f: Ref) -> Option<T> {
        let code = self.integer.value_satisfying(bdd, bdd.apply_and(f, self.is_valid))?;
        self.codes
            .iter()
            .find(|(_, (c, _))| *c == code)
            .map(|(value, _)| value.clone())
    }

    /// Registered values, in encoding order.
    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.values.iter()
    }

    /// Every registered value with its constraint.
    pub fn value_bdds(&self) -> impl Iterator<Item = (&T, Ref)> + '_ {
        self.values.iter().map(|v| (v, self.codes[v].1))
    }
}

fn dedup<T: Ord + Clone>(values: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = std::collections::BTreeSet::new();
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn names(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_trip() {
        let mut pkt = PacketHeaders::new();
        let domain = FiniteDomain::new(&mut pkt, "iface", names(&["eth0", "eth1", "eth2", "lo"]));
        let bdd = pkt.bdd();

        assert_eq!(domain.integer().width(), 2);
        for value in domain.values() {
            let c = domain.constraint_for_value(value).unwrap();
            assert_eq!(domain.value_from_assignment(bdd, c).as_ref(), Some(value));
        }
        assert_eq!(domain.is_valid_value(), bdd.one());
    }

    #[test]
    fn test_invalid_codes() {
        let mut pkt = PacketHeaders::new();
        let domain = FiniteDomain::new(&mut pkt, "iface", names(&["a", "b", "c"]));
        let bdd = pkt.bdd();

        let fourth = domain.integer().equals_value(bdd, 3).unwrap();
        assert!(!bdd.intersects(fourth, domain.is_valid_value()));
        assert_eq!(domain.value_from_assignment(bdd, fourth), None);
        assert_eq!(
            domain.constraint_for_value(&"z".to_string()),
            Err(Error::UnknownValue { value: "z".to_string() })
        );
    }

    #[test]
    fn test_small_domains() {
        let mut pkt = PacketHeaders::new();
        let vars_before = pkt.bdd().num_vars();

        let empty = FiniteDomain::<String>::new(&mut pkt, "empty", vec![]);
        assert!(empty.is_empty());
        assert_eq!(empty.is_valid_value(), pkt.bdd().zero());

        let single = FiniteDomain::new(&mut pkt, "single", names(&["only"]));
        assert_eq!(single.constraint_for_value(&"only".to_string()), Ok(pkt.bdd().one()));
        assert_eq!(
            single.value_from_assignment(pkt.bdd(), pkt.bdd().one()),
            Some("only".to_string())
        );
        assert_eq!(pkt.bdd().num_vars(), vars_before);
    }

    #[test]
    fn test_constraints_survive_collection() {
        let mut pkt = PacketHeaders::new();
        let domain = FiniteDomain::new(&mut pkt, "vrf", names(&["a", "b", "c", "d", "e"]));
        let bdd = pkt.bdd();
        let before: Vec<Ref> = domain.value_bdds().map(|(_, c)| c).collect();

        bdd.collect_garbage(&[]);
        let bits = domain.integer().bits();
        let _noise = bdd.apply_or(bdd.apply_and(bits[0], -bits[2]), bits[1]);

        for (value, c) in domain.values().zip(&before) {
            assert!(bdd.is_pinned(*c));
            assert_eq!(domain.value_from_assignment(bdd, *c).as_ref(), Some(value));
            assert_eq!(domain.constraint_for_value(value), Ok(*c));
        }
        let valid = bdd.apply_or_many(before.iter().copied());
        assert_eq!(domain.is_valid_value(), valid);
    }

    #[test]
    fn test_with_integer() {
        let pkt = PacketHeaders::new();
        let bdd = pkt.bdd();
        let integer = pkt.dscp().clone();

        let domain = FiniteDomain::with_integer(bdd, integer.clone(), 0..40u32).unwrap();
        assert_eq!(domain.len(), 40);
        let c = domain.constraint_for_value(&39).unwrap();
        assert_eq!(domain.value_from_assignment(bdd, c), Some(39));

        assert_eq!(
            FiniteDomain::with_integer(bdd, integer, 0..65u32).err(),
            Some(Error::DomainTooLarge { size: 65, width: 6 })
        );
    }

    #[test]
    fn test_shared() {
        let mut pkt = PacketHeaders::new();
        let values_by_key = BTreeMap::from([
            ("r1", names(&["a", "b"])),
            ("r2", names(&["a", "b", "c", "d", "e"])),
        ]);
        let domains = FiniteDomain::shared(&mut pkt, "src", &values_by_key);

        assert_eq!(domains["r1"].integer(), domains["r2"].integer());
        assert_eq!(domains["r1"].integer().width(), 3);
        assert_eq!(pkt.extension("src").map(|i| i.width()), Some(3));
    }
}
