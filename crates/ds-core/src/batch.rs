use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use crate::value::Value;

// ---------------------------------------------------------------------------
// JoinKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinKind {
    pub fn label(self) -> &'static str {
        match self {
            JoinKind::Inner => "join",
            JoinKind::LeftOuter => "left_outer_join",
            JoinKind::RightOuter => "right_outer_join",
            JoinKind::FullOuter => "full_outer_join",
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Immutable, partitioned collection materialized for one stream at one time.
///
/// Cloning is cheap: partitions are shared. Every operation returns a new
/// batch. Key-value operations expect two-element tuples (see
/// [`Value::pair`]); other records are treated as `(record, null)`.
/// Shuffle outputs are hash partitioned by key with keys in ascending order
/// inside each partition, and values keep their input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    partitions: Arc<Vec<Vec<Value>>>,
}

impl Batch {
    /// A batch with no partitions and no records.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_partitions(partitions: Vec<Vec<Value>>) -> Self {
        Self {
            partitions: Arc::new(partitions),
        }
    }

    /// Split `values` into `partitions` contiguous slices of near-equal size.
    pub fn from_values(values: Vec<Value>, partitions: usize) -> Self {
        let n = partitions.max(1);
        let len = values.len();
        let mut out: Vec<Vec<Value>> = Vec::with_capacity(n);
        let mut iter = values.into_iter();
        for i in 0..n {
            let start = i * len / n;
            let end = (i + 1) * len / n;
            out.push(iter.by_ref().take(end - start).collect());
        }
        Self::from_partitions(out)
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self::from_partitions(vec![vec![value.into()]])
    }

    pub fn partitions(&self) -> &[Vec<Value>] {
        &self.partitions
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(Vec::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.partitions.iter().flatten()
    }

    /// All records, partition by partition.
    pub fn collect(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    pub fn take(&self, n: usize) -> Vec<Value> {
        self.iter().take(n).cloned().collect()
    }

    // -- element-wise ------------------------------------------------------

    pub fn map(&self, f: impl Fn(&Value) -> Value) -> Batch {
        self.map_each_partition(|part| part.iter().map(&f).collect())
    }

    pub fn flat_map(&self, f: impl Fn(&Value) -> Vec<Value>) -> Batch {
        self.map_each_partition(|part| part.iter().flat_map(&f).collect())
    }

    pub fn filter(&self, f: impl Fn(&Value) -> bool) -> Batch {
        self.map_each_partition(|part| part.iter().filter(|v| f(v)).cloned().collect())
    }

    pub fn map_partitions(&self, f: impl Fn(&[Value]) -> Vec<Value>) -> Batch {
        self.map_each_partition(|part| f(part))
    }

    /// One list record per partition holding that partition's records.
    pub fn glom(&self) -> Batch {
        self.map_each_partition(|part| vec![Value::List(part.to_vec())])
    }

    pub fn map_values(&self, f: impl Fn(&Value) -> Value) -> Batch {
        self.map(|record| {
            let (k, v) = split_pair(record);
            Value::Tuple(vec![k.clone(), f(v)])
        })
    }

    pub fn flat_map_values(&self, f: impl Fn(&Value) -> Vec<Value>) -> Batch {
        self.flat_map(|record| {
            let (k, v) = split_pair(record);
            f(v).into_iter()
                .map(|out| Value::Tuple(vec![k.clone(), out]))
                .collect()
        })
    }

    fn map_each_partition(&self, f: impl Fn(&[Value]) -> Vec<Value>) -> Batch {
        Batch::from_partitions(self.partitions.iter().map(|p| f(p)).collect())
    }

    // -- partitioning ------------------------------------------------------

    pub fn repartition(&self, partitions: usize) -> Batch {
        Batch::from_values(self.collect(), partitions)
    }

    /// Hash partition records by key without combining them.
    pub fn partition_by(&self, partitions: usize) -> Batch {
        let n = partitions.max(1);
        let mut out = vec![Vec::new(); n];
        for record in self.iter() {
            let (k, _) = split_pair(record);
            out[partition_for(k, n)].push(record.clone());
        }
        Batch::from_partitions(out)
    }

    /// Concatenate partitions of `self` followed by each of `others`.
    pub fn union(&self, others: &[Batch]) -> Batch {
        let mut parts: Vec<Vec<Value>> = self.partitions.as_ref().clone();
        for other in others {
            parts.extend(other.partitions.iter().cloned());
        }
        Batch::from_partitions(parts)
    }

    /// Concatenate any number of batches.
    pub fn union_all<'a>(batches: impl IntoIterator<Item = &'a Batch>) -> Batch {
        let parts = batches
            .into_iter()
            .flat_map(|b| b.partitions.iter().cloned())
            .collect();
        Batch::from_partitions(parts)
    }

    // -- aggregation -------------------------------------------------------

    pub fn count(&self) -> usize {
        self.len()
    }

    pub fn reduce(&self, f: impl Fn(&Value, &Value) -> Value) -> Option<Value> {
        let partials = self
            .partitions
            .iter()
            .filter_map(|part| reduce_slice(part.iter(), &f));
        reduce_slice(partials.collect::<Vec<_>>().iter(), &f)
    }

    pub fn count_by_value(&self, partitions: usize) -> Batch {
        let mut counts: BTreeMap<Value, i64> = BTreeMap::new();
        for record in self.iter() {
            *counts.entry(record.clone()).or_insert(0) += 1;
        }
        shuffle(
            counts.into_iter().map(|(k, c)| (k, Value::Int(c))),
            partitions,
        )
    }

    pub fn reduce_by_key(&self, f: impl Fn(&Value, &Value) -> Value, partitions: usize) -> Batch {
        self.combine_by_key(|v| v.clone(), &f, &f, partitions)
    }

    pub fn group_by_key(&self, partitions: usize) -> Batch {
        let grouped = self.grouped();
        shuffle(
            grouped.into_iter().map(|(k, vs)| (k, Value::List(vs))),
            partitions,
        )
    }

    /// Combine values per key: `create` starts a combiner from the first
    /// value seen in a partition, `merge_value` folds further values of the
    /// same partition, `merge_combiners` merges partial results across
    /// partitions.
    pub fn combine_by_key(
        &self,
        create: impl Fn(&Value) -> Value,
        merge_value: impl Fn(&Value, &Value) -> Value,
        merge_combiners: impl Fn(&Value, &Value) -> Value,
        partitions: usize,
    ) -> Batch {
        let mut merged: BTreeMap<Value, Value> = BTreeMap::new();
        for part in self.partitions.iter() {
            let mut local: BTreeMap<Value, Value> = BTreeMap::new();
            for record in part {
                let (k, v) = split_pair(record);
                match local.get_mut(k) {
                    Some(acc) => *acc = merge_value(acc, v),
                    None => {
                        local.insert(k.clone(), create(v));
                    }
                }
            }
            for (k, c) in local {
                match merged.get_mut(&k) {
                    Some(acc) => *acc = merge_combiners(acc, &c),
                    None => {
                        merged.insert(k, c);
                    }
                }
            }
        }
        shuffle(merged, partitions)
    }

    /// `(key, (values_self, values_other_1, ...))` for every key seen in any input.
    pub fn cogroup(&self, others: &[Batch], partitions: usize) -> Batch {
        let width = others.len() + 1;
        let mut groups: BTreeMap<Value, Vec<Vec<Value>>> = BTreeMap::new();
        for (slot, batch) in std::iter::once(self).chain(others.iter()).enumerate() {
            for record in batch.iter() {
                let (k, v) = split_pair(record);
                groups
                    .entry(k.clone())
                    .or_insert_with(|| vec![Vec::new(); width])[slot]
                    .push(v.clone());
            }
        }
        shuffle(
            groups.into_iter().map(|(k, lists)| {
                (k, Value::Tuple(lists.into_iter().map(Value::List).collect()))
            }),
            partitions,
        )
    }

    /// Key-matched pairs `(key, (left, right))`; missing sides become null
    /// for the outer variants.
    pub fn join(&self, other: &Batch, kind: JoinKind, partitions: usize) -> Batch {
        let left = self.grouped();
        let right = other.grouped();
        let mut keys: Vec<&Value> = left.keys().chain(right.keys()).collect();
        keys.sort();
        keys.dedup();

        let empty = Vec::new();
        let null = [Value::Null];
        let mut pairs = Vec::new();
        for k in keys {
            let ls = left.get(k).unwrap_or(&empty);
            let rs = right.get(k).unwrap_or(&empty);
            let keep = match kind {
                JoinKind::Inner => !ls.is_empty() && !rs.is_empty(),
                JoinKind::LeftOuter => !ls.is_empty(),
                JoinKind::RightOuter => !rs.is_empty(),
                JoinKind::FullOuter => true,
            };
            if !keep {
                continue;
            }
            let ls: &[Value] = if ls.is_empty() { &null } else { ls };
            let rs: &[Value] = if rs.is_empty() { &null } else { rs };
            for l in ls {
                for r in rs {
                    pairs.push((k.clone(), Value::Tuple(vec![l.clone(), r.clone()])));
                }
            }
        }
        shuffle(pairs, partitions)
    }

    /// Values grouped by key in input order.
    pub(crate) fn grouped(&self) -> BTreeMap<Value, Vec<Value>> {
        let mut groups: BTreeMap<Value, Vec<Value>> = BTreeMap::new();
        for record in self.iter() {
            let (k, v) = split_pair(record);
            groups.entry(k.clone()).or_default().push(v.clone());
        }
        groups
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

static NULL: Value = Value::Null;

/// Borrow `(key, value)` from a pair record; non-pairs become `(record, null)`.
pub(crate) fn split_pair(record: &Value) -> (&Value, &Value) {
    record.as_pair().unwrap_or((record, &NULL))
}

/// Stable partition index for a key.
pub(crate) fn partition_for(key: &Value, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Place `(key, value)` pairs into hash partitions, preserving their order.
pub(crate) fn shuffle(pairs: impl IntoIterator<Item = (Value, Value)>, partitions: usize) -> Batch {
    let n = partitions.max(1);
    let mut out = vec![Vec::new(); n];
    for (k, v) in pairs {
        let idx = partition_for(&k, n);
        out[idx].push(Value::Tuple(vec![k, v]));
    }
    Batch::from_partitions(out)
}

fn reduce_slice<'a>(
    mut iter: impl Iterator<Item = &'a Value>,
    f: &impl Fn(&Value, &Value) -> Value,
) -> Option<Value> {
    let first = iter.next()?.clone();
    Some(iter.fold(first, |acc, v| f(&acc, v)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(xs: &[i64]) -> Vec<Value> {
        xs.iter().map(|x| Value::Int(*x)).collect()
    }

    fn sorted(mut v: Vec<Value>) -> Vec<Value> {
        v.sort();
        v
    }

    fn add(a: &Value, b: &Value) -> Value {
        Value::Int(a.as_int().unwrap() + b.as_int().unwrap())
    }

    #[test]
    fn from_values_splits_contiguously() {
        let b = Batch::from_values(ints(&[1, 2, 3, 4, 5]), 2);
        assert_eq!(b.num_partitions(), 2);
        assert_eq!(b.partitions()[0], ints(&[1, 2]));
        assert_eq!(b.partitions()[1], ints(&[3, 4, 5]));
        assert_eq!(b.len(), 5);
    }

    #[test]
    fn glom_yields_one_list_per_partition() {
        let b = Batch::from_values(ints(&[1, 2, 3, 4]), 2).glom();
        assert_eq!(
            b.collect(),
            vec![Value::List(ints(&[1, 2])), Value::List(ints(&[3, 4]))]
        );
    }

    #[test]
    fn reduce_over_partitions() {
        let b = Batch::from_values(ints(&[1, 2, 3, 4]), 3);
        assert_eq!(b.reduce(add), Some(Value::Int(10)));
        assert_eq!(Batch::empty().reduce(add), None);
    }

    #[test]
    fn reduce_by_key_combines_across_partitions() {
        let recs = vec![
            Value::pair("a", 1),
            Value::pair("b", 1),
            Value::pair("a", 1),
            Value::pair("a", 1),
        ];
        let b = Batch::from_values(recs, 2).reduce_by_key(add, 3);
        assert_eq!(b.num_partitions(), 3);
        assert_eq!(
            sorted(b.collect()),
            vec![Value::pair("a", 3), Value::pair("b", 1)]
        );
    }

    #[test]
    fn group_by_key_keeps_input_order() {
        let recs = vec![Value::pair("k", 3), Value::pair("k", 1), Value::pair("k", 2)];
        let b = Batch::from_values(recs, 2).group_by_key(1);
        assert_eq!(
            b.collect(),
            vec![Value::pair("k", Value::List(ints(&[3, 1, 2])))]
        );
    }

    #[test]
    fn count_by_value_pairs() {
        let b = Batch::from_values(ints(&[1, 1, 2]), 1).count_by_value(2);
        assert_eq!(
            sorted(b.collect()),
            vec![Value::pair(1, 2), Value::pair(2, 1)]
        );
    }

    #[test]
    fn joins_cover_all_variants() {
        let left = Batch::from_values(vec![Value::pair("a", 1), Value::pair("b", 2)], 1);
        let right = Batch::from_values(vec![Value::pair("b", 3), Value::pair("c", 4)], 1);
        let pair = |k: &str, l: Value, r: Value| Value::pair(k, Value::Tuple(vec![l, r]));

        assert_eq!(
            left.join(&right, JoinKind::Inner, 1).collect(),
            vec![pair("b", Value::Int(2), Value::Int(3))]
        );
        assert_eq!(
            sorted(left.join(&right, JoinKind::LeftOuter, 1).collect()),
            vec![
                pair("a", Value::Int(1), Value::Null),
                pair("b", Value::Int(2), Value::Int(3)),
            ]
        );
        assert_eq!(
            sorted(left.join(&right, JoinKind::RightOuter, 1).collect()),
            vec![
                pair("b", Value::Int(2), Value::Int(3)),
                pair("c", Value::Null, Value::Int(4)),
            ]
        );
        assert_eq!(left.join(&right, JoinKind::FullOuter, 2).len(), 3);
    }

    #[test]
    fn cogroup_lists_each_side() {
        let left = Batch::from_values(vec![Value::pair("a", 1), Value::pair("a", 2)], 1);
        let right = Batch::from_values(vec![Value::pair("b", 3)], 1);
        let out = sorted(left.cogroup(&[right], 1).collect());
        assert_eq!(
            out,
            vec![
                Value::pair(
                    "a",
                    Value::Tuple(vec![Value::List(ints(&[1, 2])), Value::List(vec![])])
                ),
                Value::pair(
                    "b",
                    Value::Tuple(vec![Value::List(vec![]), Value::List(ints(&[3]))])
                ),
            ]
        );
    }

    #[test]
    fn combine_by_key_builds_lists() {
        let recs = vec![Value::pair("a", 1), Value::pair("b", 2), Value::pair("a", 3)];
        let out = Batch::from_values(recs, 2).combine_by_key(
            |v| Value::List(vec![v.clone()]),
            |acc, v| acc.checked_add(&Value::List(vec![v.clone()])).unwrap(),
            |a, b| a.checked_add(b).unwrap(),
            1,
        );
        assert_eq!(
            out.collect(),
            vec![
                Value::pair("a", Value::List(ints(&[1, 3]))),
                Value::pair("b", Value::List(ints(&[2]))),
            ]
        );
    }

    #[test]
    fn union_concatenates_partitions() {
        let a = Batch::from_values(ints(&[1]), 1);
        let b = Batch::from_values(ints(&[2, 3]), 2);
        let u = a.union(&[b]);
        assert_eq!(u.num_partitions(), 3);
        assert_eq!(u.collect(), ints(&[1, 2, 3]));
    }
}
