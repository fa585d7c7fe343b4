use std::collections::BTreeMap;
use std::thread;

use ds_config::StateKeyPolicy;
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, partition_for, shuffle};
use crate::func::UpdateFn;
use crate::time::Time;
use crate::value::Value;

/// Key counts below this are updated on the calling thread.
const PARALLEL_THRESHOLD: usize = 512;

/// One key's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Value,
    /// Last tick the update function ran for this key.
    pub updated_at: Time,
    /// Last tick the key arrived with new values.
    pub last_input: Time,
}

/// Key-partitioned state folded forward once per tick.
///
/// The control loop is the only writer. A tick computes every key's next
/// state first and commits the whole set afterwards, so a panicking update
/// function leaves the previous tick's state untouched.
pub(crate) struct StateStore {
    update: UpdateFn,
    policy: StateKeyPolicy,
    partitions: usize,
    entries: BTreeMap<Value, StateEntry>,
}

impl StateStore {
    pub(crate) fn new(update: UpdateFn, policy: StateKeyPolicy, partitions: usize) -> Self {
        Self {
            update,
            policy,
            partitions: partitions.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &BTreeMap<Value, StateEntry> {
        &self.entries
    }

    pub(crate) fn restore(&mut self, entries: Vec<(Value, StateEntry)>) {
        self.entries = entries.into_iter().collect();
    }

    /// Fold `input`'s `(key, value)` records into the store and return the
    /// full `(key, state)` set for `time`.
    pub(crate) fn apply(&mut self, time: Time, input: &Batch) -> Batch {
        let incoming = input.grouped();
        let visit = self.keys_to_visit(time, &incoming);

        let mut buckets: Vec<Vec<&Value>> = vec![Vec::new(); self.partitions];
        for key in visit {
            buckets[partition_for(key, self.partitions)].push(key);
        }

        let store: &StateStore = self;
        let incoming_ref = &incoming;
        let run = move |bucket: &[&Value]| store.update_bucket(time, bucket, incoming_ref);
        let total: usize = buckets.iter().map(Vec::len).sum();
        let results: Vec<Vec<(Value, Option<StateEntry>)>> =
            if self.partitions > 1 && total >= PARALLEL_THRESHOLD {
                thread::scope(|scope| {
                    let handles: Vec<_> = buckets
                        .iter()
                        .map(|bucket| scope.spawn(move || run(bucket.as_slice())))
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
                        .collect()
                })
            } else {
                buckets.iter().map(|bucket| run(bucket.as_slice())).collect()
            };

        for (key, next) in results.into_iter().flatten() {
            match next {
                Some(entry) => {
                    self.entries.insert(key, entry);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }

        shuffle(
            self.entries
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone())),
            self.partitions,
        )
    }

    fn keys_to_visit<'a>(
        &'a self,
        time: Time,
        incoming: &'a BTreeMap<Value, Vec<Value>>,
    ) -> Vec<&'a Value> {
        let mut keys: Vec<&Value> = incoming.keys().collect();
        let idle = self
            .entries
            .iter()
            .filter(|(k, _)| !incoming.contains_key(*k));
        match self.policy {
            StateKeyPolicy::AllKnown => keys.extend(idle.map(|(k, _)| k)),
            StateKeyPolicy::Touched => {}
            StateKeyPolicy::Recent { within } => keys.extend(
                idle.filter(|(_, e)| e.last_input + within >= time)
                    .map(|(k, _)| k),
            ),
        }
        keys
    }

    fn update_bucket(
        &self,
        time: Time,
        keys: &[&Value],
        incoming: &BTreeMap<Value, Vec<Value>>,
    ) -> Vec<(Value, Option<StateEntry>)> {
        keys.iter()
            .map(|key| {
                let values = incoming.get(*key).map(Vec::as_slice).unwrap_or(&[]);
                let prev = self.entries.get(*key);
                let next = (self.update)(values, prev.map(|e| &e.value)).map(|value| StateEntry {
                    value,
                    updated_at: time,
                    last_input: if values.is_empty() {
                        prev.map_or(time, |e| e.last_input)
                    } else {
                        time
                    },
                });
                ((*key).clone(), next)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    fn t(n: u64) -> Time {
        Time::from_millis(n)
    }

    fn appender() -> UpdateFn {
        Arc::new(|vs: &[Value], s: Option<&Value>| {
            let mut list = s.and_then(Value::as_list).map(<[Value]>::to_vec).unwrap_or_default();
            list.extend(vs.iter().cloned());
            Some(Value::List(list))
        })
    }

    fn batch(pairs: Vec<(&str, i64)>) -> Batch {
        Batch::from_values(pairs.into_iter().map(Value::from).collect(), 1)
    }

    #[test]
    fn append_update_accumulates_in_time_order() {
        let mut store = StateStore::new(appender(), StateKeyPolicy::AllKnown, 1);
        let mut last = Batch::empty();
        for i in 0..5 {
            last = store.apply(t((i as u64 + 1) * 500), &batch(vec![("k", i)]));
        }
        let ints: Vec<Value> = (0..5).map(Value::Int).collect();
        assert_eq!(last.collect(), vec![Value::pair("k", Value::List(ints))]);
    }

    #[test]
    fn none_deletes_key() {
        let expire: UpdateFn = Arc::new(|vs: &[Value], _s: Option<&Value>| {
            if vs.is_empty() { None } else { Some(Value::Int(vs.len() as i64)) }
        });
        let mut store = StateStore::new(expire, StateKeyPolicy::AllKnown, 1);
        store.apply(t(500), &batch(vec![("a", 1), ("b", 1)]));
        let out = store.apply(t(1000), &batch(vec![("a", 1)]));
        assert_eq!(out.collect(), vec![Value::pair("a", 1)]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn policies_choose_idle_keys() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            Arc::new(move |vs: &[Value], s: Option<&Value>| {
                if vs.is_empty() {
                    seen.lock().unwrap().push(s.cloned());
                }
                Some(s.cloned().unwrap_or(Value::Int(0)))
            }) as UpdateFn
        };

        let mut touched = StateStore::new(Arc::clone(&recorder), StateKeyPolicy::Touched, 1);
        touched.apply(t(500), &batch(vec![("a", 1)]));
        touched.apply(t(1000), &Batch::empty());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(touched.len(), 1);

        let recent = StateKeyPolicy::Recent {
            within: Duration::from_millis(1000),
        };
        let mut store = StateStore::new(recorder, recent, 1);
        store.apply(t(500), &batch(vec![("a", 1)]));
        store.apply(t(1000), &Batch::empty());
        store.apply(t(1500), &Batch::empty());
        store.apply(t(2000), &Batch::empty());
        // Visited at 1000 and 1500, idle for longer than `within` at 2000.
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn parallel_buckets_match_sequential() {
        let counter: UpdateFn = Arc::new(|vs: &[Value], s: Option<&Value>| {
            let prev = s.and_then(Value::as_int).unwrap_or(0);
            Some(Value::Int(prev + vs.len() as i64))
        });
        let records: Vec<Value> = (0..2000).map(|i| Value::pair(i % 700, 1)).collect();
        let input = Batch::from_values(records, 4);

        let mut par = StateStore::new(Arc::clone(&counter), StateKeyPolicy::AllKnown, 4);
        let mut seq = StateStore::new(counter, StateKeyPolicy::AllKnown, 1);
        let mut a = par.apply(t(500), &input).collect();
        let mut b = seq.apply(t(500), &input).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(par.len(), 700);
    }

    #[test]
    fn panicking_update_leaves_state_untouched() {
        let flaky: UpdateFn = Arc::new(|vs: &[Value], s: Option<&Value>| {
            if vs.iter().any(|v| v.as_int() == Some(-1)) {
                panic!("bad value");
            }
            Some(Value::Int(s.and_then(Value::as_int).unwrap_or(0) + vs.len() as i64))
        });
        let mut store = StateStore::new(flaky, StateKeyPolicy::AllKnown, 1);
        store.apply(t(500), &batch(vec![("a", 1), ("b", 1)]));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.apply(t(1000), &batch(vec![("a", 1), ("b", -1)]))
        }));
        assert!(result.is_err());
        assert_eq!(
            store.entries().get(&Value::from("a")).map(|e| e.value.clone()),
            Some(Value::Int(1))
        );
    }
}
