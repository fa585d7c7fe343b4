use std::sync::{Arc, Mutex};
use std::time::Duration;

use ds_config::StreamingConfig;
use ds_core::{
    Batch, CheckpointRecord, DStream, QueueSource, SharedGraph, StreamGraph, Time, Value,
};

const BATCH: Duration = Duration::from_millis(500);

fn graph() -> SharedGraph {
    StreamGraph::new(&StreamingConfig::new(BATCH).with_default_parallelism(2)).shared()
}

fn batch<V: Into<Value>>(values: impl IntoIterator<Item = V>, partitions: usize) -> Batch {
    Batch::from_values(values.into_iter().map(Into::into).collect(), partitions)
}

fn queue(g: &SharedGraph, batches: Vec<Batch>) -> DStream {
    DStream::from_source(g, QueueSource::new(batches))
}

type Seen = Arc<Mutex<Vec<Vec<Value>>>>;

/// Register an output that collects non-empty batches.
fn collect(out: &DStream) -> Seen {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    out.foreach_batch(move |_t, b: &Batch| {
        let values = b.collect();
        if !values.is_empty() {
            sink.lock().unwrap().push(values);
        }
        Ok(())
    })
    .unwrap();
    seen
}

/// Run ticks `from..=to` on a prepared graph.
fn tick(graph: &mut StreamGraph, from: u64, to: u64) {
    for k in from..=to {
        let time = Time::from_millis(k * 500);
        let plan = graph.generate(time).unwrap();
        assert!(plan.failures.is_empty(), "tick {time} failed");
        for job in &plan.jobs {
            job.run().unwrap();
        }
        graph.clear_metadata(time);
        graph.commit_sources(time);
    }
}

/// Register a collecting output, then tick the graph `ticks` times.
/// Empty batches are not collected.
fn drive(g: &SharedGraph, out: &DStream, ticks: u64) -> Vec<Vec<Value>> {
    let seen = collect(out);
    let mut graph = g.lock().unwrap();
    graph.prepare().unwrap();
    tick(&mut graph, 1, ticks);
    drop(graph);
    let result = seen.lock().unwrap().clone();
    result
}

fn sorted(mut batches: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    for b in &mut batches {
        b.sort();
    }
    batches
}

fn ints(xs: impl IntoIterator<Item = i64>) -> Vec<Value> {
    xs.into_iter().map(Value::Int).collect()
}

fn pairs<K: Into<Value> + Clone, V: Into<Value> + Clone>(xs: &[(K, V)]) -> Vec<Value> {
    xs.iter().cloned().map(Value::from).collect()
}

fn list(xs: impl IntoIterator<Item = i64>) -> Value {
    Value::List(ints(xs))
}

fn add(a: &Value, b: &Value) -> Value {
    a.checked_add(b).unwrap()
}

fn sub(a: &Value, b: &Value) -> Value {
    a.checked_sub(b).unwrap()
}

fn strs(xs: &[&str]) -> Vec<Value> {
    xs.iter().map(|s| Value::from(*s)).collect()
}

fn ranges(rs: &[std::ops::Range<i64>]) -> Vec<Batch> {
    rs.iter().map(|r| batch(r.clone(), 1)).collect()
}

// ---------------------------------------------------------------------------
// per-batch operations
// ---------------------------------------------------------------------------

#[test]
fn map_flat_map_filter() {
    let g = graph();
    let s = queue(&g, ranges(&[1..5, 5..9]));
    let out = s
        .map(|v| Value::from(v.to_string()))
        .flat_map(|v| vec![v.clone(), v.clone()])
        .filter(|v| v.as_str() != Some("2"));
    let got = drive(&g, &out, 2);
    assert_eq!(got[0], strs(&["1", "1", "3", "3", "4", "4"]));
    assert_eq!(got[1], strs(&["5", "5", "6", "6", "7", "7", "8", "8"]));
}

#[test]
fn count_and_reduce_emit_single_records() {
    let g = graph();
    let s = queue(&g, ranges(&[0..5, 0..10, 0..0]));
    let counted = s.count();
    let got = drive(&g, &counted, 3);
    assert_eq!(got, vec![ints([5]), ints([10]), ints([0])]);

    let g = graph();
    let s = queue(&g, ranges(&[1..5, 5..9, 9..13]));
    let got = drive(&g, &s.reduce(add), 3);
    assert_eq!(got, vec![ints([10]), ints([26]), ints([42])]);
}

#[test]
fn glom_and_map_partitions_follow_input_partitions() {
    let g = graph();
    let s = queue(&g, vec![batch(1..5, 2), batch(5..9, 2)]);
    let got = drive(&g, &s.glom(), 2);
    assert_eq!(got[0], vec![list(1..3), list(3..5)]);
    assert_eq!(got[1], vec![list(5..7), list(7..9)]);

    let g = graph();
    let s = queue(&g, vec![batch(1..5, 2), batch(9..13, 2)]);
    let summed = s.map_partitions(|part| vec![part.iter().fold(Value::Int(0), |a, v| add(&a, v))]);
    assert_eq!(drive(&g, &summed, 2), vec![ints([3, 7]), ints([19, 23])]);

    let g = graph();
    let s = queue(&g, vec![batch(1..5, 2)]);
    let got = drive(&g, &s.repartition(1).glom(), 1);
    assert_eq!(got, vec![vec![list(1..5)]]);
}

#[test]
fn keyed_aggregations() {
    let g = graph();
    let s = queue(
        &g,
        vec![
            batch(pairs(&[("a", 1), ("a", 1), ("b", 1), ("b", 1)]), 1),
            batch(pairs(&[(1, 1), (1, 1), (2, 1), (2, 1), (3, 1)]), 2),
        ],
    );
    let got = sorted(drive(&g, &s.reduce_by_key(add, None), 2));
    assert_eq!(got[0], pairs(&[("a", 2), ("b", 2)]));
    assert_eq!(got[1], pairs(&[(1, 2), (2, 2), (3, 1)]));

    let g = graph();
    let s = queue(
        &g,
        vec![batch(
            pairs(&[(1, 1), (1, 1), (1, 1), (2, 1), (2, 1), (3, 1)]),
            1,
        )],
    );
    let got = sorted(drive(&g, &s.group_by_key(None), 1));
    assert_eq!(
        got[0],
        vec![
            Value::pair(1, list([1, 1, 1])),
            Value::pair(2, list([1, 1])),
            Value::pair(3, list([1])),
        ]
    );
}

#[test]
fn combine_by_key_concatenates_strings() {
    let g = graph();
    let s = queue(
        &g,
        vec![batch(
            pairs(&[("a", 1), ("a", 1), ("b", 1), ("", 1), ("", 1), ("", 1)]),
            1,
        )],
    );
    let append = |a: &Value, b: &Value| Value::from(format!("{a}{b}"));
    let combined = s.combine_by_key(|v| Value::from(v.to_string()), append, append, None);
    let got = sorted(drive(&g, &combined, 1));
    assert_eq!(got[0], pairs(&[("", "111"), ("a", "11"), ("b", "1")]));
}

#[test]
fn count_by_value_and_values_ops() {
    let g = graph();
    let mut values = ints(1..5);
    values.extend(ints(1..5));
    let s = queue(&g, vec![batch(values, 1)]);
    let got = drive(&g, &s.count_by_value().count(), 1);
    assert_eq!(got, vec![ints([4])]);

    let g = graph();
    let s = queue(&g, vec![batch(pairs(&[("a", 2), ("c", 1)]), 1)]);
    let out = s
        .map_values(|v| add(v, &Value::Int(10)))
        .flat_map_values(|v| vec![v.clone(), sub(v, &Value::Int(10))]);
    let got = drive(&g, &out, 1);
    assert_eq!(got[0], pairs(&[("a", 12), ("a", 2), ("c", 11), ("c", 1)]));
}

// ---------------------------------------------------------------------------
// multi-parent
// ---------------------------------------------------------------------------

#[test]
fn union_with_shorter_queue() {
    let g = graph();
    let a = queue(&g, ranges(&[0..3, 0..5, 0..6]));
    let b = queue(&g, ranges(&[3..6, 5..6]));
    let got = sorted(drive(&g, &a.union(&b).unwrap(), 3));
    assert_eq!(got, vec![ints(0..6), ints(0..6), ints(0..6)]);
}

#[test]
fn cogroup_lists_both_sides() {
    let g = graph();
    let a = queue(&g, vec![batch(pairs(&[(1, 1), (2, 1), (3, 1)]), 1)]);
    let b = queue(&g, vec![batch(pairs(&[(1, 2)]), 1)]);
    let got = sorted(drive(&g, &a.cogroup(&b, None).unwrap(), 1));
    let both = |l: Vec<i64>, r: Vec<i64>| Value::Tuple(vec![list(l), list(r)]);
    assert_eq!(
        got[0],
        vec![
            Value::pair(1, both(vec![1], vec![2])),
            Value::pair(2, both(vec![1], vec![])),
            Value::pair(3, both(vec![1], vec![])),
        ]
    );
}

#[test]
fn joins_fill_missing_sides_with_null() {
    let cases: [(&str, Vec<Value>); 4] = [
        ("inner", vec![Value::pair("b", (2, 3))]),
        (
            "left",
            vec![
                Value::pair("a", Value::Tuple(vec![1.into(), Value::Null])),
                Value::pair("b", (2, 3)),
            ],
        ),
        (
            "right",
            vec![
                Value::pair("b", (2, 3)),
                Value::pair("c", Value::Tuple(vec![Value::Null, 4.into()])),
            ],
        ),
        (
            "full",
            vec![
                Value::pair("a", Value::Tuple(vec![1.into(), Value::Null])),
                Value::pair("b", (2, 3)),
                Value::pair("c", Value::Tuple(vec![Value::Null, 4.into()])),
            ],
        ),
    ];
    for (kind, expected) in cases {
        let g = graph();
        let a = queue(&g, vec![batch(pairs(&[("a", 1), ("b", 2)]), 1)]);
        let b = queue(&g, vec![batch(pairs(&[("b", 3), ("c", 4)]), 1)]);
        let joined = match kind {
            "inner" => a.join(&b, None),
            "left" => a.left_outer_join(&b, None),
            "right" => a.right_outer_join(&b, None),
            _ => a.full_outer_join(&b, None),
        }
        .unwrap();
        let got = sorted(drive(&g, &joined, 1));
        assert_eq!(got, vec![expected], "{kind} join");
    }
}

#[test]
fn context_level_union_and_transform() {
    let g = graph();
    let streams: Vec<DStream> = (0..3i64)
        .map(|i| queue(&g, vec![batch([i], 1)]))
        .collect();
    let reordered = DStream::transform_all(
        &streams,
        Arc::new(|_t: Time, bs: &[Batch]| -> anyhow::Result<Batch> {
            Ok(bs[1].union(&[bs[2].clone(), bs[0].clone()]))
        }),
    )
    .unwrap();
    assert_eq!(drive(&g, &reordered, 1), vec![ints([1, 2, 0])]);

    let g = graph();
    let a = queue(&g, ranges(&[0..2]));
    let b = queue(&g, ranges(&[0..2]));
    let doubled = DStream::union_all(&[a, b]).unwrap();
    assert_eq!(drive(&g, &doubled, 1), vec![ints([0, 1, 0, 1])]);
}

#[test]
fn transform_errors_fail_only_that_branch() {
    let g = graph();
    let s = queue(&g, ranges(&[0..2]));
    let broken = s.transform(|_t, _b| anyhow::bail!("lookup table unavailable"));
    broken.foreach_batch(|_, _| Ok(())).unwrap();
    let counted = s.count();
    counted.foreach_batch(|_, _| Ok(())).unwrap();

    let mut graph = g.lock().unwrap();
    graph.prepare().unwrap();
    let plan = graph.generate(Time::from_millis(500)).unwrap();
    assert_eq!(plan.failures.len(), 1);
    assert_eq!(plan.failures[0].node, broken.id());
    assert_eq!(plan.jobs.len(), 1);
    assert_eq!(plan.skipped_outputs, 1);
}

// ---------------------------------------------------------------------------
// state
// ---------------------------------------------------------------------------

#[test]
fn update_state_by_key_appends_in_order() {
    let g = graph();
    let input = (0..5i64).map(|i| batch([Value::pair("k", i)], 1)).collect();
    let s = queue(&g, input);
    let state = s.update_state_by_key(|vs, prev| {
        let mut acc = prev.and_then(Value::as_list).map(<[Value]>::to_vec).unwrap_or_default();
        acc.extend(vs.iter().cloned());
        Some(Value::List(acc))
    });
    let got = drive(&g, &state, 5);
    let expected: Vec<Vec<Value>> = (1..=5)
        .map(|n| vec![Value::pair("k", list(0..n))])
        .collect();
    assert_eq!(got, expected);
}

// ---------------------------------------------------------------------------
// windows
// ---------------------------------------------------------------------------

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn counts(cs: &[i64]) -> Vec<Vec<Value>> {
    cs.iter().map(|c| ints([*c])).collect()
}

#[test]
fn window_count_grows_then_drains() {
    let g = graph();
    let s = queue(&g, ranges(&[0..1, 0..2, 0..3, 0..4, 0..5]));
    let out = s.window(ms(1500), Some(ms(500))).unwrap().count();
    let got = drive(&g, &out, 7);
    assert_eq!(got, counts(&[1, 3, 6, 9, 12, 9, 5]));
}

#[test]
fn count_by_window_matches_window_count() {
    let g = graph();
    let s = queue(&g, ranges(&[0..1, 0..2, 0..3, 0..4, 0..5]));
    let got = drive(&g, &s.count_by_window(ms(1500), ms(500)).unwrap(), 7);
    assert_eq!(got, counts(&[1, 3, 6, 9, 12, 9, 5]));

    let g = graph();
    let s = queue(&g, ranges(&[0..1, 0..2, 0..3, 0..4, 0..5, 0..6]));
    let got = drive(&g, &s.count_by_window(ms(2500), ms(500)).unwrap(), 10);
    assert_eq!(got, counts(&[1, 3, 6, 10, 15, 20, 18, 15, 11, 6]));
}

#[test]
fn count_by_value_and_window_tracks_distinct_values() {
    let g = graph();
    let s = queue(&g, ranges(&[0..1, 0..2, 0..3, 0..4, 0..5, 0..6]));
    let out = s
        .count_by_value_and_window(ms(2500), None, None)
        .unwrap()
        .count();
    let got = drive(&g, &out, 10);
    assert_eq!(got, counts(&[1, 2, 3, 4, 5, 6, 6, 6, 6, 6]));
}

#[test]
fn group_by_key_and_window_orders_by_time() {
    let g = graph();
    let input = (0..5i64).map(|i| batch([Value::pair("a", i)], 1)).collect();
    let s = queue(&g, input);
    let out = s.group_by_key_and_window(ms(1500), Some(ms(500)), None).unwrap();
    let got = drive(&g, &out, 8);
    let expected: Vec<Vec<Value>> = [
        vec![0],
        vec![0, 1],
        vec![0, 1, 2],
        vec![1, 2, 3],
        vec![2, 3, 4],
        vec![3, 4],
        vec![4],
    ]
    .into_iter()
    .map(|vs| vec![Value::pair("a", list(vs))])
    .collect();
    assert_eq!(got, expected);
}

#[test]
fn reduce_by_key_and_window_incremental_equals_full() {
    let input = || {
        (0..6)
            .map(|i: i64| batch(pairs(&[("a", 1), ("b", i)]), 2))
            .collect::<Vec<_>>()
    };
    let g = graph();
    let s = queue(&g, input());
    let full = s
        .reduce_by_key_and_window(
            add,
            None::<fn(&Value, &Value) -> Value>,
            ms(1500),
            None,
            None,
            None::<fn(&Value) -> bool>,
        )
        .unwrap();
    let full = sorted(drive(&g, &full, 6));

    let g = graph();
    let s = queue(&g, input());
    let incremental = s
        .reduce_by_key_and_window(
            add,
            Some(sub),
            ms(1500),
            None,
            None,
            None::<fn(&Value) -> bool>,
        )
        .unwrap();
    let incremental = sorted(drive(&g, &incremental, 6));
    assert_eq!(full, incremental);
    assert_eq!(full[3], pairs(&[("a", 3), ("b", 1 + 2 + 3)]));
}

#[test]
fn slower_windows_tick_on_their_own_slide() {
    let g = graph();
    let s = queue(&g, ranges(&[0..1, 0..1, 0..1, 0..1]));
    let out = s.window(ms(1000), Some(ms(1000))).unwrap().count();
    assert_eq!(out.slide(), ms(1000));
    // Ticks at 1000 and 2000 only.
    assert_eq!(drive(&g, &out, 4), vec![ints([2]), ints([2])]);
}

// ---------------------------------------------------------------------------
// checkpoint and restore
// ---------------------------------------------------------------------------

/// Build the same pipeline twice: run the first for `split` ticks, carry its
/// snapshot through JSON into the second, then run the second up to `end`.
fn resume_after(
    split: u64,
    end: u64,
    build: impl Fn(&SharedGraph) -> DStream,
) -> (Vec<Vec<Value>>, Vec<Vec<Value>>) {
    let first = graph();
    let before = drive(&first, &build(&first), split);
    let record = first.lock().unwrap().snapshot(Time::from_millis(split * 500));
    let bytes = record.to_json().unwrap();

    let second = graph();
    let seen = collect(&build(&second));
    let mut g = second.lock().unwrap();
    g.prepare().unwrap();
    let resumed = g.restore(&CheckpointRecord::from_json(&bytes).unwrap()).unwrap();
    assert_eq!(resumed, Time::from_millis(split * 500));
    tick(&mut g, split + 1, end);
    drop(g);
    let after = seen.lock().unwrap().clone();
    (before, after)
}

#[test]
fn reduced_window_continues_after_restore() {
    let (before, after) = resume_after(3, 7, |g| {
        queue(g, ranges(&[0..1, 0..2, 0..3, 0..4, 0..5]))
            .count_by_window(ms(1500), ms(500))
            .unwrap()
    });
    assert_eq!(before, counts(&[1, 3, 6]));
    assert_eq!(after, counts(&[9, 12, 9, 5]));
}

#[test]
fn keyed_reduced_window_continues_after_restore() {
    let (before, after) = resume_after(2, 6, |g| {
        queue(g, vec![batch(["a"], 1), batch(["a", "b"], 1), batch(["b"], 1)])
            .count_by_value_and_window(ms(1000), None, Some(1))
            .unwrap()
    });
    assert_eq!(
        sorted(before),
        vec![pairs(&[("a", 1)]), pairs(&[("a", 2), ("b", 1)])]
    );
    // Counts falling to zero drop out; the last window is empty.
    assert_eq!(
        sorted(after),
        vec![pairs(&[("a", 1), ("b", 2)]), pairs(&[("b", 1)])]
    );
}

#[test]
fn state_store_continues_after_restore() {
    let (before, after) = resume_after(2, 4, |g| {
        queue(g, vec![batch([1, 2], 1), batch([3], 1), batch([4], 1)])
            .map(|v| Value::pair("sum", v.clone()))
            .update_state_by_key(|new: &[Value], prev: Option<&Value>| {
                let base = prev.and_then(Value::as_int).unwrap_or(0);
                Some(Value::Int(base + new.iter().filter_map(Value::as_int).sum::<i64>()))
            })
    });
    assert_eq!(before, vec![pairs(&[("sum", 3)]), pairs(&[("sum", 6)])]);
    assert_eq!(after, vec![pairs(&[("sum", 10)]), pairs(&[("sum", 10)])]);
}
