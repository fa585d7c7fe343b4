use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use orion_error::prelude::*;

use crate::batch::{Batch, shuffle};
use crate::error::{CoreReason, CoreResult};
use crate::func::{FilterFn, ReduceFn};
use crate::time::{Time, is_multiple_of, is_whole_millis};
use crate::value::Value;

// ---------------------------------------------------------------------------
// WindowSpec
// ---------------------------------------------------------------------------

/// Validated `(window, slide)` pair for a windowed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    window: Duration,
    slide: Duration,
}

impl WindowSpec {
    /// Both durations must be positive multiples of the parent's slide.
    /// A window equal to the parent slide is accepted.
    pub fn new(window: Duration, slide: Duration, parent_slide: Duration) -> CoreResult<Self> {
        if window.is_zero() {
            return invalid(format!("window duration must be > 0, got {window:?}"));
        }
        if slide.is_zero() {
            return invalid(format!("slide duration must be > 0, got {slide:?}"));
        }
        for (name, d) in [("window", window), ("slide", slide)] {
            if !is_whole_millis(d) {
                return invalid(format!(
                    "{name} duration must be a whole number of milliseconds, got {d:?}"
                ));
            }
        }
        if !is_multiple_of(window, parent_slide) {
            return invalid(format!(
                "window duration {window:?} must be a multiple of the parent slide {parent_slide:?}"
            ));
        }
        if !is_multiple_of(slide, parent_slide) {
            return invalid(format!(
                "slide duration {slide:?} must be a multiple of the parent slide {parent_slide:?}"
            ));
        }
        Ok(Self { window, slide })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn slide(&self) -> Duration {
        self.slide
    }

    /// Exclusive start of the window ending at `time`.
    pub fn start(&self, time: Time) -> Time {
        time - self.window
    }
}

fn invalid<T>(detail: String) -> CoreResult<T> {
    StructError::from(CoreReason::Configuration)
        .with_detail(detail)
        .err()
}

/// Union of the batches stamped in `(from, to]`. Times with no batch are
/// skipped, so a window that reaches before the first tick is just smaller.
pub(crate) fn slice(history: &BTreeMap<Time, Batch>, from: Time, to: Time) -> Batch {
    if from >= to {
        return Batch::empty();
    }
    Batch::union_all(
        history
            .range((Bound::Excluded(from), Bound::Included(to)))
            .map(|(_, b)| b),
    )
}

// ---------------------------------------------------------------------------
// ReducedWindow — incremental keyed window reduction
// ---------------------------------------------------------------------------

/// Keyed reduction over a sliding window, maintained incrementally from the
/// previous window's result: values that left the trailing edge are removed
/// with `inverse`, values that entered are folded in with `reduce`.
///
/// Falls back to a full reduction whenever the previous result is not
/// available (first window, a failed tick) or windows do not overlap.
pub(crate) struct ReducedWindow {
    pub(crate) spec: WindowSpec,
    reduce: ReduceFn,
    inverse: ReduceFn,
    filter: Option<FilterFn>,
    partitions: usize,
}

impl ReducedWindow {
    pub(crate) fn new(
        spec: WindowSpec,
        reduce: ReduceFn,
        inverse: ReduceFn,
        filter: Option<FilterFn>,
        partitions: usize,
    ) -> Self {
        Self {
            spec,
            reduce,
            inverse,
            filter,
            partitions,
        }
    }

    /// History the parent must retain for this node to compute.
    pub(crate) fn parent_retention(&self) -> Duration {
        self.spec.window + self.spec.slide
    }

    /// `parent` holds the parent's per-time batches (already reduced by key);
    /// `previous` is this node's own result at `time - slide`.
    pub(crate) fn compute(
        &self,
        time: Time,
        parent: &BTreeMap<Time, Batch>,
        previous: Option<&Batch>,
    ) -> Batch {
        let (w, s) = (self.spec.window, self.spec.slide);
        let mut acc: BTreeMap<Value, Value> = match previous {
            Some(prev) if w >= s => {
                let mut acc: BTreeMap<Value, Value> =
                    prev.iter().cloned().map(Value::into_pair).collect();
                let leaving = slice(parent, time - s - w, time - w);
                for (k, values) in leaving.grouped() {
                    if let Some(cur) = acc.get_mut(&k) {
                        for v in &values {
                            *cur = (self.inverse)(cur, v);
                        }
                    }
                }
                let entering = slice(parent, time - s, time);
                self.fold_in(&mut acc, &entering);
                acc
            }
            _ => {
                let mut acc = BTreeMap::new();
                self.fold_in(&mut acc, &slice(parent, self.spec.start(time), time));
                acc
            }
        };

        if let Some(filter) = &self.filter {
            acc.retain(|k, v| filter(&Value::Tuple(vec![k.clone(), v.clone()])));
        }
        shuffle(acc, self.partitions)
    }

    fn fold_in(&self, acc: &mut BTreeMap<Value, Value>, batch: &Batch) {
        for (k, values) in batch.grouped() {
            let mut iter = values.into_iter();
            let cur = match acc.remove(&k) {
                Some(cur) => cur,
                None => match iter.next() {
                    Some(first) => first,
                    None => continue,
                },
            };
            let folded = iter.fold(cur, |a, v| (self.reduce)(&a, &v));
            acc.insert(k, folded);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
