use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::time::Time;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// Feeds an input stream one batch per tick.
///
/// `poll` must return immediately with whatever arrived for `time` (possibly
/// nothing). `commit` tells the source that every batch up to `time` is
/// covered by a durable checkpoint (or needs no replay). `position` is stored
/// in checkpoints and handed back to `restore` on recovery.
pub trait Source: Send {
    fn kind(&self) -> &'static str;

    fn poll(&mut self, time: Time) -> anyhow::Result<Batch>;

    fn commit(&mut self, _time: Time) {}

    /// True while records are buffered that a later tick would return.
    fn has_pending(&self) -> bool;

    fn position(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn restore(&mut self, _position: &serde_json::Value, _time: Time) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueueSource
// ---------------------------------------------------------------------------

/// A queue of pre-built batches.
pub struct QueueSource {
    queue: VecDeque<Batch>,
    one_at_a_time: bool,
    default: Option<Batch>,
    consumed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueuePosition {
    consumed: usize,
}

impl QueueSource {
    pub fn new(batches: impl IntoIterator<Item = Batch>) -> Self {
        Self {
            queue: batches.into_iter().collect(),
            one_at_a_time: true,
            default: None,
            consumed: 0,
        }
    }

    /// Drain the whole queue on the first tick instead of one batch per tick.
    pub fn all_at_once(mut self) -> Self {
        self.one_at_a_time = false;
        self
    }

    /// Batch returned once the queue is empty.
    pub fn with_default(mut self, batch: Batch) -> Self {
        self.default = Some(batch);
        self
    }
}

impl Source for QueueSource {
    fn kind(&self) -> &'static str {
        "queue"
    }

    fn poll(&mut self, _time: Time) -> anyhow::Result<Batch> {
        if self.queue.is_empty() {
            return Ok(self.default.clone().unwrap_or_default());
        }
        if self.one_at_a_time {
            self.consumed += 1;
            return Ok(self.queue.pop_front().unwrap_or_default());
        }
        self.consumed += self.queue.len();
        let drained: Vec<Batch> = self.queue.drain(..).collect();
        Ok(Batch::union_all(&drained))
    }

    fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    fn position(&self) -> serde_json::Value {
        serde_json::json!(QueuePosition {
            consumed: self.consumed
        })
    }

    fn restore(&mut self, position: &serde_json::Value, _time: Time) -> anyhow::Result<()> {
        let pos: QueuePosition =
            serde_json::from_value(position.clone()).context("invalid queue source position")?;
        let skip = pos.consumed.saturating_sub(self.consumed).min(self.queue.len());
        self.queue.drain(..skip);
        self.consumed = pos.consumed;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReceiverBuffer
// ---------------------------------------------------------------------------

/// Time-tagged buffer fed by external receivers.
///
/// Clones share one buffer: receivers push through one handle while the
/// stream polls another. Records pushed between two ticks belong to the
/// later tick. A polled block is kept until a commit covers its time, and
/// after recovery the uncovered blocks are returned again at their original
/// times.
#[derive(Clone)]
pub struct ReceiverBuffer {
    inner: Arc<Mutex<ReceiverState>>,
    partitions: usize,
}

#[derive(Default)]
struct ReceiverState {
    pending: Vec<Value>,
    blocks: BTreeMap<Time, Vec<Value>>,
    replay: BTreeMap<Time, Vec<Value>>,
    committed: Time,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReceiverPosition {
    committed: Time,
}

impl ReceiverBuffer {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            partitions: 1,
        }
    }

    /// Partition count of polled batches.
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.lock().pending.push(value.into());
    }

    pub fn extend<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) {
        self.lock().pending.extend(values.into_iter().map(Into::into));
    }

    /// Records polled but not yet covered by a commit.
    pub fn unconfirmed(&self) -> usize {
        let st = self.lock();
        st.blocks.values().chain(st.replay.values()).map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReceiverState> {
        self.inner.lock().expect("receiver buffer lock poisoned")
    }
}

impl Default for ReceiverBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for ReceiverBuffer {
    fn kind(&self) -> &'static str {
        "receiver"
    }

    fn poll(&mut self, time: Time) -> anyhow::Result<Batch> {
        let mut st = self.lock();
        let due: Vec<Time> = st.replay.range(..=time).map(|(t, _)| *t).collect();
        let values = if due.is_empty() {
            std::mem::take(&mut st.pending)
        } else {
            due.iter()
                .filter_map(|t| st.replay.remove(t))
                .flatten()
                .collect()
        };
        if !values.is_empty() {
            st.blocks.entry(time).or_default().extend(values.iter().cloned());
        }
        Ok(Batch::from_values(values, self.partitions))
    }

    fn commit(&mut self, time: Time) {
        let mut st = self.lock();
        st.blocks.retain(|t, _| *t > time);
        st.committed = st.committed.max(time);
    }

    fn has_pending(&self) -> bool {
        let st = self.lock();
        !st.pending.is_empty() || !st.replay.is_empty()
    }

    fn position(&self) -> serde_json::Value {
        serde_json::json!(ReceiverPosition {
            committed: self.lock().committed
        })
    }

    fn restore(&mut self, _position: &serde_json::Value, time: Time) -> anyhow::Result<()> {
        let mut st = self.lock();
        let blocks = std::mem::take(&mut st.blocks);
        let mut replayed = 0;
        for (t, values) in blocks {
            if t > time {
                replayed += values.len();
                st.replay.entry(t).or_default().extend(values);
            }
        }
        if replayed > 0 {
            log::warn!("receiver buffer replays {replayed} records polled after {time}");
        }
        st.committed = time;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> Time {
        Time::from_millis(n)
    }

    fn ints(b: &Batch) -> Vec<i64> {
        b.iter().filter_map(Value::as_int).collect()
    }

    #[test]
    fn queue_one_at_a_time_then_default() {
        let mut q = QueueSource::new(vec![Batch::single(1), Batch::single(2)])
            .with_default(Batch::single(0));
        assert_eq!(ints(&q.poll(t(500)).unwrap()), vec![1]);
        assert!(q.has_pending());
        assert_eq!(ints(&q.poll(t(1000)).unwrap()), vec![2]);
        assert!(!q.has_pending());
        assert_eq!(ints(&q.poll(t(1500)).unwrap()), vec![0]);
    }

    #[test]
    fn queue_all_at_once_keeps_partitions() {
        let mut q = QueueSource::new(vec![
            Batch::from_values(vec![1.into(), 2.into()], 2),
            Batch::single(3),
        ])
        .all_at_once();
        let b = q.poll(t(500)).unwrap();
        assert_eq!(b.num_partitions(), 3);
        assert!(q.poll(t(1000)).unwrap().is_empty());
    }

    #[test]
    fn queue_restore_skips_consumed() {
        let batches = || (1..=4).map(Batch::single).collect::<Vec<_>>();
        let mut first = QueueSource::new(batches());
        first.poll(t(500)).unwrap();
        first.poll(t(1000)).unwrap();
        let pos = first.position();

        let mut second = QueueSource::new(batches());
        second.restore(&pos, t(1000)).unwrap();
        assert_eq!(ints(&second.poll(t(1500)).unwrap()), vec![3]);
        assert!(second.restore(&serde_json::json!("bogus"), t(0)).is_err());
    }

    #[test]
    fn receiver_assigns_pushes_to_next_tick() {
        let buf = ReceiverBuffer::new();
        let mut src = buf.clone();
        buf.extend([1, 2]);
        assert!(src.has_pending());
        assert_eq!(ints(&src.poll(t(500)).unwrap()), vec![1, 2]);
        assert!(src.poll(t(1000)).unwrap().is_empty());
        assert_eq!(buf.unconfirmed(), 2);
        src.commit(t(500));
        assert_eq!(buf.unconfirmed(), 0);
    }

    #[test]
    fn receiver_replays_uncommitted_blocks_at_original_times() {
        let buf = ReceiverBuffer::new();
        let mut src = buf.clone();
        buf.push(1);
        src.poll(t(500)).unwrap();
        src.commit(t(500));
        buf.push(2);
        src.poll(t(1000)).unwrap();
        buf.push(3);
        src.poll(t(1500)).unwrap();
        buf.push(4);

        // Recovered from the checkpoint at 500: 1000 and 1500 are replayed.
        src.restore(&serde_json::Value::Null, t(500)).unwrap();
        assert!(src.has_pending());
        assert_eq!(ints(&src.poll(t(1000)).unwrap()), vec![2]);
        assert_eq!(ints(&src.poll(t(1500)).unwrap()), vec![3]);
        assert_eq!(ints(&src.poll(t(2000)).unwrap()), vec![4]);
        assert!(!src.has_pending());
    }
}
