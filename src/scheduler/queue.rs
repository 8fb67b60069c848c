//! Priority+FIFO job queue (§4.C): a `BinaryHeap` ordered by
//! `(priority, msg_number)`. Priority is a single ASCII digit stored in the
//! JID (`b'0'..=b'9'`, lower numeric = higher priority); ties break on
//! ascending `msg_number`, a monotonic counter minted at enqueue — together
//! they reproduce the "priority then insertion order" contract exactly.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::state::jid::JobRecord;

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub msg_number: u64,
    pub host_alias: String,
    pub job: JobRecord,
}

#[derive(Debug, Clone)]
struct Entry {
    priority: u8,
    msg_number: u64,
    job: QueuedJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.msg_number == other.msg_number
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// Reversed on both fields so `BinaryHeap`, a max-heap, pops the
    /// numerically lowest priority first and, among ties, the lowest
    /// (oldest) `msg_number` first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority).then(other.msg_number.cmp(&self.msg_number))
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<Entry>,
    next_msg_number: u64,
    paused: bool,
}

impl JobQueue {
    pub fn new() -> Self {
        JobQueue::default()
    }

    /// Enqueue a freshly-produced job, minting the next `msg_number`.
    pub fn push_new(&mut self, host_alias: impl Into<String>, job: JobRecord) -> u64 {
        let msg_number = self.next_msg_number;
        self.next_msg_number += 1;
        let queued = QueuedJob { msg_number, host_alias: host_alias.into(), job };
        self.heap.push(Entry { priority: queued.job.priority, msg_number, job: queued });
        msg_number
    }

    /// Re-insert a job that failed a burst handoff, preserving its original
    /// `msg_number` so it doesn't lose its place in line (§4.C burst policy:
    /// "re-queues the job").
    pub fn requeue(&mut self, queued: QueuedJob) {
        self.heap.push(Entry { priority: queued.job.priority, msg_number: queued.msg_number, job: queued });
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pop the next eligible job, or `None` if paused or empty. Does not
    /// itself check host admission — that's the scheduler's job, which may
    /// peek-and-reinsert several times in one admission pass.
    pub fn pop(&mut self) -> Option<QueuedJob> {
        if self.paused {
            return None;
        }
        self.heap.pop().map(|e| e.job)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain and drop every not-yet-dispatched job addressed to `host_alias`
    /// (§5 `stop(host)`: "drains the queue of that host's jobs not yet
    /// dispatched"). Returns the drained jobs for logging.
    pub fn drain_for_host(&mut self, host_alias: &str) -> Vec<QueuedJob> {
        let (keep, drained): (Vec<Entry>, Vec<Entry>) = self.heap.drain().partition(|e| e.job.host_alias != host_alias);
        self.heap = keep.into_iter().collect();
        drained.into_iter().map(|e| e.job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::jid::LockDiscipline;

    fn job(priority: u8) -> JobRecord {
        JobRecord::new(1, 2, "sftp://h/out", priority, "", "", 1, LockDiscipline::None)
    }

    #[test]
    fn pops_lowest_priority_first() {
        let mut q = JobQueue::new();
        q.push_new("h1", job(b'9'));
        q.push_new("h1", job(b'1'));
        q.push_new("h1", job(b'5'));
        assert_eq!(q.pop().unwrap().job.priority, b'1');
        assert_eq!(q.pop().unwrap().job.priority, b'5');
        assert_eq!(q.pop().unwrap().job.priority, b'9');
    }

    #[test]
    fn ties_break_on_insertion_order() {
        let mut q = JobQueue::new();
        let a = q.push_new("h1", job(b'5'));
        let b = q.push_new("h1", job(b'5'));
        assert!(a < b);
        assert_eq!(q.pop().unwrap().msg_number, a);
        assert_eq!(q.pop().unwrap().msg_number, b);
    }

    #[test]
    fn paused_queue_yields_nothing() {
        let mut q = JobQueue::new();
        q.push_new("h1", job(b'5'));
        q.pause();
        assert!(q.pop().is_none());
        q.resume();
        assert!(q.pop().is_some());
    }

    #[test]
    fn drain_for_host_removes_only_matching_jobs() {
        let mut q = JobQueue::new();
        q.push_new("h1", job(b'5'));
        q.push_new("h2", job(b'5'));
        let drained = q.drain_for_host("h1");
        assert_eq!(drained.len(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().host_alias, "h2");
    }
}
