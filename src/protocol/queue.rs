//! 信封优先队列：context.priority 大者先出，同优先级先进先出

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::protocol::envelope::Envelope;

#[derive(Debug)]
struct Queued {
    priority: i32,
    seq: u64,
    envelope: Envelope,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            priority: envelope.context.priority,
            seq,
            envelope,
        });
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.heap.pop().map(|q| q.envelope)
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.heap.peek().map(|q| &q.envelope)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
