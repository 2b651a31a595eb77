use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Handle returned by [`PriorityQueue::push`] for random removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

/// A min-priority queue with lazy random removal.
///
/// Lower priorities pop first; equal priorities pop in insertion order. The
/// background sweep uses stale deadlines as priorities, so the most overdue
/// revalidation is dispatched first.
#[derive(Debug)]
pub struct PriorityQueue<P, T> {
    heap: BinaryHeap<Reverse<(P, u64)>>,
    /// Live items by sequence number. Removed items stay in `heap` until popped.
    items: HashMap<u64, T>,
    seq: u64,
}

impl<P: Ord + Copy, T> Default for PriorityQueue<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Ord + Copy, T> PriorityQueue<P, T> {
    pub fn new() -> Self {
        PriorityQueue {
            heap: BinaryHeap::new(),
            items: HashMap::new(),
            seq: 0,
        }
    }

    pub fn push(&mut self, priority: P, item: T) -> Token {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse((priority, seq)));
        self.items.insert(seq, item);
        Token(seq)
    }

    /// Remove the item pushed with `token`, if it has not been popped yet.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        self.items.remove(&token.0)
    }

    /// Priority of the next item to pop.
    pub fn peek_priority(&mut self) -> Option<P> {
        self.discard_removed();
        self.heap.peek().map(|Reverse((priority, _))| *priority)
    }

    pub fn pop(&mut self) -> Option<(P, T)> {
        self.discard_removed();
        let Reverse((priority, seq)) = self.heap.pop()?;
        let item = self.items.remove(&seq)?;
        Some((priority, item))
    }

    /// Pop the next item only if its priority is at most `bound`.
    pub fn pop_if_due(&mut self, bound: P) -> Option<(P, T)> {
        match self.peek_priority() {
            Some(priority) if priority <= bound => self.pop(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.items.clear();
    }

    fn discard_removed(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.items.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
