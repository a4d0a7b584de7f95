//! Tiered FIFO queue: strict priority across tiers, submission order within one.

use super::types::WorkPriority;
use std::collections::{HashMap, VecDeque};

/// Priority queue with one FIFO lane per [`WorkPriority`] tier
#[derive(Debug)]
pub struct PriorityQueue<T> {
    lanes: [VecDeque<T>; 4],
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: Default::default(),
        }
    }

    pub fn push(&mut self, priority: WorkPriority, item: T) {
        self.lanes[priority.tier()].push_back(item);
    }

    /// Oldest item of the highest non-empty tier
    pub fn pop(&mut self) -> Option<(WorkPriority, T)> {
        WorkPriority::ALL
            .iter()
            .find_map(|p| self.lanes[p.tier()].pop_front().map(|item| (*p, item)))
    }

    pub fn peek_priority(&self) -> Option<WorkPriority> {
        WorkPriority::ALL
            .iter()
            .copied()
            .find(|p| !self.lanes[p.tier()].is_empty())
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn len_by_priority(&self) -> HashMap<WorkPriority, usize> {
        WorkPriority::ALL
            .iter()
            .map(|p| (*p, self.lanes[p.tier()].len()))
            .collect()
    }

    /// Remove and return everything, highest priority first
    pub fn drain(&mut self) -> Vec<(WorkPriority, T)> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(entry) = self.pop() {
            drained.push(entry);
        }
        drained
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = PriorityQueue::new();
        queue.push(WorkPriority::Normal, "A");
        queue.push(WorkPriority::Critical, "B");
        queue.push(WorkPriority::Normal, "C");
        queue.push(WorkPriority::Low, "D");
        queue.push(WorkPriority::High, "E");

        let order: Vec<&str> = queue.drain().into_iter().map(|(_, item)| item).collect();
        assert_eq!(order, vec!["B", "E", "A", "C", "D"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_counts_by_priority() {
        let mut queue = PriorityQueue::new();
        queue.push(WorkPriority::Low, 1);
        queue.push(WorkPriority::Low, 2);
        queue.push(WorkPriority::High, 3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_priority(), Some(WorkPriority::High));
        let counts = queue.len_by_priority();
        assert_eq!(counts[&WorkPriority::Low], 2);
        assert_eq!(counts[&WorkPriority::Critical], 0);
    }
}
