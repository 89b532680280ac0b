//! Multi-level ready queue of a processor.
use crate::thread::ThreadHandle;
use alloc::{collections::VecDeque, vec::Vec};

/// Ready threads of one processor, bucketed by priority level.
///
/// Level 0 is dispatched first. Every level is FIFO.
pub(crate) struct RunQueue {
    levels: Vec<VecDeque<ThreadHandle>>,
    len: usize,
}

impl RunQueue {
    pub(crate) fn new(levels: usize) -> Self {
        Self {
            levels: (0..levels).map(|_| VecDeque::new()).collect(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn levels(&self) -> usize {
        self.levels.len()
    }

    pub(crate) fn level_len(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub(crate) fn iter_level(&self, level: usize) -> impl Iterator<Item = ThreadHandle> + '_ {
        self.levels[level].iter().copied()
    }

    /// Most urgent non-empty level.
    pub(crate) fn highest(&self) -> Option<usize> {
        self.levels.iter().position(|q| !q.is_empty())
    }

    pub(crate) fn push(&mut self, level: usize, thread: ThreadHandle) {
        self.levels[level].push_back(thread);
        self.len += 1;
    }

    /// Takes the oldest thread of the most urgent level.
    pub(crate) fn pop(&mut self) -> Option<(usize, ThreadHandle)> {
        let level = self.highest()?;
        let thread = self.levels[level].pop_front()?;
        self.len -= 1;
        Some((level, thread))
    }

    /// Takes the least urgent thread `eligible` accepts, scanning levels from
    /// the last one and every level from its tail.
    pub(crate) fn steal(
        &mut self,
        mut eligible: impl FnMut(ThreadHandle) -> bool,
    ) -> Option<(usize, ThreadHandle)> {
        for level in (0..self.levels.len()).rev() {
            if let Some(found) = self.steal_at(level, &mut eligible) {
                return Some((level, found));
            }
        }
        None
    }

    /// Like [`steal`](Self::steal) restricted to a single level.
    pub(crate) fn steal_at(
        &mut self,
        level: usize,
        mut eligible: impl FnMut(ThreadHandle) -> bool,
    ) -> Option<ThreadHandle> {
        let queue = &mut self.levels[level];
        let pos = queue.iter().rposition(|&th| eligible(th))?;
        let thread = queue.remove(pos)?;
        self.len -= 1;
        Some(thread)
    }

    /// Promotes every level below `start` by one, `step` times.
    ///
    /// Threads of level `i + 1` are appended behind those already waiting at
    /// level `i`. Returns the number of threads that moved.
    pub(crate) fn age(&mut self, start: usize, step: usize) -> usize {
        let mut moved = 0;
        for _ in 0..step {
            for level in start..self.levels.len().saturating_sub(1) {
                let mut below = core::mem::take(&mut self.levels[level + 1]);
                moved += below.len();
                self.levels[level].append(&mut below);
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn th(n: u64) -> ThreadHandle {
        ThreadHandle::from_raw(n)
    }

    #[test]
    fn dispatches_most_urgent_first_and_fifo_within_level() {
        let mut rq = RunQueue::new(4);
        rq.push(2, th(1));
        rq.push(0, th(2));
        rq.push(2, th(3));
        rq.push(0, th(4));
        assert_eq!(rq.len(), 4);
        assert_eq!(rq.pop(), Some((0, th(2))));
        assert_eq!(rq.pop(), Some((0, th(4))));
        assert_eq!(rq.pop(), Some((2, th(1))));
        assert_eq!(rq.pop(), Some((2, th(3))));
        assert_eq!(rq.pop(), None);
        assert_eq!(rq.len(), 0);
    }

    #[test]
    fn aging_promotes_levels_below_start() {
        let mut rq = RunQueue::new(4);
        rq.push(0, th(1));
        rq.push(1, th(2));
        rq.push(2, th(3));
        rq.push(3, th(4));

        assert_eq!(rq.age(1, 1), 2);
        assert_eq!(rq.level_len(0), 1);
        assert_eq!(rq.iter_level(1).collect::<Vec<_>>(), [th(2), th(3)]);
        assert_eq!(rq.iter_level(2).collect::<Vec<_>>(), [th(4)]);
        assert_eq!(rq.level_len(3), 0);
        assert_eq!(rq.len(), 4);
    }

    #[test]
    fn repeated_aging_reaches_the_top() {
        let mut rq = RunQueue::new(8);
        rq.push(0, th(1));
        rq.push(7, th(9));
        let mut level = 7;
        while level > 0 {
            rq.age(0, 1);
            let now = (0..8)
                .find(|&l| rq.iter_level(l).any(|t| t == th(9)))
                .unwrap();
            assert!(now < level);
            level = now;
        }
        // Behind the thread that was already there.
        assert_eq!(rq.iter_level(0).collect::<Vec<_>>(), [th(1), th(9)]);
    }

    #[test]
    fn aging_step_moves_several_levels() {
        let mut rq = RunQueue::new(4);
        rq.push(3, th(1));
        rq.age(0, 3);
        assert_eq!(rq.pop(), Some((0, th(1))));
    }

    #[test]
    fn steal_takes_least_urgent_from_the_tail() {
        let mut rq = RunQueue::new(3);
        rq.push(0, th(1));
        rq.push(2, th(2));
        rq.push(2, th(3));
        rq.push(2, th(4));

        assert_eq!(rq.steal(|t| t != th(4)), Some((2, th(3))));
        assert_eq!(rq.steal_at(1, |_| true), None);
        assert_eq!(rq.steal(|t| t == th(1)), Some((0, th(1))));
        assert_eq!(rq.steal(|_| false), None);
        assert_eq!(rq.len(), 2);
    }
}
