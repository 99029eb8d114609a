//! Pipe queues of the scheduler.
//!
//! Queues only hold [`PipeId`]s; the pipes themselves live in the scheduler's pipe table and
//! remember which queue they are on, so an entry is never duplicated.

use std::collections::VecDeque;

use super::frame::Frame;
use crate::driver_interface::PipeId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
    /// Submitted while an engine was busy, not yet admitted into the schedule.
    Wait,
    /// Control and bulk work for this frame.
    Current,
    /// Control and bulk work retried after the next frame tick.
    Next,
    /// Periodic work, ordered by target frame.
    Timed,
    /// Finished transfers waiting for the dispatcher.
    Callback,
}

/// First in, first out queue of pipes.
#[derive(Debug, Default)]
pub struct PipeQueue {
    entries: VecDeque<PipeId>,
}

impl PipeQueue {
    pub fn push_back(&mut self, pipe: PipeId) {
        debug_assert!(!self.entries.contains(&pipe));
        self.entries.push_back(pipe);
    }

    pub fn pop_front(&mut self) -> Option<PipeId> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, pipe: PipeId) -> bool {
        match self.entries.iter().position(|entry| *entry == pipe) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Moves every entry of `other` to the back of `self`, keeping their order.
    pub fn merge(&mut self, other: &mut PipeQueue) {
        self.entries.append(&mut other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.entries.iter().copied()
    }
}

/// Queue of pipes ordered by frame. Entries with the same frame keep their insertion order.
#[derive(Debug, Default)]
pub struct FrameQueue {
    entries: VecDeque<(Frame, PipeId)>,
}

impl FrameQueue {
    pub fn insert(&mut self, frame: Frame, pipe: PipeId) {
        debug_assert!(self.frame_of(pipe).is_none());
        let index = self
            .entries
            .iter()
            .position(|(queued, _)| queued.is_after(frame))
            .unwrap_or(self.entries.len());
        self.entries.insert(index, (frame, pipe));
    }

    /// The head of the queue, if its frame has come.
    pub fn peek_due(&self, now: Frame) -> Option<PipeId> {
        match self.entries.front() {
            Some((frame, pipe)) if frame.is_due(now) => Some(*pipe),
            _ => None,
        }
    }

    pub fn pop_due(&mut self, now: Frame) -> Option<PipeId> {
        let pipe = self.peek_due(now)?;
        self.entries.pop_front();
        Some(pipe)
    }

    pub fn frame_of(&self, pipe: PipeId) -> Option<Frame> {
        self.entries
            .iter()
            .find(|(_, queued)| *queued == pipe)
            .map(|(frame, _)| *frame)
    }

    pub fn remove(&mut self, pipe: PipeId) -> bool {
        match self.entries.iter().position(|(_, queued)| *queued == pipe) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PipeId> + '_ {
        self.entries.drain(..).map(|(_, pipe)| pipe)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// All queues owned by the scheduler.
#[derive(Debug, Default)]
pub struct Queues {
    pub wait: PipeQueue,
    pub current: PipeQueue,
    pub next: PipeQueue,
    pub timed: FrameQueue,
    pub timeout: FrameQueue,
    pub callback: PipeQueue,
}

impl Queues {
    pub fn remove(&mut self, kind: QueueKind, pipe: PipeId) -> bool {
        match kind {
            QueueKind::Wait => self.wait.remove(pipe),
            QueueKind::Current => self.current.remove(pipe),
            QueueKind::Next => self.next.remove(pipe),
            QueueKind::Timed => self.timed.remove(pipe),
            QueueKind::Callback => self.callback.remove(pipe),
        }
    }

    /// Start of a frame: last frame's retries become this frame's work.
    pub fn merge_next(&mut self) {
        self.current.merge(&mut self.next);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_keeps_order() {
        let mut current = PipeQueue::default();
        let mut next = PipeQueue::default();
        current.push_back(PipeId(1));
        next.push_back(PipeId(2));
        next.push_back(PipeId(3));

        current.merge(&mut next);

        assert!(next.is_empty());
        assert_eq!(current.iter().collect::<Vec<_>>(), [PipeId(1), PipeId(2), PipeId(3)]);
    }

    #[test]
    fn frame_queue_is_ordered_and_stable() {
        let mut timed = FrameQueue::default();
        timed.insert(Frame(10), PipeId(1));
        timed.insert(Frame(5), PipeId(2));
        timed.insert(Frame(10), PipeId(3));
        timed.insert(Frame(7), PipeId(4));

        assert_eq!(timed.pop_due(Frame(4)), None);
        assert_eq!(timed.pop_due(Frame(9)), Some(PipeId(2)));
        assert_eq!(timed.pop_due(Frame(9)), Some(PipeId(4)));
        assert_eq!(timed.pop_due(Frame(9)), None);
        assert_eq!(timed.frame_of(PipeId(3)), Some(Frame(10)));
        assert_eq!(timed.pop_due(Frame(10)), Some(PipeId(1)));
        assert_eq!(timed.pop_due(Frame(10)), Some(PipeId(3)));
        assert_eq!(timed.drain().count(), 0);
    }

    #[test]
    fn frame_queue_across_wrap() {
        let mut timed = FrameQueue::default();
        let now = Frame(u32::MAX - 2);
        timed.insert(now.after(5), PipeId(1));
        timed.insert(now.after(1), PipeId(2));

        assert_eq!(timed.pop_due(now.after(1)), Some(PipeId(2)));
        assert_eq!(timed.pop_due(now.after(4)), None);
        assert_eq!(timed.pop_due(now.after(5)), Some(PipeId(1)));
    }

    #[test]
    fn remove_from_the_middle() {
        let mut queues = Queues::default();
        queues.current.push_back(PipeId(1));
        queues.current.push_back(PipeId(2));
        queues.current.push_back(PipeId(3));

        assert!(queues.remove(QueueKind::Current, PipeId(2)));
        assert!(!queues.remove(QueueKind::Current, PipeId(2)));
        assert_eq!(queues.current.iter().collect::<Vec<_>>(), [PipeId(1), PipeId(3)]);
    }
}
