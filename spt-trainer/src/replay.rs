use spt_core::experience::Experience;
use std::collections::VecDeque;
use std::sync::Arc;

/// Bounded FIFO experience store. Oldest records fall out first once the
/// capacity is reached, so learn phases always see the freshest window of
/// self-play.
pub struct ReplayBuffer {
    capacity: usize,
    items: VecDeque<Experience>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "replay buffer needs a positive capacity");
        ReplayBuffer {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, experience: Experience) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(experience);
    }

    pub fn extend(&mut self, experiences: impl IntoIterator<Item = Experience>) {
        for experience in experiences {
            self.push(experience);
        }
    }

    /// An immutable snapshot for a learn phase. Shared by reference with the
    /// learn task; later pushes do not affect it.
    pub fn snapshot(&self) -> Arc<Vec<Experience>> {
        Arc::new(self.items.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn sample(ret: f32) -> Experience {
        Experience {
            slots: vec![ArrayD::from_elem(IxDyn(&[2]), ret)],
            action: 0,
            ret,
        }
    }

    #[test]
    fn oldest_records_are_evicted_first() {
        let mut buffer = ReplayBuffer::new(3);
        buffer.extend((0..5).map(|i| sample(i as f32)));

        assert_eq!(buffer.len(), 3);
        let returns: Vec<f32> = buffer.snapshot().iter().map(|e| e.ret).collect();
        assert_eq!(returns, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_pushes() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.push(sample(1.0));

        let snapshot = buffer.snapshot();
        buffer.push(sample(2.0));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(buffer.len(), 2);
    }
}
