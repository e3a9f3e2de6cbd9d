//! FIFO of ready jobs, between the strategy and the scheduler.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::strategy::Job;

#[derive(Debug, Default)]
pub struct RequestPool {
    queue: Mutex<VecDeque<Job>>,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.queue.lock().expect("request pool lock").push_back(job);
    }

    pub fn pop(&self) -> Option<Job> {
        self.queue.lock().expect("request pool lock").pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("request pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BlockRange;

    #[test]
    fn pops_in_push_order() {
        let pool = RequestPool::new();
        for i in 0..3u64 {
            pool.push(Job {
                store_name: format!("s{i}"),
                range: BlockRange::new(i * 10, (i + 1) * 10),
            });
        }
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.pop().unwrap().store_name, "s0");
        assert_eq!(pool.pop().unwrap().store_name, "s1");
        assert_eq!(pool.pop().unwrap().store_name, "s2");
        assert!(pool.pop().is_none());
    }
}
