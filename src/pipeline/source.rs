//! Upstream task producers.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::Task;

/// Pull-based producer. `None` is the end of the stream.
///
/// Any iterator of tasks is a source.
pub trait TaskSource {
    fn next_task(&mut self) -> Option<Task>;
}

impl<I: Iterator<Item = Task>> TaskSource for I {
    fn next_task(&mut self) -> Option<Task> {
        self.next()
    }
}

/// How [`VectorSource`] fills its input vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPattern {
    /// `a[i] = i`, `b[i] = 2i`.
    #[default]
    Linear,
    /// Uniform values in `-1000..=1000` from a seeded generator.
    Random { seed: u64 },
}

/// Emits `count` tasks of `n` elements. All tasks share the same input
/// vectors; each gets its own output.
pub struct VectorSource {
    a: Arc<[i32]>,
    b: Arc<[i32]>,
    remaining: usize,
    next_id: u64,
}

impl VectorSource {
    pub fn new(n: usize, count: usize, pattern: InputPattern) -> Self {
        let (a, b): (Arc<[i32]>, Arc<[i32]>) = match pattern {
            InputPattern::Linear => (
                (0..n).map(|i| i as i32).collect(),
                (0..n).map(|i| (i as i32).wrapping_mul(2)).collect(),
            ),
            InputPattern::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                let a = (0..n).map(|_| rng.gen_range(-1000..=1000)).collect();
                let b = (0..n).map(|_| rng.gen_range(-1000..=1000)).collect();
                (a, b)
            }
        };
        Self {
            a,
            b,
            remaining: count,
            next_id: 1,
        }
    }

    pub fn inputs(&self) -> (&[i32], &[i32]) {
        (&self.a, &self.b)
    }
}

impl Iterator for VectorSource {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let id = self.next_id;
        self.next_id += 1;
        // Inputs are equal length by construction.
        Task::new(id, Arc::clone(&self.a), Arc::clone(&self.b)).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
