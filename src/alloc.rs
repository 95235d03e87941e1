//! Disk allocation strategies.
//!
//! A strategy maps the index of a block within a block sequence to the disk the block is placed on.

use rand::seq::SliceRandom;
use rand::Rng;

/// Allocation strategy interface.
pub trait AllocStrategy: Send + Sync {
    /// Returns the disk for the `index`-th block of a sequence.
    fn disk(&self, index: u64) -> usize;
}

/// Places consecutive blocks on consecutive disks.
#[derive(Debug, Clone)]
pub struct Striping {
    ndisks: usize,
}

impl Striping {
    pub fn new(ndisks: usize) -> Self {
        Striping { ndisks: ndisks.max(1) }
    }
}

impl AllocStrategy for Striping {
    fn disk(&self, index: u64) -> usize {
        (index % self.ndisks as u64) as usize
    }
}

/// Striping starting from a randomly chosen disk.
#[derive(Debug, Clone)]
pub struct SimpleRandom {
    ndisks: usize,
    offset: usize,
}

impl SimpleRandom {
    pub fn new(ndisks: usize) -> Self {
        let ndisks = ndisks.max(1);
        SimpleRandom {
            ndisks,
            offset: rand::thread_rng().gen_range(0..ndisks),
        }
    }
}

impl AllocStrategy for SimpleRandom {
    fn disk(&self, index: u64) -> usize {
        ((index + self.offset as u64) % self.ndisks as u64) as usize
    }
}

/// Places every block on an independently chosen random disk.
#[derive(Debug, Clone)]
pub struct FullyRandom {
    ndisks: usize,
}

impl FullyRandom {
    pub fn new(ndisks: usize) -> Self {
        FullyRandom { ndisks: ndisks.max(1) }
    }
}

impl AllocStrategy for FullyRandom {
    fn disk(&self, _index: u64) -> usize {
        rand::thread_rng().gen_range(0..self.ndisks)
    }
}

/// Striping over a random permutation of the disks.
#[derive(Debug, Clone)]
pub struct RandomCyclic {
    permutation: Vec<usize>,
}

impl RandomCyclic {
    pub fn new(ndisks: usize) -> Self {
        let mut permutation = Vec::from_iter(0..ndisks.max(1));
        permutation.shuffle(&mut rand::thread_rng());
        RandomCyclic { permutation }
    }
}

impl AllocStrategy for RandomCyclic {
    fn disk(&self, index: u64) -> usize {
        self.permutation[(index % self.permutation.len() as u64) as usize]
    }
}

/// Allocation policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    Striping,
    SimpleRandom,
    FullyRandom,
    RandomCyclic,
}

impl AllocPolicy {
    /// Builds a strategy instance spreading blocks over `ndisks` disks.
    pub fn build(self, ndisks: usize) -> Box<dyn AllocStrategy> {
        match self {
            AllocPolicy::Striping => Box::new(Striping::new(ndisks)),
            AllocPolicy::SimpleRandom => Box::new(SimpleRandom::new(ndisks)),
            AllocPolicy::FullyRandom => Box::new(FullyRandom::new(ndisks)),
            AllocPolicy::RandomCyclic => Box::new(RandomCyclic::new(ndisks)),
        }
    }
}

impl Default for AllocPolicy {
    fn default() -> Self {
        AllocPolicy::RandomCyclic
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{AllocPolicy, AllocStrategy, RandomCyclic, SimpleRandom, Striping};

    #[test]
    fn test_striping() {
        let strategy = Striping::new(3);
        let disks: Vec<usize> = (0..7).map(|i| strategy.disk(i)).collect();
        assert_eq!(disks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_simple_random_is_shifted_striping() {
        let strategy = SimpleRandom::new(4);
        let first = strategy.disk(0);
        for i in 0..16 {
            assert_eq!(strategy.disk(i), (first + i as usize) % 4);
        }
    }

    #[test]
    fn test_random_cyclic_visits_every_disk_once_per_cycle() {
        let strategy = RandomCyclic::new(5);
        let mut cycle: Vec<usize> = (0..5).map(|i| strategy.disk(i)).collect();
        let next_cycle: Vec<usize> = (5..10).map(|i| strategy.disk(i)).collect();
        assert_eq!(cycle, next_cycle);

        cycle.sort();
        assert_eq!(cycle, vec![0, 1, 2, 3, 4]);
    }

    #[rstest]
    #[case(AllocPolicy::Striping)]
    #[case(AllocPolicy::SimpleRandom)]
    #[case(AllocPolicy::FullyRandom)]
    #[case(AllocPolicy::RandomCyclic)]
    fn test_policy_stays_in_range(#[case] policy: AllocPolicy) {
        let strategy = policy.build(3);
        assert!((0..100).all(|i| strategy.disk(i) < 3));

        let single = policy.build(1);
        assert!((0..10).all(|i| single.disk(i) == 0));
    }
}
