//! Single-slot channel carrying the trespassing person count to the crowd
//! detector within one pipeline cycle.

/// Person count tagged with the cycle that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedCount {
    pub value: usize,
    pub produced_at_cycle: u64,
}

/// Last-write-wins slot with one producer and one consumer.
///
/// No locking: the producer's alert pass and the consumer's visual pass run
/// sequentially on the pipeline thread.
#[derive(Debug, Default)]
pub struct SharedSignalBus {
    slot: Option<SharedCount>,
}

impl SharedSignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, cycle: u64, value: usize) {
        self.slot = Some(SharedCount {
            value,
            produced_at_cycle: cycle,
        });
    }

    /// The count published during `cycle`, provided the producer ran this
    /// cycle. `None` tells the consumer to count on its own.
    pub fn consume(&self, cycle: u64, producer_active: bool) -> Option<usize> {
        if !producer_active {
            return None;
        }
        self.slot
            .filter(|count| count.produced_at_cycle == cycle)
            .map(|count| count.value)
    }

    pub fn latest(&self) -> Option<SharedCount> {
        self.slot
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}
