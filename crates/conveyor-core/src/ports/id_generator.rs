//! IdGenerator port - task id generation.
//!
//! The default generator builds ULIDs from the clock's millisecond timestamp
//! plus random bits, rendered as `task-<ULID>`.

use std::sync::atomic::{AtomicU64, Ordering};

use ulid::Ulid;

use crate::domain::TaskId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID based generator.
///
/// Uses the injected `Clock` for the timestamp half so tests can pin it.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        TaskId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

/// Monotonic `<prefix><n>` ids, starting at 1.
pub struct SequentialGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialGenerator {
    fn generate_task_id(&self) -> TaskId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        TaskId::new(format!("{}{}", self.prefix, n))
    }
}
