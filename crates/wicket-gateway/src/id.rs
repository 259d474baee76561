//! Connection IDs and the generators that mint them

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Connection identifier, unique for the lifetime of a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of connection IDs. Implementations must never repeat an ID.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> ConnId;
}

/// Monotonic counter starting at 1
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> ConnId {
        ConnId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

const TIME_BITS: u32 = 39;
const SEQUENCE_BITS: u32 = 8;
const MACHINE_BITS: u32 = 16;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const TIME_MASK: u64 = (1 << TIME_BITS) - 1;
/// 2014-09-01T00:00:00Z
const DEFAULT_EPOCH_MS: i64 = 1_409_529_600_000;
const TICK_MS: i64 = 10;

#[derive(Debug)]
struct SnowflakeState {
    elapsed: u64,
    sequence: u64,
}

/// Time-ordered IDs laid out as 39 bits of 10ms ticks since an epoch,
/// 8 bits of sequence and 16 bits of machine ID.
///
/// When the 256 IDs of one tick are used up the generator borrows the next
/// tick instead of waiting for the clock, so it never blocks. A clock that
/// steps backwards is treated the same way.
#[derive(Debug)]
pub struct SnowflakeIdGenerator {
    epoch_ms: i64,
    machine_id: u16,
    state: Mutex<SnowflakeState>,
}

impl SnowflakeIdGenerator {
    pub fn new(machine_id: u16) -> Self {
        Self {
            epoch_ms: DEFAULT_EPOCH_MS,
            machine_id,
            state: Mutex::new(SnowflakeState {
                elapsed: 0,
                sequence: 0,
            }),
        }
    }

    /// Count ticks from `epoch` instead of the default
    pub fn with_epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch_ms = epoch.timestamp_millis();
        self
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    /// Split an ID into `(ticks, sequence, machine_id)`
    pub fn decompose(id: ConnId) -> (u64, u64, u16) {
        let raw = id.0;
        let machine = (raw & ((1 << MACHINE_BITS) - 1)) as u16;
        let sequence = (raw >> MACHINE_BITS) & SEQUENCE_MASK;
        let ticks = raw >> (MACHINE_BITS + SEQUENCE_BITS);
        (ticks, sequence, machine)
    }

    fn current_ticks(&self) -> u64 {
        let elapsed_ms = Utc::now().timestamp_millis() - self.epoch_ms;
        (elapsed_ms.max(0) / TICK_MS) as u64
    }

    fn compose(&self, elapsed: u64, sequence: u64) -> ConnId {
        ConnId(
            ((elapsed & TIME_MASK) << (SEQUENCE_BITS + MACHINE_BITS))
                | (sequence << MACHINE_BITS)
                | u64::from(self.machine_id),
        )
    }
}

impl IdGenerator for SnowflakeIdGenerator {
    fn next_id(&self) -> ConnId {
        let now = self.current_ticks();
        let mut state = self.state.lock();

        if now > state.elapsed {
            state.elapsed = now;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.elapsed += 1;
            }
        }

        self.compose(state.elapsed, state.sequence)
    }
}

/// 64 random bits per ID, taken from a v4 UUID
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> ConnId {
        ConnId(Uuid::new_v4().as_u128() as u64)
    }
}
