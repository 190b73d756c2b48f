//! File-level lock automaton
//!
//! Models the engine's five-state database lock with one holder set per rung:
//!
//! ```text
//! UNLOCKED -> SHARED -> RESERVED -> PENDING -> EXCLUSIVE
//! ```
//!
//! Levels are cumulative. A connection at RESERVED, PENDING or EXCLUSIVE is
//! still a member of the shared set, the same way a unix VFS keeps the
//! SHARED byte range read-locked while climbing.
//!
//! Every transition either succeeds or returns `Busy` immediately. There is
//! no waiting anywhere in this module; it is driven under the lock manager's
//! mutex and must never block inside it.

use lockstep_core::{ConnectionId, LockError, LockLevel, LockResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Holder sets of the file lock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLockState {
    /// Every connection at SHARED or above
    shared: BTreeSet<ConnectionId>,
    /// RESERVED (or higher) holder
    reserved: Option<ConnectionId>,
    /// PENDING (or higher) holder
    pending: Option<ConnectionId>,
    /// EXCLUSIVE holder
    exclusive: Option<ConnectionId>,
}

impl FileLockState {
    /// Create an unlocked state
    pub fn new() -> Self {
        Self::default()
    }

    /// Strongest lock currently outstanding
    pub fn state(&self) -> LockLevel {
        if self.exclusive.is_some() {
            LockLevel::Exclusive
        } else if self.pending.is_some() {
            LockLevel::Pending
        } else if self.reserved.is_some() {
            LockLevel::Reserved
        } else if !self.shared.is_empty() {
            LockLevel::Shared
        } else {
            LockLevel::Unlocked
        }
    }

    /// Level held by one connection
    pub fn level_of(&self, conn: ConnectionId) -> LockLevel {
        if self.exclusive == Some(conn) {
            LockLevel::Exclusive
        } else if self.pending == Some(conn) {
            LockLevel::Pending
        } else if self.reserved == Some(conn) {
            LockLevel::Reserved
        } else if self.shared.contains(&conn) {
            LockLevel::Shared
        } else {
            LockLevel::Unlocked
        }
    }

    /// Connections at SHARED or above
    pub fn shared_holders(&self) -> &BTreeSet<ConnectionId> {
        &self.shared
    }

    /// RESERVED holder
    pub fn reserved_holder(&self) -> Option<ConnectionId> {
        self.reserved
    }

    /// PENDING holder
    pub fn pending_holder(&self) -> Option<ConnectionId> {
        self.pending
    }

    /// EXCLUSIVE holder
    pub fn exclusive_holder(&self) -> Option<ConnectionId> {
        self.exclusive
    }

    fn other_reader(&self, conn: ConnectionId) -> Option<ConnectionId> {
        self.shared.iter().copied().find(|c| *c != conn)
    }

    /// Join the readers
    ///
    /// Refused while another connection holds PENDING or EXCLUSIVE. Existing
    /// readers are never affected by a PENDING lock; only new ones are.
    pub fn acquire_shared(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        let current = self.level_of(conn);
        if current >= LockLevel::Shared {
            return Ok(current);
        }

        if let Some(holder) = self.exclusive.or(self.pending) {
            return Err(LockError::Busy {
                conn,
                requested: LockLevel::Shared,
                holder: Some(holder),
                retriable: true,
                deadlock: false,
            });
        }

        self.shared.insert(conn);
        Ok(LockLevel::Shared)
    }

    /// Announce the intent to write
    ///
    /// Allowed from UNLOCKED or SHARED. Only one connection may hold it. A
    /// reader that loses the race is refused without retry: it holds SHARED,
    /// which the winner must see released before reaching EXCLUSIVE, so
    /// waiting would deadlock.
    pub fn acquire_reserved(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        let current = self.level_of(conn);
        if current >= LockLevel::Reserved {
            return Ok(current);
        }

        if let Some(holder) = self.exclusive.or(self.pending).or(self.reserved) {
            let reading = current == LockLevel::Shared;
            return Err(LockError::Busy {
                conn,
                requested: LockLevel::Reserved,
                holder: Some(holder),
                retriable: !reading,
                deadlock: reading,
            });
        }

        self.shared.insert(conn);
        self.reserved = Some(conn);
        Ok(LockLevel::Reserved)
    }

    /// Stop admitting new readers
    ///
    /// Only the RESERVED holder may ask, and existing readers cannot block it.
    pub fn acquire_pending(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        let current = self.level_of(conn);
        if current >= LockLevel::Pending {
            return Ok(current);
        }
        if current != LockLevel::Reserved {
            return Err(LockError::InvalidTransition {
                conn,
                from: current,
                to: LockLevel::Pending,
            });
        }

        if let Some(holder) = self.exclusive.or(self.pending) {
            return Err(LockError::Busy {
                conn,
                requested: LockLevel::Pending,
                holder: Some(holder),
                retriable: false,
                deadlock: false,
            });
        }

        self.pending = Some(conn);
        Ok(LockLevel::Pending)
    }

    /// Take the write lock
    ///
    /// Only the PENDING holder may ask. Refused, without any retry, while
    /// another reader remains.
    pub fn acquire_exclusive(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        let current = self.level_of(conn);
        if current == LockLevel::Exclusive {
            return Ok(current);
        }
        if current != LockLevel::Pending {
            return Err(LockError::InvalidTransition {
                conn,
                from: current,
                to: LockLevel::Exclusive,
            });
        }

        if let Some(reader) = self.other_reader(conn) {
            return Err(LockError::Busy {
                conn,
                requested: LockLevel::Exclusive,
                holder: Some(reader),
                retriable: false,
                deadlock: false,
            });
        }

        self.exclusive = Some(conn);
        Ok(LockLevel::Exclusive)
    }

    /// Lower a connection's lock to `level`
    ///
    /// A no-op when the connection is already at or below `level`. Returns
    /// the connection's resulting level.
    pub fn downgrade(&mut self, conn: ConnectionId, level: LockLevel) -> LockLevel {
        if self.level_of(conn) <= level {
            return self.level_of(conn);
        }

        if level < LockLevel::Exclusive && self.exclusive == Some(conn) {
            self.exclusive = None;
        }
        if level < LockLevel::Pending && self.pending == Some(conn) {
            self.pending = None;
        }
        if level < LockLevel::Reserved && self.reserved == Some(conn) {
            self.reserved = None;
        }
        if level < LockLevel::Shared {
            self.shared.remove(&conn);
        }

        self.level_of(conn)
    }

    /// Drop every lock the connection holds. Idempotent.
    pub fn release(&mut self, conn: ConnectionId) -> LockLevel {
        self.downgrade(conn, LockLevel::Unlocked)
    }

    /// Check the coexistence rules
    ///
    /// Returns a description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        for (role, holder) in [
            ("RESERVED", self.reserved),
            ("PENDING", self.pending),
            ("EXCLUSIVE", self.exclusive),
        ] {
            if let Some(h) = holder {
                if !self.shared.contains(&h) {
                    return Err(format!("{} holder {} is not a reader", role, h));
                }
            }
        }

        if let (Some(r), Some(p)) = (self.reserved, self.pending) {
            if r != p {
                return Err(format!("RESERVED held by {} while PENDING held by {}", r, p));
            }
        }
        if let Some(p) = self.pending {
            if self.reserved != Some(p) {
                return Err(format!("PENDING holder {} skipped RESERVED", p));
            }
        }

        if let Some(x) = self.exclusive {
            if self.pending != Some(x) {
                return Err(format!("EXCLUSIVE holder {} skipped PENDING", x));
            }
            if let Some(reader) = self.other_reader(x) {
                return Err(format!(
                    "EXCLUSIVE held by {} while {} still holds SHARED",
                    x, reader
                ));
            }
        }

        Ok(())
    }
}
