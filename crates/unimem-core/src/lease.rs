//! Storage leases.
//!
//! A lease is the release handle of one storage-owned buffer: it names the
//! accountant holding the reservation and the generation of that reservation.
//! When the reservation moves to another accountant the lease is retargeted,
//! so the eventual release lands where the bytes are charged.

use std::fmt;
use std::sync::{RwLock, Weak};

use crate::accountant::MemoryAccountant;
use crate::mode::MemoryMode;

#[derive(Clone)]
struct LeaseTarget {
    accountant: Weak<dyn MemoryAccountant>,
    generation: u64,
    epoch: u64,
}

pub struct StorageLease {
    name: String,
    mode: MemoryMode,
    target: RwLock<LeaseTarget>,
}

impl StorageLease {
    pub fn new(
        accountant: Weak<dyn MemoryAccountant>,
        name: impl Into<String>,
        mode: MemoryMode,
        generation: u64,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            target: RwLock::new(LeaseTarget {
                accountant,
                generation,
                epoch: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn generation(&self) -> u64 {
        self.target().generation
    }

    fn target(&self) -> LeaseTarget {
        self.target.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Point the lease at `generation` of `name` in another accountant.
    pub fn retarget(&self, accountant: Weak<dyn MemoryAccountant>, generation: u64) {
        let mut target = self.target.write().unwrap_or_else(|e| e.into_inner());
        target.accountant = accountant;
        target.generation = generation;
        target.epoch += 1;
    }

    /// Give `num_bytes` back to the reservation this lease points at.
    ///
    /// Returns false when the reservation is gone (dropped, cleared, or its
    /// accountant no longer exists). A release racing a retarget follows the
    /// lease to its new accountant.
    pub fn release(&self, num_bytes: u64) -> bool {
        loop {
            let target = self.target();
            let Some(accountant) = target.accountant.upgrade() else {
                return false;
            };
            if accountant.release_storage_reservation(
                &self.name,
                num_bytes,
                self.mode,
                target.generation,
            ) {
                return true;
            }
            if self.target().epoch == target.epoch {
                return false;
            }
        }
    }
}

impl fmt::Debug for StorageLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target();
        f.debug_struct("StorageLease")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("generation", &target.generation)
            .field("epoch", &target.epoch)
            .finish()
    }
}
