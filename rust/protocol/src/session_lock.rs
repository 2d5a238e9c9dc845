//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::ProtocolAddress;

/// Serializes every load-modify-store of a session record.
///
/// Each address maps to exactly one shard, so two operations on the same record can never
/// overlap. With a single shard (the default) every session shares one lock.
///
/// The lock is re-entrant: the thread holding a shard may acquire it again. A decryption
/// callback, or any code running while a [`PendingDecryption`](crate::PendingDecryption) is
/// alive, can therefore use the engine for other addresses. Other threads wait until the
/// outermost guard is dropped.
///
/// One `SessionLocks` must be shared by every [`SessionCipher`](crate::SessionCipher) that touches
/// a given session store.
#[derive(Debug)]
pub struct SessionLocks {
    shards: Box<[Shard]>,
}

#[derive(Debug, Default)]
struct Shard {
    holder: Mutex<Option<Holder>>,
    released: Condvar,
}

#[derive(Debug)]
struct Holder {
    thread: ThreadId,
    depth: usize,
}

/// Proof that the calling thread holds the shard covering an address.
///
/// Released when dropped, on the thread that acquired it.
#[must_use]
#[derive(Debug)]
pub struct SessionLockGuard<'a> {
    shard: &'a Shard,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SessionLockGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self
            .shard
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let released = match holder.as_mut() {
            Some(h) => {
                h.depth -= 1;
                h.depth == 0
            }
            None => false,
        };
        if released {
            *holder = None;
            self.shard.released.notify_one();
        }
    }
}

impl SessionLocks {
    /// A single lock shared by all addresses.
    pub fn global() -> Self {
        Self::sharded(1)
    }

    /// `shard_count` independent locks, selected by a hash of the address. A count of zero is
    /// treated as one.
    pub fn sharded(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Shard::default()).collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, address: &ProtocolAddress) -> usize {
        if self.shards.len() == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        address.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Blocks until no other thread holds the lock covering `address`.
    ///
    /// A panic while a previous holder had the guard does not leave the record half-written,
    /// since records are only stored after all fallible work is done, so poisoning is ignored.
    pub fn lock(&self, address: &ProtocolAddress) -> SessionLockGuard<'_> {
        let shard = &self.shards[self.shard_for(address)];
        let me = thread::current().id();

        let holder = shard
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut holder = shard
            .released
            .wait_while(holder, |holder| {
                holder.as_ref().is_some_and(|h| h.thread != me)
            })
            .unwrap_or_else(PoisonError::into_inner);

        match holder.as_mut() {
            Some(h) => h.depth += 1,
            None => *holder = Some(Holder { thread: me, depth: 1 }),
        }

        SessionLockGuard {
            shard,
            _not_send: PhantomData,
        }
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::global()
    }
}
