//! Per-stream property bag.
//!
//! Subsystems attach their own state to a stream through a [`PropertyKey`]
//! issued by the connection. Keys are dense indices, so a lookup is a plain
//! array access, and each key remembers the connection that issued it.

use alloc::boxed::Box;
use core::any::Any;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Error;

/// Maximum number of property keys a single connection can issue.
pub const MAX_PROPERTY_KEYS: usize = 8;

/// Identity of a connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to one slot of every stream's property bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyKey {
    index: usize,
    owner: ConnectionId,
}

impl PropertyKey {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Issues keys for one connection.
#[derive(Debug)]
pub struct PropertyKeyRegistry {
    owner: ConnectionId,
    issued: usize,
}

impl PropertyKeyRegistry {
    pub fn new(owner: ConnectionId) -> Self {
        Self { owner, issued: 0 }
    }

    pub fn new_key(&mut self) -> Result<PropertyKey, Error> {
        if self.issued >= MAX_PROPERTY_KEYS {
            return Err(Error::PropertyKeysExhausted);
        }
        let key = PropertyKey {
            index: self.issued,
            owner: self.owner,
        };
        self.issued += 1;
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.issued
    }

    pub fn is_empty(&self) -> bool {
        self.issued == 0
    }
}

/// Property storage of a single stream. Grows lazily up to the highest key
/// index that was written.
#[derive(Debug)]
pub struct PropertyMap {
    owner: ConnectionId,
    values: heapless::Vec<Option<Box<dyn Any>>, MAX_PROPERTY_KEYS>,
}

impl PropertyMap {
    pub fn new(owner: ConnectionId) -> Self {
        Self {
            owner,
            values: heapless::Vec::new(),
        }
    }

    fn verify(&self, key: &PropertyKey) -> Result<(), Error> {
        if key.owner != self.owner {
            return Err(Error::PropertyKeyMismatch);
        }
        Ok(())
    }

    /// Store `value`, returning the previous value if it had the same type.
    pub fn set<T: Any>(&mut self, key: &PropertyKey, value: T) -> Result<Option<T>, Error> {
        self.verify(key)?;
        while self.values.len() <= key.index {
            self.values
                .push(None)
                .map_err(|_| Error::PropertyKeysExhausted)?;
        }
        let prev = self.values[key.index].replace(Box::new(value));
        Ok(prev.and_then(|b| b.downcast::<T>().ok()).map(|b| *b))
    }

    pub fn get<T: Any>(&self, key: &PropertyKey) -> Result<Option<&T>, Error> {
        self.verify(key)?;
        Ok(self
            .values
            .get(key.index)
            .and_then(|slot| slot.as_ref())
            .and_then(|b| b.downcast_ref::<T>()))
    }

    pub fn get_mut<T: Any>(&mut self, key: &PropertyKey) -> Result<Option<&mut T>, Error> {
        self.verify(key)?;
        Ok(self
            .values
            .get_mut(key.index)
            .and_then(|slot| slot.as_mut())
            .and_then(|b| b.downcast_mut::<T>()))
    }

    /// Remove the value under `key`. A value of a different type is left in place.
    pub fn remove<T: Any>(&mut self, key: &PropertyKey) -> Result<Option<T>, Error> {
        self.verify(key)?;
        let Some(slot) = self.values.get_mut(key.index) else {
            return Ok(None);
        };
        if !slot.as_ref().is_some_and(|b| b.is::<T>()) {
            return Ok(None);
        }
        Ok(slot
            .take()
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b))
    }

    /// Number of allocated slots.
    pub fn capacity_used(&self) -> usize {
        self.values.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
