//! Non-poisoning synchronization primitives.
//!
//! [`std::sync::Mutex`] and [`std::sync::RwLock`] "poison" themselves when a
//! thread panics while holding the lock, and every later lock attempt returns
//! an error that is typically just unwrapped into another panic. This crate
//! does not use poisoning as an error-propagation channel: failures travel
//! through rejected results, and a panicking user callback is never running
//! while one of our locks is held (state is always captured under the lock
//! and callbacks invoked after the guard is released). Poison recovery is
//! therefore always the right behavior, and these wrappers perform it
//! unconditionally.
//!
//! Only the operations the crate needs are exposed; this is not a
//! general-purpose lock library.

use std::{
    ops::{Deref, DerefMut},
    sync,
    time::Duration,
};

pub use std::sync::WaitTimeoutResult;

/// A mutual-exclusion lock that recovers from poisoning instead of erroring.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self.inner.get_mut() {
            Ok(t) => t,
            Err(poison) => poison.into_inner(),
        }
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Condition variable compatible with [`Mutex`].
#[derive(Default)]
pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let guard = match self.inner.wait(guard.inner) {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let (guard, timeout) = match self.inner.wait_timeout(guard.inner, dur) {
            Ok(out) => out,
            Err(poison) => poison.into_inner(),
        };
        (MutexGuard { inner: guard }, timeout)
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

/// A readers-writer lock that recovers from poisoning instead of erroring.
#[derive(Default)]
pub struct RwLock<T: ?Sized> {
    inner: sync::RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(t: T) -> RwLock<T> {
        Self {
            inner: sync::RwLock::new(t),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        RwLockReadGuard { inner: guard }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        RwLockWriteGuard { inner: guard }
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized + 'a> {
    inner: sync::RwLockReadGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized + 'a> {
    inner: sync::RwLockWriteGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn mutex_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(0));
        let mutex2 = mutex.clone();
        thread::spawn(move || {
            let _guard = mutex2.lock();
            panic!("poison it");
        })
        .join()
        .unwrap_err();

        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn rwlock_recovers_from_poison() {
        let lock = Arc::new(RwLock::new(0));
        let lock2 = lock.clone();
        thread::spawn(move || {
            let _guard = lock2.write();
            panic!("poison it");
        })
        .join()
        .unwrap_err();

        *lock.write() += 1;
        assert_eq!(*lock.read(), 1);
    }
}
