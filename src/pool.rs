use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::scheme::HomEvaluator;

struct PoolState<E> {
    idle: Vec<E>,
    created: usize
}

///
/// A bounded set of evaluators that share the same key material.
///
/// Evaluators are stateful and not reentrant, so every homomorphic operation
/// checks out one evaluator for its whole duration. New evaluators are created
/// lazily as shallow copies of the prototype, until `capacity` evaluators exist;
/// after that, [`EvaluatorPool::checkout()`] blocks until another task returns
/// one.
///
/// A checked-out evaluator must not be held while waiting for other tasks that
/// might themselves need an evaluator (e.g. across a rayon join), since this can
/// exhaust the pool.
///
pub struct EvaluatorPool<E: HomEvaluator> {
    prototype: Mutex<E>,
    capacity: usize,
    state: Mutex<PoolState<E>>,
    returned: Condvar
}

///
/// An evaluator checked out from an [`EvaluatorPool`], which is returned to the
/// pool when this guard is dropped.
///
pub struct PooledEvaluator<'a, E: HomEvaluator> {
    pool: &'a EvaluatorPool<E>,
    evaluator: Option<E>
}

impl<E: HomEvaluator> EvaluatorPool<E> {

    ///
    /// Creates a new pool, which contains at most `capacity` evaluators (at least
    /// one, the prototype itself is never handed out).
    ///
    pub fn new(prototype: E, capacity: usize) -> Self {
        Self {
            prototype: Mutex::new(prototype),
            capacity: capacity.max(1),
            state: Mutex::new(PoolState { idle: Vec::new(), created: 0 }),
            returned: Condvar::new()
        }
    }

    fn new_copy(&self) -> E {
        self.prototype.lock().unwrap_or_else(PoisonError::into_inner).shallow_copy()
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<E>> {
        // a panicking task can only poison the lock while pushing or popping
        // evaluators, which leaves the state consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    ///
    /// Makes sure that at least `count` evaluators (bounded by the capacity) exist,
    /// so later checkouts do not pay for their creation.
    ///
    pub fn warm(&self, count: usize) {
        let mut state = self.lock_state();
        while state.created < count.min(self.capacity) {
            let evaluator = self.new_copy();
            state.idle.push(evaluator);
            state.created += 1;
        }
    }

    pub fn checkout(&self) -> PooledEvaluator<'_, E> {
        let mut state = self.lock_state();
        loop {
            if let Some(evaluator) = state.idle.pop() {
                return PooledEvaluator { pool: self, evaluator: Some(evaluator) };
            }
            if state.created < self.capacity {
                state.created += 1;
                drop(state);
                return PooledEvaluator { pool: self, evaluator: Some(self.new_copy()) };
            }
            state = self.returned.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn checkin(&self, evaluator: E) {
        self.lock_state().idle.push(evaluator);
        self.returned.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    ///
    /// Number of evaluators that have been created so far.
    ///
    pub fn created(&self) -> usize {
        self.lock_state().created
    }

    ///
    /// Number of evaluators that are currently not checked out.
    ///
    pub fn idle(&self) -> usize {
        self.lock_state().idle.len()
    }
}

impl<'a, E: HomEvaluator> Deref for PooledEvaluator<'a, E> {

    type Target = E;

    fn deref(&self) -> &E {
        // only `None` during `drop()`
        self.evaluator.as_ref().unwrap()
    }
}

impl<'a, E: HomEvaluator> DerefMut for PooledEvaluator<'a, E> {

    fn deref_mut(&mut self) -> &mut E {
        self.evaluator.as_mut().unwrap()
    }
}

impl<'a, E: HomEvaluator> Drop for PooledEvaluator<'a, E> {

    fn drop(&mut self) {
        if let Some(evaluator) = self.evaluator.take() {
            self.pool.checkin(evaluator);
        }
    }
}

#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(test)]
use std::time::Duration;
#[cfg(test)]
use crate::scheme::PrimitiveError;

///
/// Evaluator that panics when one copy is used by two threads at once.
///
#[cfg(test)]
struct CountingEvaluator {
    id: usize,
    copies: Arc<AtomicUsize>,
    in_use: Arc<AtomicBool>
}

#[cfg(test)]
impl HomEvaluator for CountingEvaluator {

    type Ciphertext = i64;

    fn shallow_copy(&mut self) -> Self {
        CountingEvaluator {
            id: self.copies.fetch_add(1, Ordering::SeqCst) + 1,
            copies: self.copies.clone(),
            in_use: Arc::new(AtomicBool::new(false))
        }
    }

    fn zero(&self, _level: usize) -> i64 { 0 }

    fn add(&mut self, lhs: &i64, rhs: &i64) -> Result<i64, PrimitiveError> {
        assert!(!self.in_use.swap(true, Ordering::SeqCst), "evaluator {} used concurrently", self.id);
        std::thread::sleep(Duration::from_millis(1));
        self.in_use.store(false, Ordering::SeqCst);
        Ok(lhs + rhs)
    }

    fn add_assign(&mut self, lhs: &mut i64, rhs: &i64) -> Result<(), PrimitiveError> {
        *lhs = self.add(lhs, rhs)?;
        Ok(())
    }

    fn add_plain(&mut self, ct: &i64, _values: &[f64]) -> Result<i64, PrimitiveError> { Ok(*ct) }
    fn mul_relin(&mut self, lhs: &i64, rhs: &i64) -> Result<i64, PrimitiveError> { Ok(lhs * rhs) }
    fn mul_plain(&mut self, ct: &i64, _values: &[f64]) -> Result<i64, PrimitiveError> { Ok(*ct) }
    fn rescale(&mut self, _ct: &mut i64) -> Result<(), PrimitiveError> { Ok(()) }
    fn rotate(&mut self, ct: &i64, _k: i64) -> Result<i64, PrimitiveError> { Ok(*ct) }
    fn rotate_assign(&mut self, _ct: &mut i64, _k: i64) -> Result<(), PrimitiveError> { Ok(()) }
    fn conjugate(&mut self, ct: &i64) -> Result<i64, PrimitiveError> { Ok(*ct) }
}

#[cfg(test)]
fn counting_pool(capacity: usize) -> EvaluatorPool<CountingEvaluator> {
    EvaluatorPool::new(CountingEvaluator { id: 0, copies: Arc::new(AtomicUsize::new(0)), in_use: Arc::new(AtomicBool::new(false)) }, capacity)
}

#[test]
fn test_checkout_reuses_returned_evaluator() {
    let pool = counting_pool(4);
    {
        let first = pool.checkout();
        assert_eq!(1, first.id);
        assert_eq!(1, pool.created());
        assert_eq!(0, pool.idle());
    }
    assert_eq!(1, pool.idle());
    let again = pool.checkout();
    assert_eq!(1, again.id);
    assert_eq!(1, pool.created());
}

#[test]
fn test_warm() {
    let pool = counting_pool(4);
    pool.warm(16);
    assert_eq!(4, pool.created());
    assert_eq!(4, pool.idle());
    pool.warm(2);
    assert_eq!(4, pool.created());
}

#[test]
fn test_checkout_blocks_at_capacity() {
    let pool = counting_pool(1);
    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let guard = pool.checkout();
        let waiter = scope.spawn(|| {
            let mut evaluator = pool.checkout();
            done.store(true, Ordering::SeqCst);
            evaluator.add(&1, &2).unwrap()
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        drop(guard);
        assert_eq!(3, waiter.join().unwrap());
    });
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(1, pool.created());
}

#[test]
fn test_returned_on_error_path() {
    fn failing(pool: &EvaluatorPool<CountingEvaluator>) -> Result<i64, PrimitiveError> {
        let mut evaluator = pool.checkout();
        evaluator.add(&1, &1)?;
        return Err(PrimitiveError::LevelExhausted { operation: "rescale" });
    }
    let pool = counting_pool(2);
    assert!(failing(&pool).is_err());
    assert_eq!(1, pool.idle());
}

#[test]
fn test_no_concurrent_use() {
    use rayon::prelude::*;
    let pool = counting_pool(3);
    let sum: i64 = (0..64).into_par_iter().map(|i| {
        let mut evaluator = pool.checkout();
        evaluator.add(&i, &1).unwrap()
    }).sum();
    assert_eq!((1..=64).sum::<i64>(), sum);
    assert!(pool.created() <= 3);
    assert_eq!(pool.created(), pool.idle());
}
