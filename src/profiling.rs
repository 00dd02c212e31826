
#[cfg(feature = "record_timings")]
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait TimeTracker {
    fn reset(&mut self);
    fn report(&self);
}

#[cfg(feature = "record_timings")]
pub static PRINT_TIMINGS: Mutex<Vec<Box<dyn 'static + Send + TimeTracker>>> = Mutex::new(Vec::new());

///
/// Reports the accumulated time of every [`record_time!`] location as a `tracing` event.
///
#[cfg(feature = "record_timings")]
pub fn print_all_timings() {
    let locked = PRINT_TIMINGS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    for tracker in locked.iter() {
        tracker.report();
    }
}

#[cfg(not(feature = "record_timings"))]
pub fn print_all_timings() {}

#[cfg(feature = "record_timings")]
pub fn clear_all_timings() {
    let mut locked = PRINT_TIMINGS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    locked.iter_mut().for_each(|tracker| tracker.reset());
}

#[cfg(not(feature = "record_timings"))]
pub fn clear_all_timings() {}

macro_rules! record_time {
    ($name:literal, $fn:expr) => {
        {
            #[cfg(feature = "record_timings")] {
                use std::sync::atomic::{AtomicBool, Ordering, AtomicU64};
                use std::time::Instant;
                use $crate::profiling::*;

                static COUNTER: AtomicU64 = AtomicU64::new(0);
                static CALLS: AtomicU64 = AtomicU64::new(0);
                static REGISTERED: AtomicBool = AtomicBool::new(false);

                struct LocalTimeTracker;

                impl TimeTracker for LocalTimeTracker {

                    fn reset(&mut self) {
                        COUNTER.store(0, Ordering::SeqCst);
                        CALLS.store(0, Ordering::SeqCst);
                    }

                    fn report(&self) {
                        tracing::info!(
                            timer = $name,
                            millis = COUNTER.load(Ordering::SeqCst) / 1000000,
                            calls = CALLS.load(Ordering::SeqCst),
                            "accumulated time"
                        );
                    }
                }

                if !REGISTERED.swap(true, Ordering::SeqCst) {
                    let mut locked = PRINT_TIMINGS.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    locked.push(Box::new(LocalTimeTracker) as Box<dyn 'static + Send + TimeTracker>);
                }

                #[inline(never)]
                fn prevent_inline<T, F: FnOnce() -> T>(f: F) -> T {
                    f()
                }

                let start = Instant::now();
                let result = prevent_inline($fn);
                let end = Instant::now();
                COUNTER.fetch_add((end - start).as_nanos() as u64 + 1, Ordering::SeqCst);
                CALLS.fetch_add(1, Ordering::SeqCst);
                result
            }
            #[cfg(not(feature = "record_timings"))] {
                ($fn)()
            }
        }
    };
}

///
/// Runs one step and measures its wall-clock time. The step may fill in
/// `COUNTER_VAR_COUNT` counters, which are reported together with the time if `LOG`
/// is set.
///
pub fn log_time<F, T, const LOG: bool, const COUNTER_VAR_COUNT: usize>(description: &str, step_fn: F) -> (T, Duration)
    where F: FnOnce(&mut [usize; COUNTER_VAR_COUNT]) -> T
{
    if LOG {
        tracing::info!("{}", description);
    }
    let mut counters = [0; COUNTER_VAR_COUNT];
    let start = Instant::now();
    let result = step_fn(&mut counters);
    let elapsed = start.elapsed();
    if LOG {
        tracing::info!(millis = elapsed.as_millis() as u64, counters = ?counters, "{} done", description);
    }
    return (result, elapsed);
}

#[test]
fn test_log_time_counters() {
    let (result, _) = log_time::<_, _, false, 2>("step", |[first, second]| {
        *first = 3;
        *second += 4;
        *first + *second
    });
    assert_eq!(7, result);
}

#[test]
fn test_record_time() {
    let result: Result<i32, ()> = record_time!("test_record_time", || -> Result<i32, ()> { Ok(5) });
    assert_eq!(Ok(5), result);
    clear_all_timings();
    print_all_timings();
}
