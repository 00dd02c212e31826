use crate::error::*;

///
/// Number of multiples of each power of the base that get their own rotation key.
///
pub const GENERATOR_BASE: usize = 8;

///
/// Returns the magnitudes `r * 8^i` for `1 <= r < 8` with `r * 8^i <= slots / 2`,
/// in ascending order. Together with their negations, these are exactly the rotations
/// for which a [`crate::context::Context`] generates Galois keys.
///
pub fn generator_magnitudes(slots: usize) -> Vec<usize> {
    let half = slots / 2;
    let mut result = Vec::new();
    let mut power = 1;
    while power <= half {
        for r in 1..GENERATOR_BASE {
            if r * power <= half {
                result.push(r * power);
            }
        }
        power = match power.checked_mul(GENERATOR_BASE) {
            Some(next) => next,
            None => break
        };
    }
    return result;
}

///
/// Decomposes arbitrary slot rotations into rotations by generators, i.e. by
/// values `± r * 8^i`. This keeps the number of rotation keys at `O(log N)`
/// while every rotation costs at most a handful of key switches.
///
/// Rotations are always left rotations, i.e. rotating `x` by `k` gives `y` with
/// `y[i] = x[i + k mod N]`.
///
#[derive(Clone, Debug)]
pub struct RotationPlanner {
    slots: usize,
    magnitudes: Vec<usize>
}

impl RotationPlanner {

    pub fn new(slots: usize) -> Result<Self> {
        if slots == 0 {
            return Err(HEError::configuration("rotation planner requires a nonzero slot count"));
        }
        Ok(Self {
            slots: slots,
            magnitudes: generator_magnitudes(slots)
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    ///
    /// All rotation amounts a plan can consist of, i.e. the generator magnitudes
    /// and their negations.
    ///
    pub fn generators(&self) -> Vec<i64> {
        self.magnitudes.iter().flat_map(|m| [*m as i64, -(*m as i64)]).collect()
    }

    ///
    /// Reduces `k` modulo the slot count into the range `(-N/2, N/2]`.
    ///
    pub fn normalize(&self, k: i64) -> i64 {
        let n = self.slots as i64;
        let k = k.rem_euclid(n);
        if k > n / 2 {
            return k - n;
        } else {
            return k;
        }
    }

    ///
    /// Returns a sequence of generators whose sum is congruent to `k` modulo the
    /// slot count. A rotation by zero is planned as `[0]`, so the result is never empty.
    ///
    /// In each step, we either undershoot with the largest generator below the remaining
    /// amount or overshoot with the smallest generator above, whatever leaves less;
    /// on a tie we undershoot.
    ///
    pub fn plan(&self, k: i64) -> Vec<i64> {
        let mut remaining = self.normalize(k);
        if remaining == 0 {
            return vec![0];
        }
        let mut result = Vec::new();
        while remaining != 0 {
            let sign = remaining.signum();
            let magnitude = remaining.unsigned_abs() as usize;
            // `1` is always a generator once `N >= 2`, so there is something below
            let below_count = self.magnitudes.partition_point(|g| *g <= magnitude);
            let below = self.magnitudes[below_count - 1];
            let chosen = match self.magnitudes.get(below_count) {
                Some(above) if above - magnitude < magnitude - below => *above,
                _ => below
            };
            result.push(sign * chosen as i64);
            remaining = sign * (magnitude as i64 - chosen as i64);
        }
        return result;
    }
}

#[cfg(test)]
fn rotate_left(values: &[i64], k: i64) -> Vec<i64> {
    let n = values.len() as i64;
    (0..n).map(|i| values[(i + k).rem_euclid(n) as usize]).collect()
}

#[test]
fn test_generator_magnitudes() {
    assert_eq!(vec![1, 2, 3, 4], generator_magnitudes(8));
    assert_eq!(vec![1, 2, 3, 4, 5, 6, 7, 8], generator_magnitudes(16));
    let magnitudes = generator_magnitudes(8192);
    assert_eq!(7 * 4 + 1, magnitudes.len());
    assert_eq!(4096, *magnitudes.last().unwrap());
    assert!(magnitudes.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_zero_slots_is_configuration_error() {
    assert!(RotationPlanner::new(0).unwrap_err().is_configuration());
}

#[test]
fn test_plan_zero() {
    let planner = RotationPlanner::new(1024).unwrap();
    assert_eq!(vec![0], planner.plan(0));
    assert_eq!(vec![0], planner.plan(1024));
    assert_eq!(vec![0], planner.plan(-2048));
}

#[test]
fn test_plan_tie_and_overshoot() {
    let planner = RotationPlanner::new(8192).unwrap();
    assert_eq!(vec![8, 4], planner.plan(12));
    assert_eq!(vec![16, -1], planner.plan(15));
    assert_eq!(vec![-3], planner.plan(-3));
    assert_eq!(vec![1024, -24], planner.plan(1000));
    assert_eq!(vec![4096, -1], planner.plan(4095));
    assert_eq!(vec![-3], planner.plan(8189));
}

#[test]
fn test_normalize() {
    let planner = RotationPlanner::new(16).unwrap();
    assert_eq!(8, planner.normalize(8));
    assert_eq!(-7, planner.normalize(9));
    assert_eq!(-1, planner.normalize(-1));
    assert_eq!(8, planner.normalize(-8));
    assert_eq!(3, planner.normalize(35));
}

#[test]
fn test_plan_composes_to_rotation() {
    for log_slots in 3..=9 {
        let slots = 1 << log_slots;
        let planner = RotationPlanner::new(slots).unwrap();
        let generators = planner.generators();
        let values = (0..slots as i64).map(|i| i * i + 7).collect::<Vec<_>>();
        for k in -(slots as i64) - 3..=(slots as i64) + 3 {
            let plan = planner.plan(k);
            assert!(!plan.is_empty());
            let mut current = values.clone();
            for step in &plan {
                assert!(*step == 0 || generators.contains(step), "{} is not a generator", step);
                current = rotate_left(&current, *step);
            }
            assert_eq!(rotate_left(&values, k), current, "rotation by {} with {} slots", k, slots);
            assert!(plan.len() <= 2 * log_slots);
        }
    }
}

#[test]
fn test_plan_random_amounts() {
    let mut rng = oorandom::Rand64::new(1);
    let slots = 1 << 15;
    let planner = RotationPlanner::new(slots).unwrap();
    for _ in 0..1000 {
        let k = rng.rand_range(0..(4 * slots as u64)) as i64 - 2 * slots as i64;
        let plan = planner.plan(k);
        let total: i64 = plan.iter().sum();
        assert_eq!(k.rem_euclid(slots as i64), total.rem_euclid(slots as i64));
    }
}
