use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{CryptoRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::*;
use crate::pool::{EvaluatorPool, PooledEvaluator};
use crate::rotation::RotationPlanner;
use crate::scheme::*;
use crate::tensor::*;

///
/// Rotation, summation, replication and packing of encrypted tensors.
///
pub mod ops;

///
/// Settings for the evaluator pool of a [`Context`].
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    ///
    /// Number of evaluators created during construction.
    ///
    pub warm_evaluators: usize,
    ///
    /// Maximal number of evaluators that exist at the same time.
    ///
    pub max_evaluators: usize
}

impl Default for ContextOptions {

    fn default() -> Self {
        Self {
            warm_evaluators: 16,
            max_evaluators: 64
        }
    }
}

///
/// Owns the keys of one cryptographic session and the pool of evaluators
/// all homomorphic operations are performed with.
///
/// If the parameters have no special moduli, no evaluation keys are generated;
/// such a context can only encrypt and decrypt.
///
/// All randomness, including the one used later for encryption and by the evaluators,
/// is derived from the rng passed to [`Context::new_with()`].
///
pub struct Context<S: CkksScheme> {
    scheme: S,
    planner: RotationPlanner,
    secret_key: S::SecretKey,
    public_key: S::PublicKey,
    pool: Option<EvaluatorPool<S::Evaluator>>,
    rng: Mutex<StdRng>,
    rotations: AtomicUsize
}

impl<S: CkksScheme> Context<S> {

    pub fn new(scheme: S) -> Result<Self> {
        Self::new_with(scheme, ContextOptions::default(), &mut rand::thread_rng())
    }

    #[instrument(skip_all)]
    pub fn new_with<R: Rng + CryptoRng>(scheme: S, options: ContextOptions, rng: &mut R) -> Result<Self> {
        scheme.params().validate()?;
        let planner = RotationPlanner::new(scheme.params().slots())?;
        let (secret_key, public_key) = scheme.gen_key_pair(rng);

        let pool = if scheme.params().special_modulus_count() != 0 {
            let relin_key = scheme.gen_relin_key(rng, &secret_key);
            let mut galois_elements = planner.generators().into_iter()
                .map(|k| scheme.params().galois_element_for_rotation(k))
                .collect::<Vec<_>>();
            galois_elements.push(scheme.params().galois_element_for_conjugation());
            galois_elements.sort_unstable();
            galois_elements.dedup();
            tracing::debug!(galois_keys = galois_elements.len(), "generating evaluation keys");
            let galois_keys = scheme.gen_galois_keys(rng, &secret_key, &galois_elements);

            let keys = Arc::new(EvaluationKeySet { relin_key: relin_key, galois_keys: galois_keys });
            let pool = EvaluatorPool::new(scheme.new_evaluator(rng, keys), options.max_evaluators);
            pool.warm(options.warm_evaluators);
            Some(pool)
        } else {
            tracing::debug!("no special moduli, context only supports encryption and decryption");
            None
        };

        Ok(Self {
            scheme: scheme,
            planner: planner,
            secret_key: secret_key,
            public_key: public_key,
            pool: pool,
            rng: Mutex::new(StdRng::from_seed(rng.gen())),
            rotations: AtomicUsize::new(0)
        })
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn params(&self) -> &CkksParams {
        self.scheme.params()
    }

    pub fn slots(&self) -> usize {
        self.scheme.params().slots()
    }

    pub fn planner(&self) -> &RotationPlanner {
        &self.planner
    }

    pub fn pool(&self) -> Option<&EvaluatorPool<S::Evaluator>> {
        self.pool.as_ref()
    }

    ///
    /// Checks out an evaluator, blocking if all evaluators are currently in use.
    ///
    pub fn evaluator(&self) -> Result<PooledEvaluator<'_, S::Evaluator>> {
        match &self.pool {
            Some(pool) => Ok(pool.checkout()),
            None => Err(HEError::configuration("context has no evaluation keys, since the parameters have no special moduli"))
        }
    }

    ///
    /// Total number of key-switching rotations performed so far.
    ///
    pub fn rotation_count(&self) -> usize {
        self.rotations.load(Ordering::Relaxed)
    }

    pub(crate) fn record_rotations(&self, count: usize) {
        self.rotations.fetch_add(count, Ordering::Relaxed);
    }

    ///
    /// Encrypts every lane of the given tensor at the maximal level.
    ///
    #[instrument(skip_all)]
    pub fn encrypt(&self, tensor: &PlainTensor) -> Result<EncryptedTensor<S>> {
        let slots = self.slots();
        let layout = tensor.layout();
        if layout.space > slots {
            return Err(HEError::configuration(format!("space {} exceeds the slot count {}", layout.space, slots)));
        }
        layout.check(tensor.lanes(), slots)?;
        let level = self.params().max_level();
        let seeds = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            (0..tensor.lanes()).map(|_| rng.gen::<[u8; 32]>()).collect::<Vec<_>>()
        };
        let data = tensor.data().par_iter().zip(seeds.into_par_iter()).map(|(lane, seed)| -> Result<_> {
            let plaintext = self.scheme.encode(lane, level)?;
            Ok(self.scheme.encrypt(&mut StdRng::from_seed(seed), &self.public_key, &plaintext)?)
        }).collect::<Result<Vec<_>>>()?;
        return Ok(EncryptedTensor::from_parts(data, layout.clone()));
    }

    ///
    /// Decrypts every lane, keeping the real part of each slot.
    ///
    #[instrument(skip_all)]
    pub fn decrypt(&self, tensor: &EncryptedTensor<S>) -> Result<PlainTensor> {
        let data = tensor.data().par_iter().map(|ct| -> Result<_> {
            let plaintext = self.scheme.decrypt(&self.secret_key, ct)?;
            Ok(self.scheme.decode(&plaintext)?.into_iter().map(|x| x.re).collect::<Vec<_>>())
        }).collect::<Result<Vec<_>>>()?;
        return PlainTensor::with_layout(data, tensor.layout().clone());
    }
}

#[cfg(test)]
use crate::scheme::simulated::SimulatedCkks;

///
/// Context with 1024 slots supporting `depth` rescalings.
///
#[cfg(test)]
pub(crate) fn test_context(depth: usize) -> Context<SimulatedCkks> {
    let params = CkksParams::leveled(10, depth, 35, vec![61]);
    let options = ContextOptions { warm_evaluators: 4, max_evaluators: 16 };
    Context::new_with(SimulatedCkks::new(params).unwrap(), options, &mut StdRng::from_seed([1; 32])).unwrap()
}

#[cfg(test)]
pub(crate) fn assert_close(expected: &[f64], actual: &[f64], tolerance: f64) {
    assert_eq!(expected.len(), actual.len());
    for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        assert!((e - a).abs() <= tolerance, "at {}: expected {}, got {} (tolerance {})", i, e, a, tolerance);
    }
}

#[test]
fn test_encrypt_decrypt() {
    let ctx = test_context(2);
    let tensor = PlainTensor::new(vec![vec![1., 2., 3.], vec![-4., 0.5, 6.]]).unwrap();
    let encrypted = ctx.encrypt(&tensor).unwrap();
    assert_eq!(2, encrypted.lanes());
    assert_eq!(tensor.layout(), encrypted.layout());
    let decrypted = ctx.decrypt(&encrypted).unwrap();
    assert_eq!(1024, decrypted.data()[0].len());
    assert_close(&[1., 2., 3.], &decrypted.channel(0), 1e-6);
    assert_close(&[-4., 0.5, 6.], &decrypted.channel(1), 1e-6);
    assert_close(&[0.; 1021], &decrypted.data()[1][3..], 1e-6);
}

#[test]
fn test_encrypt_too_large() {
    let ctx = test_context(2);
    let tensor = PlainTensor::new(vec![vec![1.; 1025]]).unwrap();
    assert!(ctx.encrypt(&tensor).unwrap_err().is_configuration());
}

#[test]
fn test_context_generates_generator_keys() {
    let ctx = test_context(2);
    let pool = ctx.pool().unwrap();
    assert_eq!(4, pool.created());
    assert_eq!(16, pool.capacity());
    let _evaluator = ctx.evaluator().unwrap();
    assert_eq!(3, pool.idle());
}

#[test]
fn test_context_without_special_moduli() {
    let params = CkksParams::leveled(10, 2, 35, Vec::new());
    let ctx = Context::new_with(SimulatedCkks::new(params).unwrap(), ContextOptions::default(), &mut StdRng::from_seed([1; 32])).unwrap();
    assert!(ctx.pool().is_none());
    assert!(ctx.evaluator().is_err());
    let tensor = PlainTensor::new(vec![vec![1., 2.]]).unwrap();
    let decrypted = ctx.decrypt(&ctx.encrypt(&tensor).unwrap()).unwrap();
    assert_close(&[1., 2.], &decrypted.channel(0), 1e-6);
    assert!(ctx.rotate(&ctx.encrypt(&tensor).unwrap().data()[0], 1).unwrap_err().is_configuration());
}

#[test]
fn test_options_from_json() {
    let options: ContextOptions = serde_json::from_str(r#"{ "max_evaluators": 8 }"#).unwrap();
    assert_eq!(ContextOptions { warm_evaluators: 16, max_evaluators: 8 }, options);
}

#[test]
fn test_seeded_contexts_agree() {
    let tensor = PlainTensor::new(vec![vec![0.5, -2., 7.], vec![1., 1.]]).unwrap();
    let run = || {
        let ctx = test_context(1);
        let encrypted = ctx.encrypt(&tensor).unwrap();
        let rotated = {
            let mut evaluator = ctx.evaluator().unwrap();
            evaluator.rotate(&encrypted.data()[0], 1).unwrap()
        };
        let decrypted = ctx.decrypt(&encrypted).unwrap();
        let rotated = ctx.decrypt(&EncryptedTensor::from_parts(vec![rotated.clone(), rotated], encrypted.layout().clone())).unwrap();
        (decrypted, rotated)
    };
    let (decrypted, rotated) = run();
    let (same_decrypted, same_rotated) = run();
    assert_eq!(decrypted.data(), same_decrypted.data());
    assert_eq!(rotated.data(), same_rotated.data());
    assert!(decrypted.data()[0][0] != 0.5);
}
