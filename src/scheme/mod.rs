use std::fmt;
use std::sync::Arc;

use num_complex::Complex64;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

///
/// Contains [`simulated::SimulatedCkks`], a reference implementation of [`CkksScheme`]
/// that works directly on slot values.
///
pub mod simulated;

///
/// Generator of the Galois group part that acts on the slots by rotation.
///
pub const GALOIS_GENERATOR: u64 = 5;

///
/// Parameters of a leveled CKKS instance, in the usual "bit length" description.
///
/// `log_q` gives the bit lengths of the ciphertext moduli, where `log_q[0]` is the
/// base modulus and each further entry is consumed by one rescaling. `log_p` gives
/// the bit lengths of the special moduli used during key switching; if it is empty, the
/// parameters only support encoding, encryption and decryption.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkksParams {
    pub log_n: usize,
    pub log_q: Vec<usize>,
    pub log_p: Vec<usize>,
    pub log_default_scale: usize
}

impl CkksParams {

    ///
    /// Creates parameters supporting `depth` rescalings, with a base modulus
    /// that leaves 10 bits of room above the scale.
    ///
    pub fn leveled(log_slots: usize, depth: usize, log_scale: usize, log_p: Vec<usize>) -> Self {
        let mut log_q = Vec::with_capacity(depth + 1);
        log_q.push(log_scale + 10);
        log_q.extend(std::iter::repeat(log_scale).take(depth));
        Self {
            log_n: log_slots + 1,
            log_q: log_q,
            log_p: log_p,
            log_default_scale: log_scale
        }
    }

    pub fn ring_degree(&self) -> usize {
        1 << self.log_n
    }

    pub fn slots(&self) -> usize {
        self.ring_degree() / 2
    }

    pub fn max_level(&self) -> usize {
        self.log_q.len().saturating_sub(1)
    }

    pub fn special_modulus_count(&self) -> usize {
        self.log_p.len()
    }

    pub fn validate(&self) -> Result<(), PrimitiveError> {
        if self.log_n < 2 || self.log_n > 20 {
            return Err(PrimitiveError::InvalidParameters(format!("log_n = {} is out of the supported range [2, 20]", self.log_n)));
        }
        if self.log_q.is_empty() {
            return Err(PrimitiveError::InvalidParameters("at least one ciphertext modulus is required".to_owned()));
        }
        if self.log_q[0] <= self.log_default_scale {
            return Err(PrimitiveError::InvalidParameters(format!("base modulus of {} bits does not exceed the scale of {} bits", self.log_q[0], self.log_default_scale)));
        }
        return Ok(());
    }

    ///
    /// The Galois element `5^k mod 2N` that rotates slots left by `k`.
    ///
    pub fn galois_element_for_rotation(&self, k: i64) -> u64 {
        let modulus = 2 * self.ring_degree() as u64;
        let mut exponent = k.rem_euclid(self.slots() as i64) as u64;
        let mut base = GALOIS_GENERATOR % modulus;
        let mut result = 1 % modulus;
        while exponent > 0 {
            if exponent & 1 == 1 {
                result = result * base % modulus;
            }
            base = base * base % modulus;
            exponent >>= 1;
        }
        return result;
    }

    pub fn galois_element_for_conjugation(&self) -> u64 {
        2 * self.ring_degree() as u64 - 1
    }
}

///
/// Failure reported by the scheme primitives.
///
#[derive(Clone, Debug, PartialEq)]
pub enum PrimitiveError {
    InvalidParameters(String),
    LevelExhausted { operation: &'static str },
    LevelOutOfRange { level: usize, max_level: usize },
    MissingGaloisKey { galois_element: u64 },
    ScaleMismatch { lhs: u32, rhs: u32 },
    SlotCountMismatch { expected: usize, actual: usize },
    KeyMismatch
}

impl fmt::Display for PrimitiveError {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveError::InvalidParameters(message) => write!(f, "invalid parameters: {}", message),
            PrimitiveError::LevelExhausted { operation } => write!(f, "{} requires a level, but the ciphertext is at level 0", operation),
            PrimitiveError::LevelOutOfRange { level, max_level } => write!(f, "level {} exceeds the maximal level {}", level, max_level),
            PrimitiveError::MissingGaloisKey { galois_element } => write!(f, "no key switching key for Galois element {}", galois_element),
            PrimitiveError::ScaleMismatch { lhs, rhs } => write!(f, "operands have scale Delta^{} and Delta^{}", lhs, rhs),
            PrimitiveError::SlotCountMismatch { expected, actual } => write!(f, "expected at most {} slot values, got {}", expected, actual),
            PrimitiveError::KeyMismatch => write!(f, "operand was encrypted under a different key")
        }
    }
}

impl std::error::Error for PrimitiveError {}

pub trait LeveledCiphertext {

    ///
    /// Number of rescalings this ciphertext still supports.
    ///
    fn level(&self) -> usize;
}

///
/// Key material an evaluator needs, i.e. the relinearization key and
/// the Galois keys.
///
pub struct EvaluationKeySet<S: ?Sized + CkksScheme> {
    pub relin_key: S::RelinKey,
    pub galois_keys: S::GaloisKeys
}

///
/// The leveled approximate homomorphic encryption scheme we build on.
///
/// Everything that touches the secret key lives here, homomorphic arithmetic
/// is performed by a [`HomEvaluator`] created via [`CkksScheme::new_evaluator()`].
///
pub trait CkksScheme: Send + Sync {

    type SecretKey: Send + Sync;
    type PublicKey: Send + Sync;
    type RelinKey: Send + Sync;
    type GaloisKeys: Send + Sync;
    type Plaintext: Send;
    type Ciphertext: LeveledCiphertext + Clone + Send + Sync;
    type Evaluator: HomEvaluator<Ciphertext = Self::Ciphertext>;

    fn params(&self) -> &CkksParams;

    fn gen_key_pair<R: Rng + CryptoRng>(&self, rng: &mut R) -> (Self::SecretKey, Self::PublicKey);

    fn gen_relin_key<R: Rng + CryptoRng>(&self, rng: &mut R, sk: &Self::SecretKey) -> Self::RelinKey;

    fn gen_galois_keys<R: Rng + CryptoRng>(&self, rng: &mut R, sk: &Self::SecretKey, galois_elements: &[u64]) -> Self::GaloisKeys;

    ///
    /// Encodes up to `slots` values at the default scale and the given level.
    ///
    fn encode(&self, values: &[f64], level: usize) -> Result<Self::Plaintext, PrimitiveError>;

    fn decode(&self, plaintext: &Self::Plaintext) -> Result<Vec<Complex64>, PrimitiveError>;

    fn encrypt<R: Rng + CryptoRng>(&self, rng: &mut R, pk: &Self::PublicKey, plaintext: &Self::Plaintext) -> Result<Self::Ciphertext, PrimitiveError>;

    fn decrypt(&self, sk: &Self::SecretKey, ciphertext: &Self::Ciphertext) -> Result<Self::Plaintext, PrimitiveError>;

    ///
    /// Creates an evaluator using the given key material. Randomness the evaluator
    /// needs later on (and that of its shallow copies) is derived from `rng`.
    ///
    fn new_evaluator<R: Rng + CryptoRng>(&self, rng: &mut R, keys: Arc<EvaluationKeySet<Self>>) -> Self::Evaluator;
}

///
/// Performs homomorphic arithmetic on ciphertexts.
///
/// An evaluator carries internal state (e.g. scratch buffers), hence all operations
/// take `&mut self` and one evaluator can only be used by one thread at a time.
/// Use [`HomEvaluator::shallow_copy()`] to get another evaluator sharing the same
/// key material.
///
pub trait HomEvaluator: Send {

    type Ciphertext;

    ///
    /// Creates an evaluator with the same key material, whose internal randomness
    /// is seeded from this one.
    ///
    fn shallow_copy(&mut self) -> Self
        where Self: Sized;

    ///
    /// A transparent encryption of zero at the default scale.
    ///
    fn zero(&self, level: usize) -> Self::Ciphertext;

    fn add(&mut self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, PrimitiveError>;

    fn add_assign(&mut self, lhs: &mut Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<(), PrimitiveError>;

    ///
    /// Adds a plaintext vector, which is encoded at the scale of the ciphertext.
    ///
    fn add_plain(&mut self, ct: &Self::Ciphertext, values: &[f64]) -> Result<Self::Ciphertext, PrimitiveError>;

    fn mul_relin(&mut self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, PrimitiveError>;

    ///
    /// Multiplies by a plaintext vector encoded at the default scale. The result
    /// has to be rescaled afterwards.
    ///
    fn mul_plain(&mut self, ct: &Self::Ciphertext, values: &[f64]) -> Result<Self::Ciphertext, PrimitiveError>;

    fn rescale(&mut self, ct: &mut Self::Ciphertext) -> Result<(), PrimitiveError>;

    fn rotate(&mut self, ct: &Self::Ciphertext, k: i64) -> Result<Self::Ciphertext, PrimitiveError>;

    fn rotate_assign(&mut self, ct: &mut Self::Ciphertext, k: i64) -> Result<(), PrimitiveError>;

    fn conjugate(&mut self, ct: &Self::Ciphertext) -> Result<Self::Ciphertext, PrimitiveError>;
}

#[test]
fn test_leveled_params() {
    let params = CkksParams::leveled(13, 11, 35, vec![61, 61]);
    assert_eq!(8192, params.slots());
    assert_eq!(16384, params.ring_degree());
    assert_eq!(11, params.max_level());
    assert_eq!(2, params.special_modulus_count());
    assert_eq!(45, params.log_q[0]);
    assert!(params.validate().is_ok());

    let serialized = serde_json::to_string(&params).unwrap();
    let deserialized: CkksParams = serde_json::from_str(&serialized).unwrap();
    assert_eq!(params, deserialized);
}

#[test]
fn test_galois_elements() {
    let params = CkksParams::leveled(3, 1, 20, vec![30]);
    assert_eq!(1, params.galois_element_for_rotation(0));
    assert_eq!(5, params.galois_element_for_rotation(1));
    assert_eq!(25, params.galois_element_for_rotation(2));
    assert_eq!(params.galois_element_for_rotation(-1), params.galois_element_for_rotation(7));
    assert_eq!(1, params.galois_element_for_rotation(8));
    assert_eq!(31, params.galois_element_for_conjugation());
    let elements = (0..8).map(|k| params.galois_element_for_rotation(k)).collect::<std::collections::BTreeSet<_>>();
    assert_eq!(8, elements.len());
}

#[test]
fn test_invalid_params() {
    let mut params = CkksParams::leveled(3, 1, 20, vec![30]);
    params.log_q.clear();
    assert!(params.validate().is_err());
    let params = CkksParams { log_n: 4, log_q: vec![20, 30], log_p: vec![], log_default_scale: 30 };
    assert!(params.validate().is_err());
}
