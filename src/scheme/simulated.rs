use std::collections::BTreeSet;
use std::sync::Arc;

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{CryptoRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::*;

///
/// Standard deviation of the error distribution, as in the homomorphic encryption standard.
///
const ERROR_STD: f64 = 3.2;

///
/// A reference implementation of [`CkksScheme`] that works directly on slot values.
///
/// Ciphertexts store the encrypted slot values together with the modulus level,
/// the power of the scale `Delta` they are currently scaled by, and the key they
/// were encrypted under. All arithmetic checks the same preconditions a lattice
/// implementation would enforce, and adds noise of the same order of magnitude as
/// encryption, key switching and rescaling do for RLWE ciphertexts. In particular,
/// running out of levels fails exactly where it would fail for a real instantiation.
///
pub struct SimulatedCkks {
    params: CkksParams
}

#[derive(Debug)]
pub struct SimSecretKey {
    key_id: u64
}

#[derive(Debug)]
pub struct SimPublicKey {
    key_id: u64
}

#[derive(Debug)]
pub struct SimRelinKey {
    key_id: u64
}

#[derive(Debug)]
pub struct SimGaloisKeys {
    key_id: u64,
    galois_elements: BTreeSet<u64>
}

impl SimGaloisKeys {

    pub fn contains(&self, galois_element: u64) -> bool {
        self.galois_elements.contains(&galois_element)
    }

    pub fn len(&self) -> usize {
        self.galois_elements.len()
    }
}

#[derive(Clone, Debug)]
pub struct SimPlaintext {
    values: Vec<Complex64>,
    level: usize,
    scale_degree: u32
}

#[derive(Clone, Debug)]
pub struct SimCiphertext {
    key_id: Option<u64>,
    values: Vec<Complex64>,
    level: usize,
    scale_degree: u32
}

impl SimCiphertext {

    ///
    /// The exponent `d` such that this ciphertext is scaled by `Delta^d`.
    ///
    pub fn scale_degree(&self) -> u32 {
        self.scale_degree
    }
}

impl LeveledCiphertext for SimCiphertext {

    fn level(&self) -> usize {
        self.level
    }
}

impl SimulatedCkks {

    pub fn new(params: CkksParams) -> Result<Self, PrimitiveError> {
        params.validate()?;
        Ok(Self { params: params })
    }

    fn fresh_noise_std(&self) -> f64 {
        ERROR_STD * (self.params.ring_degree() as f64).sqrt() / (self.params.log_default_scale as f64).exp2()
    }

    fn pad_values(&self, values: &[f64]) -> Result<Vec<Complex64>, PrimitiveError> {
        let slots = self.params.slots();
        if values.len() > slots {
            return Err(PrimitiveError::SlotCountMismatch { expected: slots, actual: values.len() });
        }
        let mut result = values.iter().map(|x| Complex64::new(*x, 0.)).collect::<Vec<_>>();
        result.resize(slots, Complex64::new(0., 0.));
        return Ok(result);
    }
}

impl CkksScheme for SimulatedCkks {

    type SecretKey = SimSecretKey;
    type PublicKey = SimPublicKey;
    type RelinKey = SimRelinKey;
    type GaloisKeys = SimGaloisKeys;
    type Plaintext = SimPlaintext;
    type Ciphertext = SimCiphertext;
    type Evaluator = SimEvaluator;

    fn params(&self) -> &CkksParams {
        &self.params
    }

    fn gen_key_pair<R: Rng + CryptoRng>(&self, rng: &mut R) -> (SimSecretKey, SimPublicKey) {
        let key_id = rng.next_u64();
        return (SimSecretKey { key_id: key_id }, SimPublicKey { key_id: key_id });
    }

    fn gen_relin_key<R: Rng + CryptoRng>(&self, _rng: &mut R, sk: &SimSecretKey) -> SimRelinKey {
        SimRelinKey { key_id: sk.key_id }
    }

    fn gen_galois_keys<R: Rng + CryptoRng>(&self, _rng: &mut R, sk: &SimSecretKey, galois_elements: &[u64]) -> SimGaloisKeys {
        SimGaloisKeys {
            key_id: sk.key_id,
            galois_elements: galois_elements.iter().copied().collect()
        }
    }

    fn encode(&self, values: &[f64], level: usize) -> Result<SimPlaintext, PrimitiveError> {
        if level > self.params.max_level() {
            return Err(PrimitiveError::LevelOutOfRange { level: level, max_level: self.params.max_level() });
        }
        Ok(SimPlaintext {
            values: self.pad_values(values)?,
            level: level,
            scale_degree: 1
        })
    }

    fn decode(&self, plaintext: &SimPlaintext) -> Result<Vec<Complex64>, PrimitiveError> {
        Ok(plaintext.values.clone())
    }

    fn encrypt<R: Rng + CryptoRng>(&self, rng: &mut R, pk: &SimPublicKey, plaintext: &SimPlaintext) -> Result<SimCiphertext, PrimitiveError> {
        let noise_std = self.fresh_noise_std();
        let values = plaintext.values.iter().map(|x| *x + noise_std * rng.sample::<f64, _>(StandardNormal)).collect();
        Ok(SimCiphertext {
            key_id: Some(pk.key_id),
            values: values,
            level: plaintext.level,
            scale_degree: plaintext.scale_degree
        })
    }

    fn decrypt(&self, sk: &SimSecretKey, ciphertext: &SimCiphertext) -> Result<SimPlaintext, PrimitiveError> {
        if ciphertext.key_id.is_some_and(|id| id != sk.key_id) {
            return Err(PrimitiveError::KeyMismatch);
        }
        Ok(SimPlaintext {
            values: ciphertext.values.clone(),
            level: ciphertext.level,
            scale_degree: ciphertext.scale_degree
        })
    }

    fn new_evaluator<R: Rng + CryptoRng>(&self, rng: &mut R, keys: Arc<EvaluationKeySet<Self>>) -> SimEvaluator {
        SimEvaluator {
            params: Arc::new(self.params.clone()),
            keys: keys,
            rng: StdRng::from_seed(rng.gen()),
            scratch: Vec::new()
        }
    }
}

///
/// Plaintext operand of `values.len() <= slots` values, padded with zeros.
///
fn plain_operand<'a>(slots: usize, values: &'a [f64]) -> Result<impl 'a + Iterator<Item = f64>, PrimitiveError> {
    if values.len() > slots {
        return Err(PrimitiveError::SlotCountMismatch { expected: slots, actual: values.len() });
    }
    return Ok(values.iter().copied().chain(std::iter::repeat(0.)).take(slots));
}

///
/// Evaluator for [`SimulatedCkks`]. It owns a noise source and a scratch buffer
/// for permuting slots, hence is not shareable between threads.
///
pub struct SimEvaluator {
    params: Arc<CkksParams>,
    keys: Arc<EvaluationKeySet<SimulatedCkks>>,
    rng: StdRng,
    scratch: Vec<Complex64>
}

impl SimEvaluator {

    fn key_id(&self) -> u64 {
        self.keys.relin_key.key_id
    }

    fn check_key(&self, ct: &SimCiphertext) -> Result<(), PrimitiveError> {
        if ct.key_id.is_some_and(|id| id != self.key_id()) {
            return Err(PrimitiveError::KeyMismatch);
        }
        return Ok(());
    }

    fn combined_key(&self, lhs: &SimCiphertext, rhs: &SimCiphertext) -> Result<Option<u64>, PrimitiveError> {
        self.check_key(lhs)?;
        self.check_key(rhs)?;
        return Ok(lhs.key_id.or(rhs.key_id));
    }

    fn add_noise(&mut self, ct: &mut SimCiphertext, std: f64) {
        for x in &mut ct.values {
            *x += std * self.rng.sample::<f64, _>(StandardNormal);
        }
    }

    fn key_switch_noise_std(&self) -> f64 {
        ERROR_STD * (self.params.ring_degree() as f64).sqrt() / (self.params.log_default_scale as f64).exp2()
    }

    fn rounding_noise_std(&self) -> f64 {
        (self.params.ring_degree() as f64 / 12.).sqrt() / (self.params.log_default_scale as f64).exp2()
    }

    fn apply_galois(&mut self, ct: &mut SimCiphertext, galois_element: u64) -> Result<(), PrimitiveError> {
        self.check_key(ct)?;
        if !self.keys.galois_keys.contains(galois_element) || self.keys.galois_keys.key_id != self.key_id() {
            return Err(PrimitiveError::MissingGaloisKey { galois_element: galois_element });
        }
        let std = self.key_switch_noise_std();
        self.add_noise(ct, std);
        return Ok(());
    }
}

impl HomEvaluator for SimEvaluator {

    type Ciphertext = SimCiphertext;

    fn shallow_copy(&mut self) -> Self {
        SimEvaluator {
            params: self.params.clone(),
            keys: self.keys.clone(),
            rng: StdRng::from_seed(self.rng.gen()),
            scratch: Vec::new()
        }
    }

    fn zero(&self, level: usize) -> SimCiphertext {
        SimCiphertext {
            key_id: None,
            values: vec![Complex64::new(0., 0.); self.params.slots()],
            level: level,
            scale_degree: 1
        }
    }

    fn add(&mut self, lhs: &SimCiphertext, rhs: &SimCiphertext) -> Result<SimCiphertext, PrimitiveError> {
        let mut result = lhs.clone();
        self.add_assign(&mut result, rhs)?;
        return Ok(result);
    }

    fn add_assign(&mut self, lhs: &mut SimCiphertext, rhs: &SimCiphertext) -> Result<(), PrimitiveError> {
        let key_id = self.combined_key(lhs, rhs)?;
        if lhs.scale_degree != rhs.scale_degree {
            return Err(PrimitiveError::ScaleMismatch { lhs: lhs.scale_degree, rhs: rhs.scale_degree });
        }
        for (x, y) in lhs.values.iter_mut().zip(rhs.values.iter()) {
            *x += y;
        }
        lhs.key_id = key_id;
        lhs.level = lhs.level.min(rhs.level);
        return Ok(());
    }

    fn add_plain(&mut self, ct: &SimCiphertext, values: &[f64]) -> Result<SimCiphertext, PrimitiveError> {
        self.check_key(ct)?;
        let mut result = ct.clone();
        for (x, y) in result.values.iter_mut().zip(plain_operand(self.params.slots(), values)?) {
            *x += y;
        }
        return Ok(result);
    }

    fn mul_relin(&mut self, lhs: &SimCiphertext, rhs: &SimCiphertext) -> Result<SimCiphertext, PrimitiveError> {
        let key_id = self.combined_key(lhs, rhs)?;
        let mut result = SimCiphertext {
            key_id: key_id,
            values: lhs.values.iter().zip(rhs.values.iter()).map(|(x, y)| *x * *y).collect(),
            level: lhs.level.min(rhs.level),
            scale_degree: lhs.scale_degree + rhs.scale_degree
        };
        let std = self.key_switch_noise_std();
        self.add_noise(&mut result, std);
        return Ok(result);
    }

    fn mul_plain(&mut self, ct: &SimCiphertext, values: &[f64]) -> Result<SimCiphertext, PrimitiveError> {
        self.check_key(ct)?;
        let values = ct.values.iter().zip(plain_operand(self.params.slots(), values)?).map(|(x, y)| *x * y).collect();
        Ok(SimCiphertext {
            key_id: ct.key_id,
            values: values,
            level: ct.level,
            scale_degree: ct.scale_degree + 1
        })
    }

    fn rescale(&mut self, ct: &mut SimCiphertext) -> Result<(), PrimitiveError> {
        if ct.scale_degree < 2 {
            return Ok(());
        }
        if ct.level == 0 {
            return Err(PrimitiveError::LevelExhausted { operation: "rescale" });
        }
        ct.level -= 1;
        ct.scale_degree -= 1;
        let std = self.rounding_noise_std();
        self.add_noise(ct, std);
        return Ok(());
    }

    fn rotate(&mut self, ct: &SimCiphertext, k: i64) -> Result<SimCiphertext, PrimitiveError> {
        let mut result = ct.clone();
        self.rotate_assign(&mut result, k)?;
        return Ok(result);
    }

    fn rotate_assign(&mut self, ct: &mut SimCiphertext, k: i64) -> Result<(), PrimitiveError> {
        let slots = self.params.slots();
        let shift = k.rem_euclid(slots as i64) as usize;
        if shift == 0 {
            return Ok(());
        }
        let galois_element = self.params.galois_element_for_rotation(k);
        self.apply_galois(ct, galois_element)?;
        self.scratch.clear();
        self.scratch.extend_from_slice(&ct.values[shift..]);
        self.scratch.extend_from_slice(&ct.values[..shift]);
        std::mem::swap(&mut self.scratch, &mut ct.values);
        return Ok(());
    }

    fn conjugate(&mut self, ct: &SimCiphertext) -> Result<SimCiphertext, PrimitiveError> {
        let mut result = ct.clone();
        let galois_element = self.params.galois_element_for_conjugation();
        self.apply_galois(&mut result, galois_element)?;
        for x in &mut result.values {
            *x = x.conj();
        }
        return Ok(result);
    }
}

#[cfg(test)]
fn test_setup(depth: usize, rotations: &[i64]) -> (SimulatedCkks, SimSecretKey, SimPublicKey, SimEvaluator) {
    let mut rng = StdRng::from_seed([1; 32]);
    let scheme = SimulatedCkks::new(CkksParams::leveled(3, depth, 30, vec![40])).unwrap();
    let (sk, pk) = scheme.gen_key_pair(&mut rng);
    let relin_key = scheme.gen_relin_key(&mut rng, &sk);
    let mut galois_elements = rotations.iter().map(|k| scheme.params().galois_element_for_rotation(*k)).collect::<Vec<_>>();
    galois_elements.push(scheme.params().galois_element_for_conjugation());
    let galois_keys = scheme.gen_galois_keys(&mut rng, &sk, &galois_elements);
    let evaluator = scheme.new_evaluator(&mut rng, Arc::new(EvaluationKeySet { relin_key: relin_key, galois_keys: galois_keys }));
    return (scheme, sk, pk, evaluator);
}

#[cfg(test)]
fn assert_close(expected: &[f64], actual: &[Complex64]) {
    for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        assert!((e - a.re).abs() < 1e-5 && a.im.abs() < 1e-5, "slot {}: expected {}, got {}", i, e, a);
    }
}

#[test]
fn test_encrypt_decrypt() {
    let (scheme, sk, pk, _) = test_setup(2, &[]);
    let mut rng = StdRng::from_seed([3; 32]);
    let values = (0..8).map(|i| i as f64 - 3.5).collect::<Vec<_>>();
    let ct = scheme.encrypt(&mut rng, &pk, &scheme.encode(&values, 2).unwrap()).unwrap();
    assert_eq!(2, ct.level());
    let decrypted = scheme.decode(&scheme.decrypt(&sk, &ct).unwrap()).unwrap();
    assert_eq!(8, decrypted.len());
    assert_close(&values, &decrypted);
}

#[test]
fn test_encode_too_many_values() {
    let (scheme, _, _, _) = test_setup(2, &[]);
    assert_eq!(
        PrimitiveError::SlotCountMismatch { expected: 8, actual: 9 },
        scheme.encode(&[0.; 9], 0).unwrap_err()
    );
    assert!(matches!(scheme.encode(&[0.; 8], 3), Err(PrimitiveError::LevelOutOfRange { .. })));
}

#[test]
fn test_rotate_and_conjugate() {
    let (scheme, sk, pk, mut evaluator) = test_setup(2, &[1, -2]);
    let mut rng = StdRng::from_seed([3; 32]);
    let values = (0..8).map(|i| i as f64).collect::<Vec<_>>();
    let ct = scheme.encrypt(&mut rng, &pk, &scheme.encode(&values, 2).unwrap()).unwrap();

    let rotated = evaluator.rotate(&ct, 1).unwrap();
    assert_close(&[1., 2., 3., 4., 5., 6., 7., 0.], &scheme.decode(&scheme.decrypt(&sk, &rotated).unwrap()).unwrap());
    let rotated = evaluator.rotate(&ct, -2).unwrap();
    assert_close(&[6., 7., 0., 1., 2., 3., 4., 5.], &scheme.decode(&scheme.decrypt(&sk, &rotated).unwrap()).unwrap());
    let rotated = evaluator.rotate(&ct, 8).unwrap();
    assert_close(&values, &scheme.decode(&scheme.decrypt(&sk, &rotated).unwrap()).unwrap());

    assert_eq!(
        PrimitiveError::MissingGaloisKey { galois_element: scheme.params().galois_element_for_rotation(3) },
        evaluator.rotate(&ct, 3).unwrap_err()
    );
    let conjugated = evaluator.conjugate(&ct).unwrap();
    assert_close(&values, &scheme.decode(&scheme.decrypt(&sk, &conjugated).unwrap()).unwrap());
}

#[test]
fn test_mul_rescale_consumes_levels() {
    let (scheme, sk, pk, mut evaluator) = test_setup(2, &[]);
    let mut rng = StdRng::from_seed([3; 32]);
    let values = [0.5, -1., 2., 0., 0., 0., 0., 3.];
    let ct = scheme.encrypt(&mut rng, &pk, &scheme.encode(&values, 2).unwrap()).unwrap();

    let mut square = evaluator.mul_relin(&ct, &ct).unwrap();
    assert_eq!(2, square.scale_degree());
    assert_eq!(
        PrimitiveError::ScaleMismatch { lhs: 2, rhs: 1 },
        evaluator.add(&square, &ct).unwrap_err()
    );
    evaluator.rescale(&mut square).unwrap();
    assert_eq!(1, square.level());

    let mut quartic = evaluator.mul_relin(&square, &square).unwrap();
    evaluator.rescale(&mut quartic).unwrap();
    assert_eq!(0, quartic.level());
    let sum = evaluator.add(&quartic, &ct).unwrap();
    assert_eq!(0, sum.level());
    assert_close(
        &values.iter().map(|x| x * x * x * x + x).collect::<Vec<_>>(),
        &scheme.decode(&scheme.decrypt(&sk, &sum).unwrap()).unwrap()
    );

    let mut too_deep = evaluator.mul_plain(&quartic, &[2.; 8]).unwrap();
    assert_eq!(
        PrimitiveError::LevelExhausted { operation: "rescale" },
        evaluator.rescale(&mut too_deep).unwrap_err()
    );
}

#[test]
fn test_foreign_key_rejected() {
    let (scheme, _, pk, _) = test_setup(1, &[]);
    let mut rng = StdRng::from_seed([2; 32]);
    let (other_sk, _) = scheme.gen_key_pair(&mut rng);
    let relin_key = scheme.gen_relin_key(&mut rng, &other_sk);
    let galois_keys = scheme.gen_galois_keys(&mut rng, &other_sk, &[]);
    let mut other_evaluator = scheme.new_evaluator(&mut rng, Arc::new(EvaluationKeySet { relin_key: relin_key, galois_keys: galois_keys }));
    let ct = scheme.encrypt(&mut rng, &pk, &scheme.encode(&[1.], 1).unwrap()).unwrap();
    assert_eq!(PrimitiveError::KeyMismatch, scheme.decrypt(&other_sk, &ct).unwrap_err());
    assert_eq!(PrimitiveError::KeyMismatch, other_evaluator.add_plain(&ct, &[1.]).unwrap_err());
}

#[test]
fn test_noise_is_seeded() {
    let (scheme, sk, pk, mut evaluator) = test_setup(1, &[1]);
    let (_, _, _, mut same_evaluator) = test_setup(1, &[1]);
    let plaintext = scheme.encode(&[0.25, -1., 3.], 1).unwrap();
    let ct = scheme.encrypt(&mut StdRng::from_seed([3; 32]), &pk, &plaintext).unwrap();
    let same_ct = scheme.encrypt(&mut StdRng::from_seed([3; 32]), &pk, &plaintext).unwrap();
    let other_ct = scheme.encrypt(&mut StdRng::from_seed([4; 32]), &pk, &plaintext).unwrap();
    let decrypt = |ct: &SimCiphertext| scheme.decode(&scheme.decrypt(&sk, ct).unwrap()).unwrap();
    assert_eq!(decrypt(&ct), decrypt(&same_ct));
    assert_ne!(decrypt(&ct), decrypt(&other_ct));

    let mut copy = evaluator.shallow_copy();
    let mut same_copy = same_evaluator.shallow_copy();
    assert_eq!(decrypt(&copy.rotate(&ct, 1).unwrap()), decrypt(&same_copy.rotate(&ct, 1).unwrap()));
    assert_eq!(decrypt(&evaluator.rotate(&ct, 1).unwrap()), decrypt(&same_evaluator.rotate(&ct, 1).unwrap()));
    assert_ne!(decrypt(&copy.rotate(&ct, 1).unwrap()), decrypt(&evaluator.rotate(&ct, 1).unwrap()));
}
