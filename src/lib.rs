#![doc = include_str!("../Readme.md")]

#[macro_use]
pub mod profiling;

///
/// Contains [`error::HEError`], the error type of all fallible operations.
///
pub mod error;

///
/// Decomposition of arbitrary slot rotations into rotations by a small set of generators.
///
pub mod rotation;

///
/// The interface to the underlying CKKS scheme, and a self-contained implementation
/// [`scheme::simulated::SimulatedCkks`] of it.
///
pub mod scheme;

///
/// A bounded pool of evaluators that allows executing homomorphic operations in parallel.
///
pub mod pool;

///
/// Layouts that describe how tensors are packed into the slots of ciphertexts.
///
pub mod tensor;

///
/// Contains [`context::Context`], which holds the keys and evaluators of one session
/// and provides the basic operations on encrypted tensors.
///
pub mod context;

///
/// Homomorphic evaluation of the network layers.
///
pub mod layers;

///
/// Layer descriptors, models and their encrypted and plaintext forward passes.
///
pub mod model;

///
/// The plaintext evaluation of the network layers, as reference for the encrypted ones.
///
pub mod reference;
