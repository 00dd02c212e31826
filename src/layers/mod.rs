
///
/// One-dimensional convolution on channel-packed tensors.
///
pub mod conv;

///
/// Dense layers via the diagonal method.
///
pub mod fc;

///
/// The degree-4 polynomial approximation of swish.
///
pub mod activation;

///
/// Conversion of channel-packed tensors into one dense vector.
///
pub mod flatten;
