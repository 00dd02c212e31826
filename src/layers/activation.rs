use rayon::prelude::*;
use tracing::instrument;

use crate::context::Context;
use crate::error::*;
use crate::scheme::*;
use crate::tensor::*;

pub const SWISH_C4: f64 = -0.002012;
pub const SWISH_C2: f64 = -73.2107355865;
pub const SWISH_C1: f64 = -248.508946322;
pub const SWISH_C0: f64 = -59.5427435388;

///
/// The degree-4 polynomial `c4 * (x^4 + c2 * x^2 + c1 * x + c0)` that replaces
/// swish in the network.
///
pub fn approx_swish(x: f64) -> f64 {
    let square = x * x;
    SWISH_C4 * (square * square + SWISH_C2 * square + SWISH_C1 * x + SWISH_C0)
}

///
/// `value` at every element position of every block that carries data,
/// including the replicated copies, and zero elsewhere.
///
fn active_constant(layout: &Layout, lanes: usize, value: f64, slots: usize) -> Vec<f64> {
    let mut result = layout.constant_at_elements(value, slots);
    result.truncate((layout.replication * layout.lane_span(lanes)).min(slots));
    return result;
}

///
/// Evaluates [`approx_swish()`] elementwise on an encrypted tensor. Consumes two levels.
///
/// The leading coefficient is not applied homomorphically, but folded into the scale
/// correction of the result. If the input has scale correction `s`, the ciphertext
/// holds `y = x / s`, so the remaining coefficients are scaled to
/// `y^4 + (c2 / s^2) y^2 + (c1 / s^3) y + c0 / s^4` and the result has correction `c4 * s^4`.
///
#[instrument(skip_all)]
pub fn hom_approx_swish<S: CkksScheme>(ctx: &Context<S>, input: &EncryptedTensor<S>) -> Result<EncryptedTensor<S>> {
    let slots = ctx.slots();
    let layout = input.layout();
    let correction = layout.scale_correction;
    let quadratic = active_constant(layout, input.lanes(), SWISH_C2 / correction.powi(2), slots);
    let linear = active_constant(layout, input.lanes(), SWISH_C1 / correction.powi(3), slots);
    let constant = active_constant(layout, input.lanes(), SWISH_C0 / correction.powi(4), slots);

    let data = input.data().par_iter().map(|ct| -> Result<_> {
        let mut evaluator = ctx.evaluator()?;
        let mut square = evaluator.mul_relin(ct, ct)?;
        evaluator.rescale(&mut square)?;
        let shifted_square = evaluator.add_plain(&square, &quadratic)?;
        let mut result = evaluator.mul_relin(&shifted_square, &square)?;
        evaluator.rescale(&mut result)?;
        let mut linear_term = evaluator.mul_plain(ct, &linear)?;
        evaluator.rescale(&mut linear_term)?;
        evaluator.add_assign(&mut result, &linear_term)?;
        return Ok(evaluator.add_plain(&result, &constant)?);
    }).collect::<Result<Vec<_>>>()?;

    let output_layout = Layout {
        scale_correction: SWISH_C4 * correction.powi(4),
        ..layout.clone()
    };
    return Ok(EncryptedTensor::from_parts(data, output_layout));
}

#[cfg(test)]
use crate::context::{assert_close, test_context};

#[test]
fn test_approx_swish() {
    assert_close(&[SWISH_C4 * SWISH_C0], &[approx_swish(0.)], 1e-15);
    let expected = SWISH_C4 * (16. + 4. * SWISH_C2 - 2. * SWISH_C1 + SWISH_C0);
    assert_close(&[expected], &[approx_swish(-2.)], 1e-12);
}

#[test]
fn test_hom_approx_swish() {
    let ctx = test_context(2);
    let rows = vec![
        vec![-2., -1.5, -0.5, 0., 0.25, 1., 2.],
        vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]
    ];
    let input = ctx.encrypt(&PlainTensor::new(rows.clone()).unwrap()).unwrap();
    let result = hom_approx_swish(&ctx, &input).unwrap();
    assert!(result.data().iter().all(|ct| ct.level() == 0));
    assert_eq!(SWISH_C4, result.layout().scale_correction);
    let actual = ctx.decrypt(&result).unwrap().to_channels();
    for (row, actual_row) in rows.iter().zip(actual.iter()) {
        let expected = row.iter().map(|x| approx_swish(*x)).collect::<Vec<_>>();
        assert_close(&expected, actual_row, 1e-5);
    }
}

#[test]
fn test_hom_approx_swish_with_scale_correction() {
    let ctx = test_context(2);
    let values = vec![-1., -0.5, 0.5, 1.5];
    let layout = Layout { scale_correction: 2., ..Layout::dense(4, 1) };
    let halved = values.iter().map(|x| x / 2.).collect::<Vec<_>>();
    let input = ctx.encrypt(&PlainTensor::with_layout(vec![halved], layout).unwrap()).unwrap();
    let result = hom_approx_swish(&ctx, &input).unwrap();
    assert_eq!(16. * SWISH_C4, result.layout().scale_correction);
    let expected = values.iter().map(|x| approx_swish(*x)).collect::<Vec<_>>();
    assert_close(&expected, &ctx.decrypt(&result).unwrap().channel(0), 1e-5);
}

#[test]
fn test_hom_approx_swish_keeps_inactive_slots_zero() {
    let ctx = test_context(2);
    let input = ctx.encrypt(&PlainTensor::new(vec![vec![0.5, -0.5, 1.]]).unwrap()).unwrap();
    let result = hom_approx_swish(&ctx, &input).unwrap();
    let decrypted = ctx.decrypt(&result).unwrap();
    assert!(decrypted.data()[0][3..].iter().all(|x| x.abs() < 1e-6));
}

#[test]
fn test_hom_approx_swish_requires_two_levels() {
    let ctx = test_context(1);
    let input = ctx.encrypt(&PlainTensor::new(vec![vec![0.5, -0.5]]).unwrap()).unwrap();
    assert!(hom_approx_swish(&ctx, &input).unwrap_err().is_primitive());
}
