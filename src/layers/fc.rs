use rayon::prelude::*;
use tracing::instrument;

use crate::context::Context;
use crate::error::*;
use crate::model::FCLayer;
use crate::scheme::*;
use crate::tensor::*;

fn transpose(matrix: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let cols = matrix.first().map(|row| row.len()).unwrap_or(0);
    (0..cols).map(|j| matrix.iter().map(|row| row[j]).collect()).collect()
}

///
/// Number of copies of width `out_features` that have to be summed up after
/// the diagonal products, i.e. `ceil(in_features / out_features) + 1`.
///
pub fn fold_count(layer: &FCLayer) -> usize {
    layer.in_features.div_ceil(layer.out_features) + 1
}

///
/// Computes, for each output index `o`, the combined diagonal that is multiplied
/// with the input vector before rotating the product by `o - out_features`.
///
/// The weight rows are shifted into a `out_features x q * out_features` matrix (row `o`
/// starting at column `out_features - o`), whose transpose is cut into `q` slices of
/// `out_features` rows each; the `o`-th rows of these slices, concatenated and aligned
/// by a left rotation, give the diagonal. Effectively, entry `s < in_features` of the
/// `o`-th diagonal is `W[(s - o) mod out_features][s]`.
///
pub fn diagonal_vectors(layer: &FCLayer, scale_correction: f64, slots: usize) -> Vec<Vec<f64>> {
    let out = layer.out_features;
    let q = fold_count(layer);
    let width = q * out;
    let shifted_rows = layer.weight.iter().enumerate().map(|(o, row)| {
        let mut shifted = vec![0.; out - o];
        shifted.extend(row.iter().map(|w| w * scale_correction));
        shifted.resize(width, 0.);
        shifted
    }).collect::<Vec<_>>();
    let transposed = transpose(&shifted_rows);
    return (0..out).map(|o| {
        let mut diagonal = (0..q).flat_map(|i| transposed[o + out * i].iter().copied()).collect::<Vec<_>>();
        diagonal.resize(slots, 0.);
        diagonal.rotate_left(out - o);
        diagonal
    }).collect();
}

///
/// Evaluates a dense layer on a tensor holding one dense vector, e.g. the output
/// of [`crate::layers::flatten::hom_flatten()`]. Consumes one level.
///
#[instrument(skip_all)]
pub fn hom_fully_connected<S: CkksScheme>(ctx: &Context<S>, input: &EncryptedTensor<S>, layer: &FCLayer) -> Result<EncryptedTensor<S>> {
    let slots = ctx.slots();
    let layout = input.layout();
    if input.lanes() != 1 || layout.channels != 1 || layout.interval != 1 {
        return Err(HEError::configuration(format!(
            "fully connected layer requires one dense vector, got {} lanes with {} channels and interval {}",
            input.lanes(), layout.channels, layout.interval
        )));
    }
    if layout.size != layer.in_features {
        return Err(HEError::configuration(format!("fully connected layer expects {} features, got {}", layer.in_features, layout.size)));
    }
    let q = fold_count(layer);
    if q * layer.out_features > slots {
        return Err(HEError::configuration(format!("{} diagonals of width {} exceed the slot count {}", q, layer.out_features, slots)));
    }
    let out = layer.out_features;
    let ct = &input.data()[0];
    let diagonals = diagonal_vectors(layer, layout.scale_correction, slots);

    let partials = diagonals.par_iter().enumerate().map(|(o, diagonal)| -> Result<_> {
        let product = {
            let mut evaluator = ctx.evaluator()?;
            let mut product = evaluator.mul_plain(ct, diagonal)?;
            evaluator.rescale(&mut product)?;
            product
        };
        ctx.rotate(&product, o as i64 - out as i64)
    }).collect::<Result<Vec<_>>>()?;
    let sum = ctx.add_many(partials.iter().map(Some))?;

    let copies = (0..q).into_par_iter()
        .map(|i| ctx.rotate(&sum, (i * out) as i64))
        .collect::<Result<Vec<_>>>()?;
    let folded = ctx.add_many(copies.iter().map(Some))?;
    let result = ctx.evaluator()?.add_plain(&folded, &layer.bias)?;

    let output_layout = Layout {
        size: out,
        interval: 1,
        space: slots,
        channels: 1,
        replication: 1,
        scale_correction: 1.
    };
    return Ok(EncryptedTensor::from_parts(vec![result], output_layout));
}

#[cfg(test)]
use crate::context::{assert_close, test_context};
#[cfg(test)]
use crate::model::random_fc_layer;
#[cfg(test)]
use crate::reference;

#[test]
fn test_diagonal_vectors() {
    let mut rng = oorandom::Rand64::new(1);
    for (in_features, out_features) in [(24, 5), (5, 5), (3, 7), (16, 1)] {
        let layer = random_fc_layer(&mut rng, in_features, out_features);
        let diagonals = diagonal_vectors(&layer, 2., 64);
        for (o, diagonal) in diagonals.iter().enumerate() {
            assert_eq!(64, diagonal.len());
            for s in 0..64 {
                let expected = if s < in_features { 2. * layer.weight[(s + out_features - o) % out_features][s] } else { 0. };
                assert_eq!(expected, diagonal[s], "diagonal {}, entry {}", o, s);
            }
        }
    }
}

#[test]
fn test_fully_connected() {
    let mut rng = oorandom::Rand64::new(2);
    let ctx = test_context(1);
    for (in_features, out_features) in [(24, 5), (5, 5), (3, 7), (64, 1), (30, 16)] {
        let layer = random_fc_layer(&mut rng, in_features, out_features);
        let input = (0..in_features).map(|i| ((i * 7) % 11) as f64 / 11. - 0.5).collect::<Vec<_>>();
        let encrypted = ctx.encrypt(&PlainTensor::new(vec![input.clone()]).unwrap()).unwrap();
        let result = hom_fully_connected(&ctx, &encrypted, &layer).unwrap();
        assert_eq!(out_features, result.layout().size);
        assert_eq!(0, result.data()[0].level());
        assert_close(&reference::fully_connected(&input, &layer), &ctx.decrypt(&result).unwrap().channel(0), 1e-5);
    }
}

#[test]
fn test_fully_connected_applies_scale_correction() {
    let mut rng = oorandom::Rand64::new(3);
    let ctx = test_context(1);
    let layer = random_fc_layer(&mut rng, 6, 3);
    let input = vec![0.5, -0.25, 1., 0., 0.75, -1.];
    let layout = Layout { scale_correction: 4., ..Layout::dense(6, 1) };
    let mut lane = input.iter().map(|x| x / 4.).collect::<Vec<_>>();
    lane.resize(8, 0.);
    let encrypted = ctx.encrypt(&PlainTensor::with_layout(vec![lane], layout).unwrap()).unwrap();
    let result = hom_fully_connected(&ctx, &encrypted, &layer).unwrap();
    assert_eq!(1., result.layout().scale_correction);
    assert_close(&reference::fully_connected(&input, &layer), &ctx.decrypt(&result).unwrap().channel(0), 1e-5);
}

#[test]
fn test_fully_connected_preconditions() {
    let mut rng = oorandom::Rand64::new(4);
    let ctx = test_context(1);
    let two_lanes = ctx.encrypt(&PlainTensor::new(vec![vec![1.; 4], vec![2.; 4]]).unwrap()).unwrap();
    assert!(hom_fully_connected(&ctx, &two_lanes, &random_fc_layer(&mut rng, 4, 2)).unwrap_err().is_configuration());
    let dense = ctx.encrypt(&PlainTensor::new(vec![vec![1.; 4]]).unwrap()).unwrap();
    assert!(hom_fully_connected(&ctx, &dense, &random_fc_layer(&mut rng, 5, 2)).unwrap_err().is_configuration());
}
