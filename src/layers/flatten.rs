use rayon::prelude::*;
use tracing::instrument;

use crate::context::Context;
use crate::error::*;
use crate::scheme::*;
use crate::tensor::*;

///
/// One masked multiplication followed by a rotation: the slots selected by
/// `mask` of lane `lane` are moved left by `shift`.
///
struct Piece {
    lane: usize,
    mask: Vec<f64>,
    shift: i64
}

fn pieces(layout: &Layout, lanes: usize, slots: usize) -> Vec<Piece> {
    let per_lane = layout.channels_per_lane(lanes);
    let mut result = Vec::new();
    for lane in 0..lanes {
        for j in 0..per_lane {
            let target = (lane * per_lane + j) * layout.size;
            let block_start = j * layout.space;
            if layout.interval == 1 {
                let mut mask = vec![0.; slots];
                mask[block_start..(block_start + layout.size)].fill(layout.scale_correction);
                result.push(Piece { lane: lane, mask: mask, shift: block_start as i64 - target as i64 });
            } else {
                for p in 0..layout.size {
                    let source = block_start + p * layout.interval;
                    let mut mask = vec![0.; slots];
                    mask[source] = layout.scale_correction;
                    result.push(Piece { lane: lane, mask: mask, shift: source as i64 - (target + p) as i64 });
                }
            }
        }
    }
    return result;
}

///
/// Gathers all channels of a tensor into one dense vector in a single lane,
/// channel `c` occupying `[c * size, (c + 1) * size)`. Consumes one level.
///
/// If the elements are not consecutive (`interval > 1`), every element is moved separately,
/// which requires one rotation per element instead of one per channel.
///
#[instrument(skip_all)]
pub fn hom_flatten<S: CkksScheme>(ctx: &Context<S>, input: &EncryptedTensor<S>) -> Result<EncryptedTensor<S>> {
    let slots = ctx.slots();
    let layout = input.layout();
    let total = layout.channels * layout.size;
    if total > slots {
        return Err(HEError::configuration(format!("{} channels of size {} exceed the slot count {}", layout.channels, layout.size, slots)));
    }
    let pieces = pieces(layout, input.lanes(), slots);
    tracing::debug!(pieces = pieces.len(), interval = layout.interval, "flatten");

    let moved = pieces.par_iter().map(|piece| -> Result<_> {
        let product = {
            let mut evaluator = ctx.evaluator()?;
            let mut product = evaluator.mul_plain(&input.data()[piece.lane], &piece.mask)?;
            evaluator.rescale(&mut product)?;
            product
        };
        ctx.rotate(&product, piece.shift)
    }).collect::<Result<Vec<_>>>()?;
    let result = ctx.add_many(moved.iter().map(Some))?;

    let output_layout = Layout {
        size: total,
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

#[test]
fn test_flatten_dense() {
    let ctx = test_context(1);
    let rows = vec![vec![1., 2., 3.], vec![4., 5., 6.]];
    let input = ctx.encrypt(&PlainTensor::new(rows).unwrap()).unwrap();
    let result = hom_flatten(&ctx, &input).unwrap();
    assert_eq!(1, result.lanes());
    assert_eq!(0, result.data()[0].level());
    assert_eq!(Layout { size: 6, interval: 1, space: 1024, channels: 1, replication: 1, scale_correction: 1. }, *result.layout());
    let decrypted = ctx.decrypt(&result).unwrap();
    assert_close(&[1., 2., 3., 4., 5., 6.], &decrypted.channel(0), 1e-6);
    assert_close(&[0.; 1018], &decrypted.data()[0][6..], 1e-6);
}

#[test]
fn test_flatten_with_interval() {
    let ctx = test_context(1);
    // two lanes with two channels each, size 2, interval 2, space 4
    let layout = Layout { size: 2, interval: 2, space: 4, channels: 4, replication: 1, scale_correction: 2. };
    let data = vec![
        vec![1., 9., 2., 9., 3., 9., 4., 9.],
        vec![5., 9., 6., 9., 7., 9., 8., 9.]
    ];
    let input = ctx.encrypt(&PlainTensor::with_layout(data, layout).unwrap()).unwrap();
    let result = hom_flatten(&ctx, &input).unwrap();
    assert_eq!(8, result.layout().size);
    let decrypted = ctx.decrypt(&result).unwrap();
    assert_close(&[2., 4., 6., 8., 10., 12., 14., 16.], &decrypted.channel(0), 1e-6);
    assert_close(&[0.; 1016], &decrypted.data()[0][8..], 1e-6);
}

#[test]
fn test_flatten_ignores_replicated_copies() {
    let ctx = test_context(1);
    let input = ctx.encrypt(&PlainTensor::new(vec![vec![1., -1.]]).unwrap()).unwrap();
    let filled = ctx.fill(&input).unwrap();
    let result = hom_flatten(&ctx, &filled).unwrap();
    let decrypted = ctx.decrypt(&result).unwrap();
    assert_close(&[1., -1.], &decrypted.channel(0), 1e-6);
    assert_close(&[0.; 1022], &decrypted.data()[0][2..], 1e-6);
}

#[test]
fn test_flatten_too_large() {
    let ctx = test_context(1);
    let input = ctx.encrypt(&PlainTensor::new(vec![vec![1.; 600], vec![2.; 600]]).unwrap()).unwrap();
    assert!(hom_flatten(&ctx, &input).unwrap_err().is_configuration());
}
