use rayon::prelude::*;
use tracing::instrument;

use crate::context::Context;
use crate::error::*;
use crate::model::Conv1DLayer;
use crate::scheme::*;
use crate::tensor::*;

///
/// Describes how input and output channels of a convolution are distributed
/// over lanes, and where the output elements end up.
///
/// Each lane holds `in_per_lane` input channels next to each other, in blocks
/// of width `input.space`. For every local output channel `o`, the block group of
/// input channels at offset `o * in_per_lane * input.space` is multiplied with the
/// corresponding weights, so the input must be replicated at least `out_per_lane`
/// times. Afterwards, the `in_per_lane` blocks of each group are summed onto the first
/// one, which then becomes the output channel `o` of width `space_out`.
///
#[derive(Clone, Debug, PartialEq)]
pub struct ConvGeometry {
    pub input: Layout,
    pub lanes_in: usize,
    pub lanes_out: usize,
    pub in_per_lane: usize,
    pub out_per_lane: usize,
    pub size_out: usize,
    pub interval_out: usize,
    pub space_out: usize
}

impl ConvGeometry {

    pub fn new(input: &Layout, lanes_in: usize, layer: &Conv1DLayer, slots: usize) -> Result<Self> {
        if layer.in_channels != input.channels {
            return Err(HEError::configuration(format!("convolution expects {} input channels, got {}", layer.in_channels, input.channels)));
        }
        if lanes_in == 0 || input.channels % lanes_in != 0 {
            return Err(HEError::configuration(format!("{} channels cannot be evenly distributed over {} lanes", input.channels, lanes_in)));
        }
        let in_per_lane = input.channels / lanes_in;
        if !in_per_lane.is_power_of_two() {
            return Err(HEError::configuration(format!("convolution requires a power-of-two number of channels per lane, got {}", in_per_lane)));
        }
        if input.size + 2 * layer.padding < layer.kernel_size {
            return Err(HEError::configuration(format!("kernel of size {} exceeds the padded input of size {}", layer.kernel_size, input.size + 2 * layer.padding)));
        }
        let lanes_out = (input.space * layer.in_channels * layer.out_channels).div_ceil(slots);
        if layer.out_channels % lanes_out != 0 {
            return Err(HEError::configuration(format!("{} output channels cannot be evenly distributed over {} lanes", layer.out_channels, lanes_out)));
        }
        let size_out = (input.size + 2 * layer.padding - layer.kernel_size) / layer.stride + 1;
        let interval_out = input.interval * layer.stride;
        if size_out * interval_out > input.space {
            return Err(HEError::configuration(format!("{} output elements with interval {} do not fit into space {}", size_out, interval_out, input.space)));
        }
        Ok(Self {
            input: input.clone(),
            lanes_in: lanes_in,
            lanes_out: lanes_out,
            in_per_lane: in_per_lane,
            out_per_lane: layer.out_channels / lanes_out,
            size_out: size_out,
            interval_out: interval_out,
            space_out: input.space * in_per_lane
        })
    }

    pub fn required_replication(&self) -> usize {
        self.out_per_lane
    }

    pub fn output_layout(&self, layer: &Conv1DLayer, slots: usize) -> Layout {
        Layout {
            size: self.size_out,
            interval: self.interval_out,
            space: self.space_out,
            channels: layer.out_channels,
            replication: slots / (self.out_per_lane * self.space_out),
            scale_correction: 1.
        }
    }

    ///
    /// Weights that are multiplied with the input lane `lane_in`, rotated by the
    /// `k`-th kernel offset, to contribute to output lane `lane_out`.
    ///
    /// Output element `p` reads input element `p * stride - padding + k`; if that is
    /// outside of the input, the weight is zero, which implements zero-padding.
    ///
    pub fn kernel_vector(&self, layer: &Conv1DLayer, lane_out: usize, lane_in: usize, k: usize, slots: usize) -> Vec<f64> {
        let space = self.input.space;
        let mut block = vec![0.; self.out_per_lane * self.in_per_lane * space];
        for o in 0..self.out_per_lane {
            for i in 0..self.in_per_lane {
                let weight = layer.weight[lane_out * self.out_per_lane + o][lane_in * self.in_per_lane + i][k] * self.input.scale_correction;
                let start = (o * self.in_per_lane + i) * space;
                for p in 0..self.size_out {
                    let source = (p * layer.stride + k) as i64 - layer.padding as i64;
                    if source >= 0 && (source as usize) < self.input.size {
                        block[start + p * self.interval_out] = weight;
                    }
                }
            }
        }
        return repeat_to_slots(&block, slots);
    }

    pub fn bias_vector(&self, layer: &Conv1DLayer, lane_out: usize, slots: usize) -> Vec<f64> {
        let mut block = vec![0.; self.out_per_lane * self.space_out];
        for o in 0..self.out_per_lane {
            for p in 0..self.size_out {
                block[o * self.space_out + p * self.interval_out] = layer.bias[lane_out * self.out_per_lane + o];
            }
        }
        return repeat_to_slots(&block, slots);
    }
}

///
/// Evaluates a convolution layer on an encrypted tensor. Consumes one level.
///
/// The input must be replicated at least [`ConvGeometry::required_replication()`] times,
/// see [`Context::fill()`]. If each lane holds only one input channel, the final summation
/// over the channel blocks is skipped.
///
#[instrument(skip_all)]
pub fn hom_conv1d<S: CkksScheme>(ctx: &Context<S>, input: &EncryptedTensor<S>, layer: &Conv1DLayer) -> Result<EncryptedTensor<S>> {
    let slots = ctx.slots();
    let geometry = ConvGeometry::new(input.layout(), input.lanes(), layer, slots)?;
    if input.layout().replication < geometry.required_replication() {
        return Err(HEError::configuration(format!(
            "convolution with {} output channels per lane requires the input to be replicated that often, but got replication {}",
            geometry.out_per_lane, input.layout().replication
        )));
    }
    tracing::debug!(?geometry, "convolution");
    let kernel = layer.kernel_size;
    let per_output_lane = geometry.lanes_in * kernel;

    let rotated = (0..per_output_lane).into_par_iter().map(|index| {
        let (lane_in, k) = (index / kernel, index % kernel);
        let shift = (k as i64 - layer.padding as i64) * input.layout().interval as i64;
        ctx.rotate(&input.data()[lane_in], shift)
    }).collect::<Result<Vec<_>>>()?;

    let products = (0..(geometry.lanes_out * per_output_lane)).into_par_iter().map(|index| -> Result<_> {
        let (lane_out, rotation_index) = (index / per_output_lane, index % per_output_lane);
        let (lane_in, k) = (rotation_index / kernel, rotation_index % kernel);
        let weights = geometry.kernel_vector(layer, lane_out, lane_in, k, slots);
        let mut evaluator = ctx.evaluator()?;
        let mut product = evaluator.mul_plain(&rotated[rotation_index], &weights)?;
        evaluator.rescale(&mut product)?;
        return Ok(product);
    }).collect::<Result<Vec<_>>>()?;

    let data = products.par_chunks(per_output_lane).enumerate().map(|(lane_out, partials)| -> Result<_> {
        let sum = ctx.add_many(partials.iter().map(Some))?;
        let sum = if geometry.in_per_lane > 1 {
            ctx.fold(&sum, geometry.in_per_lane, geometry.input.space)?
        } else {
            sum
        };
        let bias = geometry.bias_vector(layer, lane_out, slots);
        let mut evaluator = ctx.evaluator()?;
        return Ok(evaluator.add_plain(&sum, &bias)?);
    }).collect::<Result<Vec<_>>>()?;

    return Ok(EncryptedTensor::from_parts(data, geometry.output_layout(layer, slots)));
}

#[cfg(test)]
use crate::context::{assert_close, test_context};
#[cfg(test)]
use crate::model::random_conv_layer;
#[cfg(test)]
use crate::reference;

#[cfg(test)]
fn check_conv(input: Vec<Vec<f64>>, layers: &[Conv1DLayer], tolerance: f64) {
    let ctx = test_context(layers.len());
    let mut expected = input.clone();
    let mut current = ctx.encrypt(&PlainTensor::new(input).unwrap()).unwrap();
    for layer in layers {
        let geometry = ConvGeometry::new(current.layout(), current.lanes(), layer, ctx.slots()).unwrap();
        if current.layout().replication < geometry.required_replication() {
            current = ctx.fill(&current).unwrap();
        }
        current = hom_conv1d(&ctx, &current, layer).unwrap();
        expected = reference::conv1d(&expected, layer);
    }
    let actual = ctx.decrypt(&current).unwrap().to_channels();
    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.iter().zip(actual.iter()) {
        assert_close(e, a, tolerance);
    }
}

#[test]
fn test_conv_single_input_channel() {
    let layer = Conv1DLayer::new(
        vec![vec![vec![0.5, -1., 0.25]], vec![vec![1., 2., -0.5]]],
        vec![0.1, -0.2],
        1,
        0
    ).unwrap();
    let input = vec![vec![1., 2., 3., 4., 5., 6., 7., 8.]];
    let expected = vec![
        vec![0.5 - 2. + 0.75 + 0.1, 1. - 3. + 1. + 0.1, 1.5 - 4. + 1.25 + 0.1, 2. - 5. + 1.5 + 0.1, 2.5 - 6. + 1.75 + 0.1, 3. - 7. + 2. + 0.1],
        vec![1. + 4. - 1.5 - 0.2, 2. + 6. - 2. - 0.2, 3. + 8. - 2.5 - 0.2, 4. + 10. - 3. - 0.2, 5. + 12. - 3.5 - 0.2, 6. + 14. - 4. - 0.2]
    ];
    for (e, a) in expected.iter().zip(reference::conv1d(&input, &layer).iter()) {
        assert_close(e, a, 1e-12);
    }
    check_conv(input, &[layer], 1e-2);
}

#[test]
fn test_conv_stride_and_padding() {
    let mut rng = oorandom::Rand64::new(1);
    let input = vec![(0..14).map(|i| (i as f64 * 0.37).sin()).collect::<Vec<_>>()];
    check_conv(input.clone(), &[random_conv_layer(&mut rng, 1, 3, 3, 2, 1)], 1e-4);
    check_conv(input.clone(), &[random_conv_layer(&mut rng, 1, 8, 3, 1, 1)], 1e-4);
    check_conv(input, &[random_conv_layer(&mut rng, 1, 2, 1, 1, 0)], 1e-4);
}

#[test]
fn test_conv_multiple_channels() {
    let mut rng = oorandom::Rand64::new(2);
    let input = vec![(0..14).map(|i| (i as f64 * 0.61).cos()).collect::<Vec<_>>()];
    check_conv(input.clone(), &[random_conv_layer(&mut rng, 1, 4, 2, 1, 0), random_conv_layer(&mut rng, 4, 8, 2, 1, 0)], 1e-4);
    check_conv(input, &[random_conv_layer(&mut rng, 1, 8, 3, 1, 0), random_conv_layer(&mut rng, 8, 4, 3, 1, 1)], 1e-4);
}

#[test]
fn test_conv_multiple_lanes() {
    let mut rng = oorandom::Rand64::new(3);
    let input = vec![
        (0..10).map(|i| i as f64 / 10.).collect::<Vec<_>>(),
        (0..10).map(|i| 1. - i as f64 / 5.).collect::<Vec<_>>()
    ];
    check_conv(input.clone(), &[random_conv_layer(&mut rng, 2, 4, 3, 1, 0)], 1e-4);
    // 16 * 1 * 128 > 1024, so the output needs two lanes
    let layer = random_conv_layer(&mut rng, 1, 128, 2, 1, 0);
    let geometry = ConvGeometry::new(&Layout::dense(10, 1), 1, &layer, 1024).unwrap();
    assert_eq!(2, geometry.lanes_out);
    assert_eq!(64, geometry.out_per_lane);
    check_conv(vec![input[0].clone()], &[layer], 1e-4);
}

#[test]
fn test_conv_geometry() {
    let mut rng = oorandom::Rand64::new(4);
    let input = Layout { size: 13, interval: 1, space: 16, channels: 32, replication: 2, scale_correction: 1. };
    let geometry = ConvGeometry::new(&input, 1, &random_conv_layer(&mut rng, 32, 64, 2, 1, 0), 1024).unwrap();
    assert_eq!(32, geometry.lanes_out);
    assert_eq!(2, geometry.out_per_lane);
    assert_eq!(32, geometry.in_per_lane);
    assert_eq!(12, geometry.size_out);
    assert_eq!(512, geometry.space_out);
    assert_eq!(1, geometry.output_layout(&random_conv_layer(&mut rng, 32, 64, 2, 1, 0), 1024).replication);

    let three_channels = Layout { channels: 3, ..input.clone() };
    assert!(ConvGeometry::new(&three_channels, 1, &random_conv_layer(&mut rng, 3, 2, 2, 1, 0), 1024).unwrap_err().is_configuration());
    assert!(ConvGeometry::new(&input, 1, &random_conv_layer(&mut rng, 16, 2, 2, 1, 0), 1024).unwrap_err().is_configuration());
    assert!(ConvGeometry::new(&input, 1, &random_conv_layer(&mut rng, 32, 2, 15, 1, 0), 1024).unwrap_err().is_configuration());
}

#[test]
fn test_conv_requires_replication() {
    let mut rng = oorandom::Rand64::new(5);
    let ctx = test_context(1);
    let input = ctx.encrypt(&PlainTensor::new(vec![vec![1., 2., 3., 4.]]).unwrap()).unwrap();
    let layer = random_conv_layer(&mut rng, 1, 2, 2, 1, 0);
    assert!(hom_conv1d(&ctx, &input, &layer).unwrap_err().is_configuration());
    let single_output = random_conv_layer(&mut rng, 1, 1, 2, 1, 0);
    let result = hom_conv1d(&ctx, &input, &single_output).unwrap();
    let expected = reference::conv1d(&[vec![1., 2., 3., 4.]], &single_output);
    assert_close(&expected[0], &ctx.decrypt(&result).unwrap().channel(0), 1e-4);
}
