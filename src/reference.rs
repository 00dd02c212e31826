use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::layers::activation;
use crate::model::{Conv1DLayer, FCLayer};

///
/// Intermediate value of the plaintext forward pass: either one feature vector
/// or a list of channels.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlainValue {
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>)
}

impl PlainValue {

    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> PlainValue {
        match self {
            PlainValue::Vector(values) => PlainValue::Vector(values.iter().map(|x| f(*x)).collect()),
            PlainValue::Matrix(rows) => PlainValue::Matrix(rows.iter().map(|row| row.iter().map(|x| f(*x)).collect()).collect())
        }
    }

    pub fn as_vector(&self) -> Result<&[f64]> {
        match self {
            PlainValue::Vector(values) => Ok(values),
            PlainValue::Matrix(_) => Err(HEError::configuration("expected a vector, got a matrix"))
        }
    }

    pub fn as_matrix(&self) -> Result<&[Vec<f64>]> {
        match self {
            PlainValue::Matrix(rows) => Ok(rows),
            PlainValue::Vector(_) => Err(HEError::configuration("expected a matrix, got a vector"))
        }
    }
}

///
/// Plain convolution with zero-padding; `data[c]` is the `c`-th input channel.
///
pub fn conv1d(data: &[Vec<f64>], layer: &Conv1DLayer) -> Vec<Vec<f64>> {
    let len = data.first().map(|row| row.len()).unwrap_or(0);
    let out_len = (len + 2 * layer.padding - layer.kernel_size) / layer.stride + 1;
    (0..layer.out_channels).map(|o| (0..out_len).map(|p| {
        let mut sum = layer.bias[o];
        for i in 0..layer.in_channels {
            for k in 0..layer.kernel_size {
                let source = (p * layer.stride + k) as i64 - layer.padding as i64;
                if source >= 0 && (source as usize) < data[i].len() {
                    sum += data[i][source as usize] * layer.weight[o][i][k];
                }
            }
        }
        sum
    }).collect()).collect()
}

pub fn fully_connected(data: &[f64], layer: &FCLayer) -> Vec<f64> {
    layer.weight.iter().zip(layer.bias.iter())
        .map(|(row, bias)| bias + row.iter().zip(data.iter()).map(|(w, x)| w * x).sum::<f64>())
        .collect()
}

pub fn flatten(data: &[Vec<f64>]) -> Vec<f64> {
    data.iter().flat_map(|row| row.iter().copied()).collect()
}

pub fn approx_swish(value: &PlainValue) -> PlainValue {
    value.map(activation::approx_swish)
}

pub fn sigmoid(x: f64) -> f64 {
    1. / (1. + (-x).exp())
}

#[test]
fn test_conv1d_padding() {
    let layer = Conv1DLayer::new(vec![vec![vec![1., 10., 100.]]], vec![0.5], 1, 1).unwrap();
    let result = conv1d(&[vec![1., 2., 3.]], &layer);
    assert_eq!(vec![vec![10. + 200. + 0.5, 1. + 20. + 300. + 0.5, 2. + 30. + 0.5]], result);
}

#[test]
fn test_fully_connected_and_flatten() {
    let layer = FCLayer::new(vec![vec![1., 2., 3., 4.], vec![0., -1., 0., 1.]], vec![1., 0.]).unwrap();
    let input = flatten(&[vec![1., 1.], vec![2., 0.5]]);
    assert_eq!(vec![1., 1., 2., 0.5], input);
    assert_eq!(vec![1. + 1. + 2. + 6. + 2., -1. + 0.5], fully_connected(&input, &layer));
}

#[test]
fn test_plain_value() {
    let value = PlainValue::Matrix(vec![vec![1., 2.], vec![3., 4.]]);
    assert!(value.as_vector().unwrap_err().is_configuration());
    assert_eq!(PlainValue::Matrix(vec![vec![2., 4.], vec![6., 8.]]), value.map(|x| 2. * x));
    assert_eq!(0.5, sigmoid(0.));
}
