use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::*;
use crate::layers::activation::hom_approx_swish;
use crate::layers::conv::{hom_conv1d, ConvGeometry};
use crate::layers::fc::hom_fully_connected;
use crate::layers::flatten::hom_flatten;
use crate::profiling::log_time;
use crate::reference::{self, PlainValue};
use crate::scheme::CkksScheme;
use crate::tensor::EncryptedTensor;

///
/// A one-dimensional convolution with weights `weight[out][in][k]`.
///
/// Deserialization goes through [`Conv1DLayer::new()`], and the declared channel
/// counts and kernel size must match the shape of `weight`.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Conv1DLayerData")]
pub struct Conv1DLayer {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub weight: Vec<Vec<Vec<f64>>>,
    pub bias: Vec<f64>
}

impl Conv1DLayer {

    pub fn new(weight: Vec<Vec<Vec<f64>>>, bias: Vec<f64>, stride: usize, padding: usize) -> Result<Self> {
        let out_channels = weight.len();
        let in_channels = weight.first().map(|w| w.len()).unwrap_or(0);
        let kernel_size = weight.first().and_then(|w| w.first()).map(|w| w.len()).unwrap_or(0);
        if out_channels == 0 || in_channels == 0 || kernel_size == 0 {
            return Err(HEError::configuration("convolution weights must be nonempty"));
        }
        if weight.iter().any(|w| w.len() != in_channels || w.iter().any(|k| k.len() != kernel_size)) {
            return Err(HEError::configuration(format!("convolution weights must have shape [{}][{}][{}]", out_channels, in_channels, kernel_size)));
        }
        if bias.len() != out_channels {
            return Err(HEError::configuration(format!("got {} biases for {} output channels", bias.len(), out_channels)));
        }
        if stride == 0 {
            return Err(HEError::configuration("stride must be positive"));
        }
        Ok(Self {
            in_channels: in_channels,
            out_channels: out_channels,
            kernel_size: kernel_size,
            stride: stride,
            padding: padding,
            weight: weight,
            bias: bias
        })
    }
}

#[derive(Deserialize)]
struct Conv1DLayerData {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    weight: Vec<Vec<Vec<f64>>>,
    bias: Vec<f64>
}

impl TryFrom<Conv1DLayerData> for Conv1DLayer {
    type Error = HEError;

    fn try_from(data: Conv1DLayerData) -> Result<Self> {
        let layer = Conv1DLayer::new(data.weight, data.bias, data.stride, data.padding)?;
        if (layer.in_channels, layer.out_channels, layer.kernel_size) != (data.in_channels, data.out_channels, data.kernel_size) {
            return Err(HEError::configuration(format!(
                "convolution declared as {}x{}x{}, but weights have shape [{}][{}][{}]",
                data.out_channels, data.in_channels, data.kernel_size, layer.out_channels, layer.in_channels, layer.kernel_size
            )));
        }
        return Ok(layer);
    }
}

///
/// A dense layer with weights `weight[out][in]`.
///
/// As for [`Conv1DLayer`], deserialization validates the layer.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FCLayerData")]
pub struct FCLayer {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Vec<Vec<f64>>,
    pub bias: Vec<f64>
}

impl FCLayer {

    pub fn new(weight: Vec<Vec<f64>>, bias: Vec<f64>) -> Result<Self> {
        let out_features = weight.len();
        let in_features = weight.first().map(|w| w.len()).unwrap_or(0);
        if out_features == 0 || in_features == 0 {
            return Err(HEError::configuration("dense weights must be nonempty"));
        }
        if weight.iter().any(|w| w.len() != in_features) {
            return Err(HEError::configuration(format!("dense weights must have shape [{}][{}]", out_features, in_features)));
        }
        if bias.len() != out_features {
            return Err(HEError::configuration(format!("got {} biases for {} output features", bias.len(), out_features)));
        }
        Ok(Self {
            in_features: in_features,
            out_features: out_features,
            weight: weight,
            bias: bias
        })
    }
}

#[derive(Deserialize)]
struct FCLayerData {
    in_features: usize,
    out_features: usize,
    weight: Vec<Vec<f64>>,
    bias: Vec<f64>
}

impl TryFrom<FCLayerData> for FCLayer {
    type Error = HEError;

    fn try_from(data: FCLayerData) -> Result<Self> {
        let layer = FCLayer::new(data.weight, data.bias)?;
        if (layer.in_features, layer.out_features) != (data.in_features, data.out_features) {
            return Err(HEError::configuration(format!(
                "dense layer declared as {}x{}, but weights have shape [{}][{}]",
                data.out_features, data.in_features, layer.out_features, layer.in_features
            )));
        }
        return Ok(layer);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Conv1D(Conv1DLayer),
    FullyConnected(FCLayer),
    ApproxSwish,
    Flatten
}

impl Layer {

    pub fn name(&self) -> &'static str {
        match self {
            Layer::Conv1D(_) => "conv1d",
            Layer::FullyConnected(_) => "fully_connected",
            Layer::ApproxSwish => "approx_swish",
            Layer::Flatten => "flatten"
        }
    }

    ///
    /// Number of rescalings the encrypted evaluation of this layer performs.
    ///
    pub fn multiplicative_depth(&self) -> usize {
        match self {
            Layer::ApproxSwish => 2,
            _ => 1
        }
    }

    pub fn evaluate_plain(&self, input: &PlainValue) -> Result<PlainValue> {
        match self {
            Layer::Conv1D(conv) => {
                let channels = input.as_matrix()?;
                if channels.len() != conv.in_channels {
                    return Err(HEError::configuration(format!("convolution expects {} input channels, got {}", conv.in_channels, channels.len())));
                }
                let len = channels[0].len();
                if channels.iter().any(|c| c.len() != len) || len + 2 * conv.padding < conv.kernel_size {
                    return Err(HEError::configuration("convolution input channels must have equal length of at least the kernel size"));
                }
                Ok(PlainValue::Matrix(reference::conv1d(channels, conv)))
            },
            Layer::FullyConnected(fc) => {
                let features = input.as_vector()?;
                if features.len() != fc.in_features {
                    return Err(HEError::configuration(format!("fully connected layer expects {} features, got {}", fc.in_features, features.len())));
                }
                Ok(PlainValue::Vector(reference::fully_connected(features, fc)))
            },
            Layer::ApproxSwish => Ok(reference::approx_swish(input)),
            Layer::Flatten => Ok(PlainValue::Vector(reference::flatten(input.as_matrix()?)))
        }
    }

    pub fn evaluate_encrypted<S: CkksScheme>(&self, ctx: &Context<S>, input: &EncryptedTensor<S>) -> Result<EncryptedTensor<S>> {
        match self {
            Layer::Conv1D(conv) => hom_conv1d(ctx, input, conv),
            Layer::FullyConnected(fc) => hom_fully_connected(ctx, input, fc),
            Layer::ApproxSwish => hom_approx_swish(ctx, input),
            Layer::Flatten => hom_flatten(ctx, input)
        }
    }
}

///
/// Wall-clock time and number of rotations of one step of an encrypted forward pass.
///
#[derive(Clone, Debug, PartialEq)]
pub struct StepTiming {
    pub name: String,
    pub duration: Duration,
    pub rotations: usize
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForwardTimings {
    pub steps: Vec<StepTiming>
}

impl ForwardTimings {

    pub fn total(&self) -> Duration {
        self.steps.iter().map(|step| step.duration).sum()
    }

    pub fn total_rotations(&self) -> usize {
        self.steps.iter().map(|step| step.rotations).sum()
    }
}

///
/// The tensors of a PyTorch state dictionary of the fraud-detection network,
/// exported as JSON.
///
#[derive(Deserialize)]
struct StateDict {
    #[serde(rename = "conv1.weight")]
    conv1_weight: Vec<Vec<Vec<f64>>>,
    #[serde(rename = "conv1.bias")]
    conv1_bias: Vec<f64>,
    #[serde(rename = "conv2.weight")]
    conv2_weight: Vec<Vec<Vec<f64>>>,
    #[serde(rename = "conv2.bias")]
    conv2_bias: Vec<f64>,
    #[serde(rename = "fc1.weight")]
    fc1_weight: Vec<Vec<f64>>,
    #[serde(rename = "fc1.bias")]
    fc1_bias: Vec<f64>,
    #[serde(rename = "fc2.weight")]
    fc2_weight: Vec<Vec<f64>>,
    #[serde(rename = "fc2.bias")]
    fc2_bias: Vec<f64>
}

///
/// A sequence of layers, evaluated one after the other.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    layers: Vec<Layer>
}

impl Model {

    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers: layers }
    }

    ///
    /// The fraud-detection network `conv -> swish -> conv -> swish -> flatten -> fc -> swish -> fc`.
    ///
    pub fn ccfd(conv1: Conv1DLayer, conv2: Conv1DLayer, fc1: FCLayer, fc2: FCLayer) -> Self {
        Self::new(vec![
            Layer::Conv1D(conv1),
            Layer::ApproxSwish,
            Layer::Conv1D(conv2),
            Layer::ApproxSwish,
            Layer::Flatten,
            Layer::FullyConnected(fc1),
            Layer::ApproxSwish,
            Layer::FullyConnected(fc2)
        ])
    }

    ///
    /// Reads the fraud-detection network from a JSON state dictionary with keys `conv1.weight`,
    /// `conv1.bias`, ..., `fc2.bias`. Both convolutions use stride 1 and no padding.
    ///
    pub fn from_state_dict_reader<R: Read>(reader: R) -> Result<Self> {
        let state: StateDict = serde_json::from_reader(reader)?;
        Ok(Self::ccfd(
            Conv1DLayer::new(state.conv1_weight, state.conv1_bias, 1, 0)?,
            Conv1DLayer::new(state.conv2_weight, state.conv2_bias, 1, 0)?,
            FCLayer::new(state.fc1_weight, state.fc1_bias)?,
            FCLayer::new(state.fc2_weight, state.fc2_bias)?
        ))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_state_dict_reader(BufReader::new(file))
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    ///
    /// Number of levels an encrypted forward pass consumes.
    ///
    pub fn multiplicative_depth(&self) -> usize {
        self.layers.iter().map(Layer::multiplicative_depth).sum()
    }

    pub fn forward_plain(&self, input: &PlainValue) -> Result<PlainValue> {
        let mut current = input.clone();
        for layer in &self.layers {
            current = layer.evaluate_plain(&current)?;
        }
        return Ok(current);
    }

    ///
    /// Evaluates the model on an encrypted input, which is replicated over the slots
    /// whenever a convolution requires it.
    ///
    /// Each step is timed and reports the number of rotations it performed. Since the
    /// rotation counter belongs to the context, these numbers include rotations of other
    /// forward passes running concurrently on the same context.
    ///
    pub fn forward_encrypted<S: CkksScheme>(&self, ctx: &Context<S>, input: &EncryptedTensor<S>) -> Result<(EncryptedTensor<S>, ForwardTimings)> {
        let mut timings = ForwardTimings::default();
        let mut current = input.clone();
        for layer in &self.layers {
            if let Layer::Conv1D(conv) = layer {
                let geometry = ConvGeometry::new(current.layout(), current.lanes(), conv, ctx.slots())?;
                if current.layout().replication < geometry.required_replication() {
                    current = timed_step(ctx, "fill", &mut timings, || ctx.fill(&current))?;
                }
            }
            current = timed_step(ctx, layer.name(), &mut timings, || layer.evaluate_encrypted(ctx, &current))?;
        }
        return Ok((current, timings));
    }
}

fn timed_step<S, F>(ctx: &Context<S>, name: &str, timings: &mut ForwardTimings, step: F) -> Result<EncryptedTensor<S>>
    where S: CkksScheme,
        F: FnOnce() -> Result<EncryptedTensor<S>>
{
    let ((result, rotations), duration) = log_time::<_, _, true, 1>(name, |[rotations]| {
        let before = ctx.rotation_count();
        let result = step();
        *rotations = ctx.rotation_count() - before;
        (result, *rotations)
    });
    timings.steps.push(StepTiming { name: name.to_owned(), duration: duration, rotations: rotations });
    return result;
}

pub fn sigmoid(x: f64) -> f64 {
    reference::sigmoid(x)
}

///
/// Whether a transaction with the given output logit is classified as fraudulent.
///
pub fn classify(logit: f64) -> bool {
    sigmoid(logit) > 0.5
}

#[cfg(test)]
fn random_weight(rng: &mut oorandom::Rand64) -> f64 {
    rng.rand_float() - 0.5
}

#[cfg(test)]
pub(crate) fn random_conv_layer(rng: &mut oorandom::Rand64, in_channels: usize, out_channels: usize, kernel_size: usize, stride: usize, padding: usize) -> Conv1DLayer {
    let weight = (0..out_channels).map(|_| (0..in_channels).map(|_| (0..kernel_size).map(|_| random_weight(rng)).collect()).collect()).collect();
    let bias = (0..out_channels).map(|_| random_weight(rng)).collect();
    Conv1DLayer::new(weight, bias, stride, padding).unwrap()
}

#[cfg(test)]
pub(crate) fn random_fc_layer(rng: &mut oorandom::Rand64, in_features: usize, out_features: usize) -> FCLayer {
    let weight = (0..out_features).map(|_| (0..in_features).map(|_| random_weight(rng)).collect()).collect();
    let bias = (0..out_features).map(|_| random_weight(rng)).collect();
    FCLayer::new(weight, bias).unwrap()
}

#[cfg(test)]
use crate::context::{assert_close, test_context};
#[cfg(test)]
use crate::tensor::PlainTensor;
#[cfg(test)]
use crate::scheme::LeveledCiphertext;

#[cfg(test)]
fn small_ccfd_model(rng: &mut oorandom::Rand64) -> Model {
    Model::ccfd(
        random_conv_layer(rng, 1, 4, 2, 1, 0),
        random_conv_layer(rng, 4, 8, 2, 1, 0),
        random_fc_layer(rng, 96, 8),
        random_fc_layer(rng, 8, 1)
    )
}

#[test]
fn test_layer_shape_validation() {
    assert!(Conv1DLayer::new(vec![vec![vec![1., 2.], vec![1.]]], vec![0.], 1, 0).unwrap_err().is_configuration());
    assert!(Conv1DLayer::new(vec![vec![vec![1., 2.]]], vec![0., 1.], 1, 0).unwrap_err().is_configuration());
    assert!(Conv1DLayer::new(vec![vec![vec![1., 2.]]], vec![0.], 0, 0).unwrap_err().is_configuration());
    assert!(FCLayer::new(vec![vec![1., 2.], vec![3.]], vec![0., 0.]).unwrap_err().is_configuration());
    assert!(FCLayer::new(Vec::new(), Vec::new()).unwrap_err().is_configuration());
    let conv = Conv1DLayer::new(vec![vec![vec![1., 2.]]; 3], vec![0.; 3], 1, 0).unwrap();
    assert_eq!((1, 3, 2), (conv.in_channels, conv.out_channels, conv.kernel_size));
}

#[test]
fn test_multiplicative_depth() {
    let mut rng = oorandom::Rand64::new(1);
    assert_eq!(11, small_ccfd_model(&mut rng).multiplicative_depth());
    assert_eq!(0, Model::new(Vec::new()).multiplicative_depth());
}

#[test]
fn test_forward_plain_checks_shapes() {
    let mut rng = oorandom::Rand64::new(2);
    let model = small_ccfd_model(&mut rng);
    assert!(model.forward_plain(&PlainValue::Vector(vec![1.; 14])).unwrap_err().is_configuration());
    assert!(model.forward_plain(&PlainValue::Matrix(vec![vec![1.; 14]; 2])).unwrap_err().is_configuration());
    let result = model.forward_plain(&PlainValue::Matrix(vec![vec![0.5; 14]])).unwrap();
    assert_eq!(1, result.as_vector().unwrap().len());
}

#[test]
fn test_forward_encrypted() {
    let mut rng = oorandom::Rand64::new(3);
    let model = small_ccfd_model(&mut rng);
    let ctx = test_context(model.multiplicative_depth());
    let features = (0..14).map(|i| ((i as f64) * 0.7).sin()).collect::<Vec<_>>();

    let expected = model.forward_plain(&PlainValue::Matrix(vec![features.clone()])).unwrap();
    let expected = expected.as_vector().unwrap();

    let input = ctx.encrypt(&PlainTensor::new(vec![features]).unwrap()).unwrap();
    let (result, timings) = model.forward_encrypted(&ctx, &input).unwrap();
    assert_eq!(0, result.data()[0].level());
    assert_eq!(1, result.layout().size);
    let actual = ctx.decrypt(&result).unwrap().channel(0);
    assert_close(expected, &actual, 1e-3 * expected[0].abs().max(1.));
    assert_eq!(classify(expected[0]), classify(actual[0]));

    let names = timings.steps.iter().map(|step| step.name.as_str()).collect::<Vec<_>>();
    assert_eq!(vec!["fill", "conv1d", "approx_swish", "conv1d", "approx_swish", "flatten", "fully_connected", "approx_swish", "fully_connected"], names);
    assert!(timings.steps[0].rotations > 0);
    assert_eq!(0, timings.steps[2].rotations);
    assert_eq!(ctx.rotation_count(), timings.total_rotations());
}

#[test]
fn test_forward_encrypted_insufficient_depth() {
    let mut rng = oorandom::Rand64::new(4);
    let model = small_ccfd_model(&mut rng);
    let ctx = test_context(model.multiplicative_depth() - 1);
    let input = ctx.encrypt(&PlainTensor::new(vec![vec![0.25; 14]]).unwrap()).unwrap();
    assert!(model.forward_encrypted(&ctx, &input).unwrap_err().is_primitive());
}

#[test]
fn test_load_state_dict() {
    let json = serde_json::json!({
        "conv1.weight": [[[0.5, -0.5]], [[1.0, 0.0]]],
        "conv1.bias": [0.0, 0.1],
        "conv2.weight": [[[1.0, 1.0], [0.5, 0.5]]],
        "conv2.bias": [0.2],
        "fc1.weight": [[1.0, 2.0, 3.0], [0.0, 1.0, 0.0]],
        "fc1.bias": [0.0, -1.0],
        "fc2.weight": [[1.0, -1.0]],
        "fc2.bias": [0.5]
    });
    let model = Model::from_state_dict_reader(json.to_string().as_bytes()).unwrap();
    assert_eq!(8, model.layers().len());
    match &model.layers()[2] {
        Layer::Conv1D(conv) => assert_eq!((2, 1, 2, 1, 0), (conv.in_channels, conv.out_channels, conv.kernel_size, conv.stride, conv.padding)),
        _ => panic!("expected a convolution")
    }
    let result = model.forward_plain(&PlainValue::Matrix(vec![vec![1., 2., 3., 4., 5.]])).unwrap();
    assert_eq!(1, result.as_vector().unwrap().len());

    assert!(matches!(Model::from_state_dict_reader("{ \"conv1.weight\": ".as_bytes()), Err(HEError::ModelFormat(_))));
    assert!(matches!(Model::load("/nonexistent/model.json"), Err(HEError::Io(_))));
}

#[test]
fn test_model_json_roundtrip() {
    let mut rng = oorandom::Rand64::new(5);
    let model = small_ccfd_model(&mut rng);
    let serialized = serde_json::to_string(&model).unwrap();
    let deserialized = serde_json::from_str::<Model>(&serialized).unwrap();
    assert_eq!(model.layers().len(), deserialized.layers().len());
    assert_eq!(model.multiplicative_depth(), deserialized.multiplicative_depth());
    match (&model.layers()[5], &deserialized.layers()[5]) {
        (Layer::FullyConnected(expected), Layer::FullyConnected(actual)) => {
            assert_eq!((96, 8), (actual.in_features, actual.out_features));
            for (e, a) in expected.weight.iter().zip(actual.weight.iter()) {
                assert_close(e, a, 1e-12);
            }
        },
        _ => panic!("expected a fully connected layer")
    }
}

#[test]
fn test_deserialize_validates_layers() {
    let conv = serde_json::json!({"Conv1D": {
        "in_channels": 1, "out_channels": 1, "kernel_size": 2, "stride": 1, "padding": 0,
        "weight": [[[1.0, -1.0]]], "bias": [0.5]
    }});
    assert!(matches!(serde_json::from_value::<Layer>(conv.clone()).unwrap(), Layer::Conv1D(_)));

    let mut wrong_shape = conv.clone();
    wrong_shape["Conv1D"]["out_channels"] = serde_json::json!(2);
    assert!(serde_json::from_value::<Layer>(wrong_shape).is_err());
    let mut zero_stride = conv.clone();
    zero_stride["Conv1D"]["stride"] = serde_json::json!(0);
    assert!(serde_json::from_value::<Layer>(zero_stride).is_err());
    let mut missing_bias = conv;
    missing_bias["Conv1D"]["bias"] = serde_json::json!([]);
    assert!(serde_json::from_value::<Layer>(missing_bias).is_err());

    let fc = serde_json::json!({"FullyConnected": {
        "in_features": 2, "out_features": 1, "weight": [[1.0, 2.0]], "bias": [0.0]
    }});
    assert!(matches!(serde_json::from_value::<Layer>(fc.clone()).unwrap(), Layer::FullyConnected(_)));
    let mut empty = fc.clone();
    empty["FullyConnected"]["weight"] = serde_json::json!([]);
    empty["FullyConnected"]["out_features"] = serde_json::json!(0);
    assert!(serde_json::from_value::<Layer>(empty).is_err());
    let mut ragged = fc;
    ragged["FullyConnected"]["in_features"] = serde_json::json!(3);
    assert!(serde_json::from_value::<Layer>(ragged).is_err());

    let model = serde_json::json!({"layers": [{"Conv1D": {
        "in_channels": 1, "out_channels": 2, "kernel_size": 3, "stride": 1, "padding": 0,
        "weight": [[[1.0]]], "bias": [0.0]
    }}]});
    assert!(serde_json::from_value::<Model>(model).is_err());
}

#[test]
#[ignore]
fn time_forward_encrypted_ccfd() {
    use tracing_subscriber::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use crate::context::ContextOptions;
    use crate::scheme::CkksParams;
    use crate::scheme::simulated::SimulatedCkks;

    let (chrome_layer, _guard) = tracing_chrome::ChromeLayerBuilder::new().build();
    tracing_subscriber::registry().with(chrome_layer).init();

    let mut rng = oorandom::Rand64::new(6);
    let model = Model::ccfd(
        random_conv_layer(&mut rng, 1, 32, 2, 1, 0),
        random_conv_layer(&mut rng, 32, 64, 2, 1, 0),
        random_fc_layer(&mut rng, 1792, 64),
        random_fc_layer(&mut rng, 64, 1)
    );
    let params = CkksParams::leveled(13, model.multiplicative_depth(), 35, vec![60]);
    let ctx = Context::new_with(SimulatedCkks::new(params).unwrap(), ContextOptions::default(), &mut StdRng::from_seed([1; 32])).unwrap();
    let features = (0..30).map(|i| ((i as f64) * 0.3).cos()).collect::<Vec<_>>();
    let input = ctx.encrypt(&PlainTensor::new(vec![features]).unwrap()).unwrap();
    let (_, timings) = model.forward_encrypted(&ctx, &input).unwrap();
    for step in &timings.steps {
        tracing::info!(step = %step.name, millis = step.duration.as_millis() as u64, rotations = step.rotations, "forward step");
    }
    tracing::info!(millis = timings.total().as_millis() as u64, rotations = timings.total_rotations(), "forward pass");
}
