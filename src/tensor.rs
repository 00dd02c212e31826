use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::scheme::CkksScheme;

///
/// Describes how a tensor of `channels` channels with `size` elements each is
/// packed into the slots of one or more ciphertexts ("lanes").
///
/// Channels are distributed evenly over the lanes, lane `l` holding channels
/// `l * channels_per_lane, ..., (l + 1) * channels_per_lane - 1`. Within a lane,
/// the `j`-th channel occupies the block of `space` slots starting at `j * space`,
/// and its `p`-th element is in slot `j * space + p * interval`. The whole group of
/// channels of a lane may be present `replication` times, at offsets that are multiples
/// of `channels_per_lane * space`.
///
/// Slot values are scaled down by the public factor `scale_correction`, i.e. the logical
/// value is the decrypted slot value times `scale_correction`.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub size: usize,
    pub interval: usize,
    pub space: usize,
    pub channels: usize,
    pub replication: usize,
    pub scale_correction: f64
}

impl Layout {

    ///
    /// Layout of `channels` channels of `size` consecutive elements each.
    ///
    pub fn dense(size: usize, channels: usize) -> Self {
        Self {
            size: size,
            interval: 1,
            space: size.max(1).next_power_of_two(),
            channels: channels,
            replication: 1,
            scale_correction: 1.
        }
    }

    pub fn channels_per_lane(&self, lanes: usize) -> usize {
        self.channels / lanes
    }

    ///
    /// Width of the block holding all channels of one lane once.
    ///
    pub fn lane_span(&self, lanes: usize) -> usize {
        self.channels_per_lane(lanes) * self.space
    }

    ///
    /// Returns the lane and slot holding the `position`-th element of `channel`
    /// (the first copy, if replicated).
    ///
    pub fn slot_of(&self, lanes: usize, channel: usize, position: usize) -> (usize, usize) {
        let per_lane = self.channels_per_lane(lanes);
        (channel / per_lane, (channel % per_lane) * self.space + position * self.interval)
    }

    pub fn check(&self, lanes: usize, slots: usize) -> Result<()> {
        if lanes == 0 || self.channels == 0 || self.size == 0 {
            return Err(HEError::configuration(format!("tensor must be nonempty, got {} lanes, {} channels of size {}", lanes, self.channels, self.size)));
        }
        if !self.space.is_power_of_two() {
            return Err(HEError::configuration(format!("space must be a power of two, got {}", self.space)));
        }
        if self.interval == 0 || self.size * self.interval > self.space {
            return Err(HEError::configuration(format!("{} elements with interval {} do not fit into space {}", self.size, self.interval, self.space)));
        }
        if self.channels % lanes != 0 {
            return Err(HEError::configuration(format!("{} channels cannot be evenly distributed over {} lanes", self.channels, lanes)));
        }
        if self.lane_span(lanes) > slots {
            return Err(HEError::configuration(format!("{} channels of space {} per lane exceed the slot count {}", self.channels_per_lane(lanes), self.space, slots)));
        }
        if self.replication == 0 || self.replication * self.lane_span(lanes) > slots {
            return Err(HEError::configuration(format!("replication {} of a block of {} slots exceeds the slot count {}", self.replication, self.lane_span(lanes), slots)));
        }
        return Ok(());
    }

    ///
    /// A slot vector that is `value` at every element position of every block of width
    /// `space` and zero in between, i.e. the indicator of the positions that can carry
    /// data in this layout.
    ///
    pub fn constant_at_elements(&self, value: f64, slots: usize) -> Vec<f64> {
        let mut block = vec![0.; self.space];
        for p in 0..self.size {
            block[p * self.interval] = value;
        }
        return repeat_to_slots(&block, slots);
    }
}

///
/// Repeats `block` as often as it fits into `slots` entries, and pads the rest with zeros.
///
pub fn repeat_to_slots(block: &[f64], slots: usize) -> Vec<f64> {
    let mut result = Vec::with_capacity(slots);
    if !block.is_empty() {
        for _ in 0..(slots / block.len()) {
            result.extend_from_slice(block);
        }
    }
    result.resize(slots, 0.);
    return result;
}

///
/// A tensor in the clear, with one slot vector per lane.
///
#[derive(Clone, Debug, PartialEq)]
pub struct PlainTensor {
    data: Vec<Vec<f64>>,
    layout: Layout
}

impl PlainTensor {

    ///
    /// Creates a tensor with one channel per row, each channel in its own lane.
    /// Shorter rows are padded with zeros.
    ///
    pub fn new(rows: Vec<Vec<f64>>) -> Result<Self> {
        let size = rows.iter().map(|row| row.len()).max().unwrap_or(0);
        let layout = Layout::dense(size, rows.len());
        let data = rows.into_iter().map(|mut row| {
            row.resize(layout.space, 0.);
            row
        }).collect::<Vec<_>>();
        return Self::with_layout(data, layout);
    }

    pub fn with_layout(data: Vec<Vec<f64>>, layout: Layout) -> Result<Self> {
        let max_len = data.iter().map(|lane| lane.len()).max().unwrap_or(0);
        layout.check(data.len(), max_len.max(layout.lane_span(data.len().max(1))))?;
        Ok(Self { data: data, layout: layout })
    }

    pub fn lanes(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[Vec<f64>] {
        &self.data
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    ///
    /// Returns the logical values of `channel`, with the scale correction applied.
    ///
    pub fn channel(&self, channel: usize) -> Vec<f64> {
        (0..self.layout.size).map(|p| {
            let (lane, slot) = self.layout.slot_of(self.lanes(), channel, p);
            self.data[lane].get(slot).copied().unwrap_or(0.) * self.layout.scale_correction
        }).collect()
    }

    pub fn to_channels(&self) -> Vec<Vec<f64>> {
        (0..self.layout.channels).map(|c| self.channel(c)).collect()
    }
}

///
/// A tensor encrypted as one ciphertext per lane, arranged according to its [`Layout`].
///
pub struct EncryptedTensor<S: CkksScheme> {
    data: Vec<S::Ciphertext>,
    layout: Layout
}

impl<S: CkksScheme> Clone for EncryptedTensor<S> {

    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            layout: self.layout.clone()
        }
    }
}

impl<S: CkksScheme> std::fmt::Debug for EncryptedTensor<S> {

    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedTensor")
            .field("lanes", &self.data.len())
            .field("layout", &self.layout)
            .finish()
    }
}

impl<S: CkksScheme> EncryptedTensor<S> {

    ///
    /// Assembles a tensor from ciphertexts, which is only valid if `data` actually has
    /// the given layout.
    ///
    pub fn new(data: Vec<S::Ciphertext>, layout: Layout, slots: usize) -> Result<Self> {
        layout.check(data.len(), slots)?;
        Ok(Self::from_parts(data, layout))
    }

    pub(crate) fn from_parts(data: Vec<S::Ciphertext>, layout: Layout) -> Self {
        Self { data: data, layout: layout }
    }

    pub fn lanes(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[S::Ciphertext] {
        &self.data
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn channels_per_lane(&self) -> usize {
        self.layout.channels_per_lane(self.lanes())
    }

    pub fn into_parts(self) -> (Vec<S::Ciphertext>, Layout) {
        (self.data, self.layout)
    }
}

#[test]
fn test_dense_layout() {
    let tensor = PlainTensor::new(vec![vec![1., 2., 3.], vec![4., 5.]]).unwrap();
    assert_eq!(2, tensor.lanes());
    assert_eq!(3, tensor.layout().size);
    assert_eq!(4, tensor.layout().space);
    assert_eq!(2, tensor.layout().channels);
    assert_eq!(vec![4., 5., 0., 0.], tensor.data()[1]);
    assert_eq!(vec![vec![1., 2., 3.], vec![4., 5., 0.]], tensor.to_channels());
}

#[test]
fn test_empty_tensor_rejected() {
    assert!(PlainTensor::new(Vec::new()).unwrap_err().is_configuration());
    assert!(PlainTensor::new(vec![Vec::new()]).unwrap_err().is_configuration());
}

#[test]
fn test_channel_extraction_with_layout() {
    // two lanes with two channels each, size 2, interval 2, space 4, corrected by 2
    let layout = Layout { size: 2, interval: 2, space: 4, channels: 4, replication: 1, scale_correction: 2. };
    let data = vec![
        vec![1., 0., 2., 0., 3., 0., 4., 0.],
        vec![5., 0., 6., 0., 7., 0., 8., 0.]
    ];
    let tensor = PlainTensor::with_layout(data, layout).unwrap();
    assert_eq!(vec![vec![2., 4.], vec![6., 8.], vec![10., 12.], vec![14., 16.]], tensor.to_channels());
    assert_eq!((1, 6), tensor.layout().slot_of(2, 3, 1));
}

#[test]
fn test_layout_check() {
    assert!(Layout::dense(5, 2).check(2, 8).is_ok());
    assert!(Layout::dense(5, 3).check(2, 8).is_err());
    assert!(Layout::dense(9, 1).check(1, 8).is_err());
    let layout = Layout { size: 3, interval: 2, space: 8, channels: 2, replication: 4, scale_correction: 1. };
    assert!(layout.check(1, 64).is_ok());
    assert!(layout.check(1, 32).is_err());
    assert!(Layout { space: 6, ..layout.clone() }.check(1, 64).is_err());
    assert!(Layout { interval: 3, ..layout }.check(1, 64).is_err());
}

#[test]
fn test_constant_at_elements() {
    let layout = Layout { size: 2, interval: 2, space: 4, channels: 1, replication: 1, scale_correction: 1. };
    assert_eq!(vec![3., 0., 3., 0., 3., 0., 3., 0., 0., 0.], layout.constant_at_elements(3., 10));
}

#[test]
fn test_repeat_to_slots() {
    assert_eq!(vec![1., 2., 1., 2., 0.], repeat_to_slots(&[1., 2.], 5));
    assert_eq!(vec![0., 0.], repeat_to_slots(&[1., 2., 3.], 2));
}
