use rayon::prelude::*;
use tracing::instrument;

use crate::error::*;
use crate::scheme::*;
use crate::tensor::*;

use super::Context;

impl<S: CkksScheme> Context<S> {

    ///
    /// Rotates the slots of `ct` left by `k`, i.e. slot `i` of the result is slot
    /// `i + k` of `ct`, as a sequence of rotations by generators.
    ///
    pub fn rotate(&self, ct: &S::Ciphertext, k: i64) -> Result<S::Ciphertext> {
        record_time!("Context::rotate", || -> Result<S::Ciphertext> {
            let plan = self.planner().plan(k);
            let mut evaluator = self.evaluator()?;
            let mut result = ct.clone();
            for step in &plan {
                evaluator.rotate_assign(&mut result, *step)?;
            }
            self.record_rotations(plan.iter().filter(|step| **step != 0).count());
            return Ok(result);
        })
    }

    ///
    /// Sums all given ciphertexts, skipping `None` entries. Fails if there is
    /// no ciphertext at all.
    ///
    /// Summation is performed in the given order, so the result does not depend
    /// on scheduling.
    ///
    pub fn add_many<'a, I>(&self, cts: I) -> Result<S::Ciphertext>
        where I: IntoIterator<Item = Option<&'a S::Ciphertext>>,
            S::Ciphertext: 'a
    {
        let mut cts = cts.into_iter().flatten().peekable();
        let level = match cts.peek() {
            Some(first) => first.level(),
            None => return Err(HEError::configuration("add_many requires at least one ciphertext"))
        };
        let mut evaluator = self.evaluator()?;
        let mut result = evaluator.zero(level);
        for ct in cts {
            evaluator.add_assign(&mut result, ct)?;
        }
        return Ok(result);
    }

    ///
    /// Computes `sum_i rot(ct, i * block_width)` for `0 <= i < blocks`, i.e. adds the
    /// `blocks` consecutive blocks of width `block_width` onto the first one.
    ///
    /// This uses rounds of at most 8 rotations, with offsets `8^j * i * block_width`.
    /// The result is exact if `blocks` is of the form `m * 8^j` for some `m < 8`, in
    /// particular for powers of two.
    ///
    pub fn fold(&self, ct: &S::Ciphertext, blocks: usize, block_width: usize) -> Result<S::Ciphertext> {
        let mut current = ct.clone();
        let mut step = 1;
        while step < blocks {
            let parts = (0..8).into_par_iter().map(|i| -> Result<_> {
                if step * i < blocks {
                    Ok(Some(self.rotate(&current, (step * i * block_width) as i64)?))
                } else {
                    Ok(None)
                }
            }).collect::<Result<Vec<_>>>()?;
            current = self.add_many(parts.iter().map(Option::as_ref))?;
            step *= 8;
        }
        return Ok(current);
    }

    ///
    /// Replicates the channel group of each lane over all slots, so that the group
    /// is present at every multiple of its width `channels_per_lane * space`.
    ///
    /// Filling a tensor that is already completely replicated returns it unchanged.
    ///
    #[instrument(skip_all)]
    pub fn fill(&self, tensor: &EncryptedTensor<S>) -> Result<EncryptedTensor<S>> {
        let slots = self.slots();
        let layout = tensor.layout();
        let span = layout.lane_span(tensor.lanes());
        if span == 0 || slots % span != 0 {
            return Err(HEError::configuration(format!("cannot replicate blocks of {} slots over {} slots", span, slots)));
        }
        let full_replication = slots / span;
        if layout.replication == full_replication {
            return Ok(tensor.clone());
        }
        if layout.replication != 1 {
            return Err(HEError::configuration(format!("can only fill tensors with replication 1 or {}, got {}", full_replication, layout.replication)));
        }
        tracing::debug!(span = span, replication = full_replication, "filling");

        let mut data = tensor.data().to_vec();
        let mut step = span;
        while step < slots {
            let rotated = (0..(data.len() * 8)).into_par_iter().map(|index| -> Result<_> {
                let (lane, i) = (index / 8, index % 8);
                if step * i < slots {
                    Ok(Some(self.rotate(&data[lane], (step * i) as i64)?))
                } else {
                    Ok(None)
                }
            }).collect::<Result<Vec<_>>>()?;
            data = rotated.par_chunks(8)
                .map(|parts| self.add_many(parts.iter().map(Option::as_ref)))
                .collect::<Result<Vec<_>>>()?;
            step *= 8;
        }
        return Ok(EncryptedTensor::from_parts(data, Layout { replication: full_replication, ..layout.clone() }));
    }

    ///
    /// Concatenates the first `partition_sizes[i]` elements of each lane `i` into a
    /// single dense lane, e.g. to merge the feature vectors of several data owners.
    ///
    /// Each lane is masked to its partition before it is moved into place, so elements
    /// beyond a partition do not leak into the next one. This consumes one level.
    ///
    #[instrument(skip_all)]
    pub fn pack(&self, tensor: &EncryptedTensor<S>, partition_sizes: &[usize]) -> Result<EncryptedTensor<S>> {
        let layout = tensor.layout();
        if partition_sizes.len() != tensor.lanes() {
            return Err(HEError::configuration(format!("got {} partition sizes for {} lanes", partition_sizes.len(), tensor.lanes())));
        }
        if layout.interval != 1 {
            return Err(HEError::configuration(format!("pack requires interval 1, got {}", layout.interval)));
        }
        if layout.scale_correction != 1. {
            return Err(HEError::configuration(format!("pack requires scale correction 1, got {}", layout.scale_correction)));
        }
        if layout.replication != 1 || layout.channels != tensor.lanes() {
            return Err(HEError::configuration("pack requires one unreplicated channel per lane"));
        }
        if let Some(size) = partition_sizes.iter().find(|size| **size > layout.size) {
            return Err(HEError::configuration(format!("partition of size {} exceeds the channel size {}", size, layout.size)));
        }
        let total = partition_sizes.iter().sum::<usize>();
        if total == 0 || total > self.slots() {
            return Err(HEError::configuration(format!("packed size {} must be in [1, {}]", total, self.slots())));
        }

        let offsets = partition_sizes.iter().scan(0, |offset, size| {
            let current = *offset;
            *offset += size;
            Some(current)
        }).collect::<Vec<_>>();
        let moved = tensor.data().par_iter().zip(partition_sizes.par_iter()).zip(offsets.par_iter())
            .map(|((ct, size), offset)| -> Result<_> {
                let masked = {
                    let mut evaluator = self.evaluator()?;
                    let mut masked = evaluator.mul_plain(ct, &vec![1.; *size])?;
                    evaluator.rescale(&mut masked)?;
                    masked
                };
                self.rotate(&masked, -(*offset as i64))
            })
            .collect::<Result<Vec<_>>>()?;
        let packed = self.add_many(moved.iter().map(Some))?;
        return Ok(EncryptedTensor::from_parts(vec![packed], Layout::dense(total, 1)));
    }
}

#[cfg(test)]
use crate::context::{assert_close, test_context};
#[cfg(test)]
use crate::scheme::simulated::SimulatedCkks;

#[test]
fn test_rotate() {
    let ctx = test_context(1);
    let values = (0..1024).map(|i| i as f64).collect::<Vec<_>>();
    let tensor = ctx.encrypt(&PlainTensor::new(vec![values.clone()]).unwrap()).unwrap();
    for k in [0, 1, -1, 13, 511, 512, 700, -1000, 3000] {
        let before = ctx.rotation_count();
        let rotated = ctx.rotate(&tensor.data()[0], k).unwrap();
        let expected = (0..1024).map(|i| values[(i + k).rem_euclid(1024) as usize]).collect::<Vec<_>>();
        let decrypted = ctx.decrypt(&EncryptedTensor::from_parts(vec![rotated], tensor.layout().clone())).unwrap();
        assert_close(&expected, &decrypted.data()[0], 1e-5);
        let plan = ctx.planner().plan(k);
        assert_eq!(plan.iter().filter(|s| **s != 0).count(), ctx.rotation_count() - before);
    }
}

#[test]
fn test_add_many() {
    let ctx = test_context(1);
    let a = ctx.encrypt(&PlainTensor::new(vec![vec![1., 2., 3.]]).unwrap()).unwrap();
    let b = ctx.encrypt(&PlainTensor::new(vec![vec![10., 20., 30.]]).unwrap()).unwrap();
    let layout = a.layout().clone();
    let decrypt = |ct| ctx.decrypt(&EncryptedTensor::<SimulatedCkks>::from_parts(vec![ct], layout.clone())).unwrap().channel(0);

    let single = ctx.add_many([Some(&a.data()[0])]).unwrap();
    assert_close(&[1., 2., 3.], &decrypt(single), 1e-6);

    let sum = ctx.add_many([None, Some(&a.data()[0]), None, Some(&b.data()[0]), None]).unwrap();
    assert_close(&[11., 22., 33.], &decrypt(sum), 1e-6);

    assert!(ctx.add_many(std::iter::empty()).unwrap_err().is_configuration());
    assert!(ctx.add_many([None, None]).unwrap_err().is_configuration());
}

#[test]
fn test_fold() {
    let ctx = test_context(1);
    for blocks in [2, 4, 8, 16, 64] {
        let values = (0..1024).map(|i| (i % 37) as f64).collect::<Vec<_>>();
        let tensor = ctx.encrypt(&PlainTensor::new(vec![values.clone()]).unwrap()).unwrap();
        let folded = ctx.fold(&tensor.data()[0], blocks, 4).unwrap();
        let decrypted = ctx.decrypt(&EncryptedTensor::from_parts(vec![folded], tensor.layout().clone())).unwrap();
        let expected = (0..4).map(|p| (0..blocks).map(|b| values[b * 4 + p]).sum::<f64>()).collect::<Vec<_>>();
        assert_close(&expected, &decrypted.data()[0][0..4], 1e-5);
    }
}

#[test]
fn test_fill() {
    let ctx = test_context(1);
    let tensor = ctx.encrypt(&PlainTensor::new(vec![vec![1., 2., 3.]]).unwrap()).unwrap();
    let filled = ctx.fill(&tensor).unwrap();
    assert_eq!(256, filled.layout().replication);
    let decrypted = ctx.decrypt(&filled).unwrap();
    for block in 0..256 {
        assert_close(&[1., 2., 3., 0.], &decrypted.data()[0][(block * 4)..(block * 4 + 4)], 1e-5);
    }

    let rotations = ctx.rotation_count();
    let refilled = ctx.fill(&filled).unwrap();
    assert_eq!(rotations, ctx.rotation_count());
    assert_eq!(filled.layout(), refilled.layout());
    assert_close(&decrypted.data()[0], &ctx.decrypt(&refilled).unwrap().data()[0], 0.);
}

#[test]
fn test_fill_multiple_lanes() {
    let ctx = test_context(1);
    let layout = Layout { size: 3, interval: 1, space: 4, channels: 4, replication: 1, scale_correction: 1. };
    let plain = PlainTensor::with_layout(vec![
        vec![1., 2., 3., 0., 4., 5., 6., 0.],
        vec![7., 8., 9., 0., 1., 1., 1., 0.]
    ], layout).unwrap();
    let filled = ctx.fill(&ctx.encrypt(&plain).unwrap()).unwrap();
    assert_eq!(128, filled.layout().replication);
    let decrypted = ctx.decrypt(&filled).unwrap();
    assert_close(&[1., 2., 3., 0., 4., 5., 6., 0.], &decrypted.data()[0][1016..], 1e-5);
    assert_close(&[7., 8., 9., 0., 1., 1., 1., 0.], &decrypted.data()[1][504..512], 1e-5);
}

#[test]
fn test_pack() {
    let ctx = test_context(1);
    let partitions = [5, 7, 5, 6, 7];
    let rows = partitions.iter().enumerate()
        .map(|(i, size)| (0..*size).map(|j| (i * 10 + j) as f64 / 7.).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let tensor = ctx.encrypt(&PlainTensor::new(rows.clone()).unwrap()).unwrap();
    let packed = ctx.pack(&tensor, &partitions).unwrap();
    assert_eq!(1, packed.lanes());
    assert_eq!(30, packed.layout().size);
    assert_eq!(32, packed.layout().space);
    let expected = rows.concat();
    let actual = ctx.decrypt(&packed).unwrap().channel(0);
    for (e, a) in expected.iter().zip(actual.iter()) {
        assert!((e - a).abs() <= 1e-3 * e.abs().max(1.));
    }
}

#[test]
fn test_pack_preconditions() {
    let ctx = test_context(1);
    let tensor = ctx.encrypt(&PlainTensor::new(vec![vec![1., 2.], vec![3., 4.]]).unwrap()).unwrap();
    assert!(ctx.pack(&tensor, &[2]).unwrap_err().is_configuration());
    assert!(ctx.pack(&tensor, &[2, 3]).unwrap_err().is_configuration());

    let strided = EncryptedTensor::from_parts(tensor.data().to_vec(), Layout { interval: 2, space: 4, ..tensor.layout().clone() });
    assert!(ctx.pack(&strided, &[2, 2]).unwrap_err().is_configuration());
    let corrected = EncryptedTensor::from_parts(tensor.data().to_vec(), Layout { scale_correction: 0.5, ..tensor.layout().clone() });
    assert!(ctx.pack(&corrected, &[2, 2]).unwrap_err().is_configuration());
    assert!(ctx.pack(&tensor, &[2, 2]).is_ok());
}

#[test]
fn test_pack_masks_short_partitions() {
    let ctx = test_context(1);
    let tensor = ctx.encrypt(&PlainTensor::new(vec![vec![1., 2., 3.], vec![4., 5., 6.]]).unwrap()).unwrap();
    let level = tensor.data()[0].level();
    let packed = ctx.pack(&tensor, &[2, 3]).unwrap();
    assert_eq!(5, packed.layout().size);
    assert_eq!(level - 1, packed.data()[0].level());
    let decrypted = ctx.decrypt(&packed).unwrap();
    assert_close(&[1., 2., 4., 5., 6., 0., 0., 0.], &decrypted.data()[0][0..8], 1e-5);
}

#[test]
fn test_pack_requires_level() {
    let ctx = test_context(1);
    let tensor = ctx.encrypt(&PlainTensor::new(vec![vec![1., 2.], vec![3., 4.]]).unwrap()).unwrap();
    let packed = ctx.pack(&tensor, &[2, 2]).unwrap();
    let split = EncryptedTensor::from_parts(vec![packed.data()[0].clone(), packed.data()[0].clone()], tensor.layout().clone());
    assert!(ctx.pack(&split, &[2, 2]).unwrap_err().is_primitive());
}
