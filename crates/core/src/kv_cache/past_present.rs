use candle_core::{DType, Device, Tensor};

use super::error::CacheError;
use crate::config::{layer_name, DecoderConfig};

/// Contiguous (non-paged) KV cache.
///
/// Each layer holds `past` key/value tensors of shape
/// `[batch_beam, num_kv_heads, past_len, head_size]`. After a step the
/// session's `present` outputs (same layout, one step longer) become the
/// next pasts, reordered by beam index when beam search reshuffles rows.
pub struct PastPresentCache {
    past_key_names: Vec<String>,
    past_value_names: Vec<String>,
    present_key_names: Vec<String>,
    present_value_names: Vec<String>,
    pasts: Vec<(Tensor, Tensor)>,
    batch_beam: usize,
    num_kv_heads: usize,
    head_size: usize,
    device: Device,
}

impl PastPresentCache {
    pub fn new(
        config: &DecoderConfig,
        batch_beam: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, CacheError> {
        let layers = 0..config.num_hidden_layers;
        let shape = (batch_beam, config.num_key_value_heads, 0, config.head_size);
        let pasts = layers
            .clone()
            .map(|_| {
                Ok((
                    Tensor::zeros(shape, dtype, device)?,
                    Tensor::zeros(shape, dtype, device)?,
                ))
            })
            .collect::<Result<Vec<_>, CacheError>>()?;
        let names = |template: &str| -> Vec<String> {
            layers.clone().map(|i| layer_name(template, i)).collect()
        };
        Ok(Self {
            past_key_names: names(&config.inputs.past_key_names),
            past_value_names: names(&config.inputs.past_value_names),
            present_key_names: names(&config.outputs.present_key_names),
            present_value_names: names(&config.outputs.present_value_names),
            pasts,
            batch_beam,
            num_kv_heads: config.num_key_value_heads,
            head_size: config.head_size,
            device: device.clone(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.pasts.len()
    }

    /// Positions currently cached.
    pub fn past_len(&self) -> usize {
        self.pasts.first().map_or(0, |(k, _)| k.dims()[2])
    }

    /// `(name, tensor)` past inputs in layer order, key before value.
    pub fn past_inputs(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.past_key_names
            .iter()
            .zip(self.past_value_names.iter())
            .zip(&self.pasts)
            .flat_map(|((kn, vn), (k, v))| [(kn.as_str(), k), (vn.as_str(), v)])
    }

    /// Present output names in layer order, key before value.
    pub fn present_names(&self) -> impl Iterator<Item = &str> {
        self.present_key_names
            .iter()
            .zip(self.present_value_names.iter())
            .flat_map(|(k, v)| [k.as_str(), v.as_str()])
    }

    /// Promote this step's presents to pasts.
    ///
    /// `beam_indices[j]` names the row of the presents that row `j` of the
    /// next pasts continues.
    pub fn advance(
        &mut self,
        presents: Vec<(Tensor, Tensor)>,
        beam_indices: Option<&[u32]>,
    ) -> Result<(), CacheError> {
        if presents.len() != self.pasts.len() {
            return Err(CacheError::UnexpectedShape {
                tensor: "presents".to_string(),
                expected: format!("{} layers", self.pasts.len()),
                actual: vec![presents.len()],
            });
        }
        let index = beam_indices
            .map(|idx| Tensor::new(idx, &self.device))
            .transpose()?;
        let min_len = self.past_len();
        let mut next = Vec::with_capacity(presents.len());
        for (layer, (k, v)) in presents.into_iter().enumerate() {
            self.check_present(&self.present_key_names[layer], &k, min_len)?;
            self.check_present(&self.present_value_names[layer], &v, min_len)?;
            next.push(match &index {
                Some(index) => (k.index_select(index, 0)?, v.index_select(index, 0)?),
                None => (k, v),
            });
        }
        self.pasts = next;
        Ok(())
    }

    /// Reorder cached rows so row `j` continues row `beam_indices[j]`.
    pub fn reorder(&mut self, beam_indices: &[u32]) -> Result<(), CacheError> {
        if beam_indices.len() != self.batch_beam {
            return Err(CacheError::UnexpectedShape {
                tensor: "beam_indices".to_string(),
                expected: format!("[{}]", self.batch_beam),
                actual: vec![beam_indices.len()],
            });
        }
        let index = Tensor::new(beam_indices, &self.device)?;
        for (k, v) in &mut self.pasts {
            *k = k.index_select(&index, 0)?;
            *v = v.index_select(&index, 0)?;
        }
        Ok(())
    }

    /// Drop the last `n` cached positions (speculative rollback).
    pub fn rewind(&mut self, n: usize) -> Result<(), CacheError> {
        let len = self.past_len();
        assert!(n <= len, "cannot rewind {n} positions, only {len} cached");
        for (k, v) in &mut self.pasts {
            *k = k.narrow(2, 0, len - n)?;
            *v = v.narrow(2, 0, len - n)?;
        }
        Ok(())
    }

    fn check_present(&self, name: &str, t: &Tensor, min_len: usize) -> Result<(), CacheError> {
        let dims = t.dims();
        let ok = dims.len() == 4
            && dims[0] == self.batch_beam
            && dims[1] == self.num_kv_heads
            && dims[2] >= min_len
            && dims[3] == self.head_size;
        if ok {
            Ok(())
        } else {
            Err(CacheError::UnexpectedShape {
                tensor: name.to_string(),
                expected: format!(
                    "[{}, {}, >={min_len}, {}]",
                    self.batch_beam, self.num_kv_heads, self.head_size
                ),
                actual: dims.to_vec(),
            })
        }
    }
}
