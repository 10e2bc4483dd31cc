/// 2-D convolution kernels (NCHW) with stride, zero padding, dilation and groups.
///
/// Operation, per batch item b and output channel oc in group g:
///
///   out[b,oc,oh,ow] = bias[oc]
///       + sum_{icg,ki,kj} w[oc,icg,ki,kj] * x[b, g*icpg+icg, oh*sh + ki*dh - ph, ow*sw + kj*dw - pw]
///
/// Out-of-range input coordinates read as zero (zero padding).
/// Weight layout is [out_channels, in_channels / groups, kh, kw].

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubnetError};

/// Constructor-level convolution configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Conv2dGeometry {
    /// Square kernel, stride 1, no padding, no dilation, one group.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Conv2dGeometry {
            in_channels,
            out_channels,
            kernel_size: (kernel_size, kernel_size),
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = (stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = (padding, padding);
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = (dilation, dilation);
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups == 0 {
            return Err(SubnetError::InvalidConv("groups must be positive".into()));
        }
        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return Err(SubnetError::InvalidConv(format!(
                "channels {}→{} not divisible by groups {}",
                self.in_channels, self.out_channels, self.groups
            )));
        }
        if self.kernel_size.0 == 0 || self.kernel_size.1 == 0 {
            return Err(SubnetError::InvalidConv("kernel size must be positive".into()));
        }
        if self.stride.0 == 0 || self.stride.1 == 0 {
            return Err(SubnetError::InvalidConv("stride must be positive".into()));
        }
        if self.dilation.0 == 0 || self.dilation.1 == 0 {
            return Err(SubnetError::InvalidConv("dilation must be positive".into()));
        }
        Ok(())
    }

    /// [out_channels, in_channels / groups, kh, kw]
    pub fn weight_shape(&self) -> Vec<usize> {
        vec![
            self.out_channels,
            self.in_channels / self.groups.max(1),
            self.kernel_size.0,
            self.kernel_size.1,
        ]
    }

    /// Resolve spatial sizes for an input of shape [N, C, H, W].
    pub fn dims_for(&self, input_shape: &[usize]) -> Result<Conv2dDims> {
        if input_shape.len() != 4 || input_shape[1] != self.in_channels {
            return Err(SubnetError::ShapeMismatch {
                what: "conv2d input [N, C, H, W]",
                expected: vec![input_shape.first().copied().unwrap_or(0), self.in_channels, 0, 0],
                actual: input_shape.to_vec(),
            });
        }
        let out_h = out_extent(input_shape[2], self.kernel_size.0, self.stride.0, self.padding.0, self.dilation.0);
        let out_w = out_extent(input_shape[3], self.kernel_size.1, self.stride.1, self.padding.1, self.dilation.1);
        match (out_h, out_w) {
            (Some(out_h), Some(out_w)) => Ok(Conv2dDims {
                geom: *self,
                batch: input_shape[0],
                in_h: input_shape[2],
                in_w: input_shape[3],
                out_h,
                out_w,
            }),
            _ => Err(SubnetError::InvalidShape {
                shape: input_shape.to_vec(),
                reason: "input smaller than the dilated kernel".into(),
            }),
        }
    }
}

fn out_extent(len: usize, kernel: usize, stride: usize, pad: usize, dil: usize) -> Option<usize> {
    let span = dil * (kernel - 1) + 1;
    let padded = len + 2 * pad;
    if padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// Fully resolved sizes for one convolution call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv2dDims {
    pub geom: Conv2dGeometry,
    pub batch: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
}

impl Conv2dDims {
    pub fn input_len(&self) -> usize {
        self.batch * self.geom.in_channels * self.in_h * self.in_w
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.batch, self.geom.out_channels, self.out_h, self.out_w]
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.geom.out_channels * self.out_h * self.out_w
    }

    fn weight_len(&self) -> usize {
        self.geom.weight_shape().iter().product()
    }

    /// Input coordinate for output position `o` and kernel tap `kk`, if inside.
    #[inline]
    fn input_coord(o: usize, kk: usize, stride: usize, dil: usize, pad: usize, len: usize) -> Option<usize> {
        let pos = (o * stride + kk * dil) as isize - pad as isize;
        if pos >= 0 && (pos as usize) < len {
            Some(pos as usize)
        } else {
            None
        }
    }
}

/// Visit every (output index, input index, weight index) triple of the convolution.
#[inline]
fn for_each_tap(dims: &Conv2dDims, mut f: impl FnMut(usize, usize, usize)) {
    let g = dims.geom;
    let icpg = g.in_channels / g.groups;
    let ocpg = g.out_channels / g.groups;
    let (kh, kw) = g.kernel_size;

    for b in 0..dims.batch {
        for grp in 0..g.groups {
            for oc in grp * ocpg..(grp + 1) * ocpg {
                for oh in 0..dims.out_h {
                    for ow in 0..dims.out_w {
                        let out_idx = ((b * g.out_channels + oc) * dims.out_h + oh) * dims.out_w + ow;
                        for icg in 0..icpg {
                            let ic = grp * icpg + icg;
                            for ki in 0..kh {
                                let Some(ih) = Conv2dDims::input_coord(oh, ki, g.stride.0, g.dilation.0, g.padding.0, dims.in_h) else { continue };
                                for kj in 0..kw {
                                    let Some(iw) = Conv2dDims::input_coord(ow, kj, g.stride.1, g.dilation.1, g.padding.1, dims.in_w) else { continue };
                                    let in_idx = ((b * g.in_channels + ic) * dims.in_h + ih) * dims.in_w + iw;
                                    let w_idx = ((oc * icpg + icg) * kh + ki) * kw + kj;
                                    f(out_idx, in_idx, w_idx);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Conv2D forward.
///
/// `x`: [N, C_in, H, W], `w`: [C_out, C_in/groups, kh, kw], `bias`: [C_out] or None.
/// Returns out: [N, C_out, H_out, W_out].
pub fn conv2d_forward(x: &[f32], w: &[f32], bias: Option<&[f32]>, dims: &Conv2dDims) -> Vec<f32> {
    debug_assert_eq!(x.len(), dims.input_len());
    debug_assert_eq!(w.len(), dims.weight_len());

    let mut out = vec![0.0f32; dims.output_len()];
    if let Some(bias) = bias {
        debug_assert_eq!(bias.len(), dims.geom.out_channels);
        let plane = dims.out_h * dims.out_w;
        for (i, o) in out.iter_mut().enumerate() {
            *o = bias[(i / plane) % dims.geom.out_channels];
        }
    }
    for_each_tap(dims, |o, i, k| out[o] += w[k] * x[i]);
    out
}

/// Conv2D backward.
///
/// `d_out`: [N, C_out, H_out, W_out] upstream gradient.
/// Returns (d_x [N, C_in, H, W], d_w [C_out, C_in/groups, kh, kw], d_bias [C_out]).
pub fn conv2d_backward(d_out: &[f32], x: &[f32], w: &[f32], dims: &Conv2dDims) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    debug_assert_eq!(d_out.len(), dims.output_len());
    debug_assert_eq!(x.len(), dims.input_len());
    debug_assert_eq!(w.len(), dims.weight_len());

    let mut d_x = vec![0.0f32; x.len()];
    let mut d_w = vec![0.0f32; w.len()];
    let mut d_bias = vec![0.0f32; dims.geom.out_channels];

    let plane = dims.out_h * dims.out_w;
    for (i, d) in d_out.iter().enumerate() {
        d_bias[(i / plane) % dims.geom.out_channels] += d;
    }
    for_each_tap(dims, |o, i, k| {
        d_w[k] += d_out[o] * x[i];
        d_x[i] += d_out[o] * w[k];
    });
    (d_x, d_w, d_bias)
}
