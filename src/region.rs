//! Kernel regions: offset enumerators for convolution and pooling kernels
//!
//! A [`KernelRegion`] enumerates the relative coordinate offsets a kernel
//! covers around a center coordinate. The enumeration order is fixed and
//! defines the kernel index `k` of every offset; kernel maps group their
//! (input row, output row) pairs by this index.
//!
//! Offsets are generated per spatial dimension from the kernel size,
//! dilation, and tensor stride:
//!
//! - odd kernel size `k`: centered steps `-(k/2) ..= k/2`
//! - even kernel size `k`: forward steps `0 .. k`
//!
//! each scaled by `tensor_stride[i] * dilation[i]`. Kernel volumes are small
//! in practice (a 3x3x3 cube is 27 offsets), so regions materialize their
//! offset table at construction; iteration is restartable slicing over it.

use crate::error::{Error, Result};

/// Shape of a kernel region
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionType {
    /// Dense product of per-dimension offsets (standard convolution kernel)
    HyperCube,
    /// Offsets with at most one non-zero axis (separable cross kernel)
    HyperCross,
    /// Caller-provided explicit offset list
    Custom,
}

/// An enumerable set of kernel offsets around a center coordinate
#[derive(Clone, Debug)]
pub struct KernelRegion {
    region_type: RegionType,
    coordinate_size: usize,
    tensor_stride: Vec<u32>,
    kernel_size: Vec<u32>,
    dilation: Vec<u32>,
    /// Row-major offset table, `volume` rows of `D - 1` spatial components
    offsets: Vec<i32>,
}

impl KernelRegion {
    /// Dense hypercube region: every combination of per-dimension offsets
    pub fn cube(tensor_stride: &[u32], kernel_size: &[u32], dilation: &[u32]) -> Result<Self> {
        validate_params(tensor_stride, kernel_size, dilation)?;
        let axes = axis_offsets(tensor_stride, kernel_size, dilation);
        let ndim = tensor_stride.len();
        let volume: usize = axes.iter().map(Vec::len).product();

        // Odometer enumeration, dimension 0 slowest.
        let mut offsets = Vec::with_capacity(volume * ndim);
        let mut idx = vec![0usize; ndim];
        for _ in 0..volume {
            for d in 0..ndim {
                offsets.push(axes[d][idx[d]]);
            }
            for d in (0..ndim).rev() {
                idx[d] += 1;
                if idx[d] < axes[d].len() {
                    break;
                }
                idx[d] = 0;
            }
        }

        Ok(Self {
            region_type: RegionType::HyperCube,
            coordinate_size: ndim + 1,
            tensor_stride: tensor_stride.to_vec(),
            kernel_size: kernel_size.to_vec(),
            dilation: dilation.to_vec(),
            offsets,
        })
    }

    /// Hypercross region: the center plus single-axis offsets
    pub fn cross(tensor_stride: &[u32], kernel_size: &[u32], dilation: &[u32]) -> Result<Self> {
        validate_params(tensor_stride, kernel_size, dilation)?;
        let axes = axis_offsets(tensor_stride, kernel_size, dilation);
        let ndim = tensor_stride.len();

        // Kernel index 0 is the center; axis offsets follow in axis order.
        let mut offsets = vec![0i32; ndim];
        for (d, axis) in axes.iter().enumerate() {
            for &step in axis {
                if step == 0 {
                    continue;
                }
                let row_start = offsets.len();
                offsets.resize(row_start + ndim, 0);
                offsets[row_start + d] = step;
            }
        }

        Ok(Self {
            region_type: RegionType::HyperCross,
            coordinate_size: ndim + 1,
            tensor_stride: tensor_stride.to_vec(),
            kernel_size: kernel_size.to_vec(),
            dilation: dilation.to_vec(),
            offsets,
        })
    }

    /// Custom region from an explicit offset list
    ///
    /// `offsets` is row-major with `D - 1` spatial components per row, in
    /// final coordinate units (no stride/dilation scaling is applied).
    pub fn custom(tensor_stride: &[u32], offsets: Vec<i32>) -> Result<Self> {
        let ndim = tensor_stride.len();
        if ndim == 0 {
            return Err(Error::invalid_argument(
                "tensor_stride",
                "at least one spatial dimension required",
            ));
        }
        if offsets.is_empty() || offsets.len() % ndim != 0 {
            return Err(Error::invalid_argument(
                "offsets",
                format!(
                    "offset list length {} is not a non-zero multiple of {} spatial dims",
                    offsets.len(),
                    ndim
                ),
            ));
        }
        Ok(Self {
            region_type: RegionType::Custom,
            coordinate_size: ndim + 1,
            tensor_stride: tensor_stride.to_vec(),
            kernel_size: vec![0; ndim],
            dilation: vec![1; ndim],
            offsets,
        })
    }

    /// Region shape
    #[inline]
    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    /// Coordinate size `D` (batch + spatial)
    #[inline]
    pub fn coordinate_size(&self) -> usize {
        self.coordinate_size
    }

    /// Tensor stride of the grid the region is defined on
    #[inline]
    pub fn tensor_stride(&self) -> &[u32] {
        &self.tensor_stride
    }

    /// Kernel size per spatial dimension (all zeros for custom regions)
    #[inline]
    pub fn kernel_size(&self) -> &[u32] {
        &self.kernel_size
    }

    /// Dilation per spatial dimension
    #[inline]
    pub fn dilation(&self) -> &[u32] {
        &self.dilation
    }

    /// Total offset count
    #[inline]
    pub fn volume(&self) -> usize {
        self.offsets.len() / (self.coordinate_size - 1)
    }

    /// The spatial offset row for kernel index `k`
    #[inline]
    pub fn offset(&self, k: usize) -> &[i32] {
        let ndim = self.coordinate_size - 1;
        &self.offsets[k * ndim..(k + 1) * ndim]
    }

    /// Iterate offsets in kernel-index order
    pub fn iter(&self) -> impl Iterator<Item = &[i32]> + '_ {
        self.offsets.chunks_exact(self.coordinate_size - 1)
    }

    /// The full offset table, row-major `volume x (D - 1)`
    ///
    /// Used to stage the region on a device before a kernel-map launch.
    #[inline]
    pub fn offset_table(&self) -> &[i32] {
        &self.offsets
    }

    /// True if the volume-1 pointwise fast path applies
    ///
    /// Only non-custom regions qualify: a single custom offset may still be
    /// non-zero and must go through offset iteration.
    #[inline]
    pub(crate) fn is_pointwise(&self) -> bool {
        self.region_type != RegionType::Custom && self.volume() == 1
    }
}

/// Per-axis offset steps: centered for odd kernel sizes, forward for even
fn axis_offsets(tensor_stride: &[u32], kernel_size: &[u32], dilation: &[u32]) -> Vec<Vec<i32>> {
    tensor_stride
        .iter()
        .zip(kernel_size)
        .zip(dilation)
        .map(|((&ts, &k), &dil)| {
            let unit = (ts * dil) as i32;
            let k = k as i32;
            if k % 2 == 1 {
                (-(k / 2)..=(k / 2)).map(|j| j * unit).collect()
            } else {
                (0..k).map(|j| j * unit).collect()
            }
        })
        .collect()
}

fn validate_params(tensor_stride: &[u32], kernel_size: &[u32], dilation: &[u32]) -> Result<()> {
    let ndim = tensor_stride.len();
    if ndim == 0 {
        return Err(Error::invalid_argument(
            "tensor_stride",
            "at least one spatial dimension required",
        ));
    }
    if kernel_size.len() != ndim || dilation.len() != ndim {
        return Err(Error::invalid_argument(
            "kernel_size",
            format!(
                "kernel_size ({}) and dilation ({}) must match {} spatial dims",
                kernel_size.len(),
                dilation.len(),
                ndim
            ),
        ));
    }
    if kernel_size.iter().any(|&k| k == 0) {
        return Err(Error::invalid_argument("kernel_size", "must be >= 1"));
    }
    if dilation.iter().any(|&d| d == 0) {
        return Err(Error::invalid_argument("dilation", "must be >= 1"));
    }
    if tensor_stride.iter().any(|&s| s == 0) {
        return Err(Error::invalid_argument("tensor_stride", "must be >= 1"));
    }
    Ok(())
}
