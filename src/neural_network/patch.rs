use super::{
    autograd::{Variable3, Variable4},
    layer::{Forward, Layer},
};
use anyhow::{ensure, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct PatchGrid {
    channels: usize,
    image_size: [usize; 2],
    patch_size: [usize; 2],
}

impl PatchGrid {
    fn new(channels: usize, image_size: [usize; 2], patch_size: [usize; 2]) -> Result<Self> {
        ensure!(
            channels > 0 && image_size.iter().all(|x| *x > 0) && patch_size.iter().all(|x| *x > 0),
            "Invalid channels {channels}, image_size {image_size:?} or patch_size {patch_size:?}!"
        );
        ensure!(
            image_size[0] % patch_size[0] == 0 && image_size[1] % patch_size[1] == 0,
            "image_size {image_size:?} is not divisible by patch_size {patch_size:?}!"
        );
        Ok(Self {
            channels,
            image_size,
            patch_size,
        })
    }
    fn grid(&self) -> [usize; 2] {
        [
            self.image_size[0] / self.patch_size[0],
            self.image_size[1] / self.patch_size[1],
        ]
    }
    fn num_patch(&self) -> usize {
        self.grid().iter().product()
    }
    fn patch_dim(&self) -> usize {
        self.channels * self.patch_size.iter().product::<usize>()
    }
}

/// Splits images into flattened patches.
///
/// [batch_size, channels, height, width] -> [batch_size, num_patch, patch_dim], where
/// patches are enumerated row major over the grid of patches and each patch is flattened
/// as [channels, patch_height, patch_width].
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Image2Patch {
    grid: PatchGrid,
}

impl Image2Patch {
    /// Creates a new [`Image2Patch`].
    ///
    /// **Errors**
    ///
    /// The image size must be divisible by the patch size.
    pub fn new(channels: usize, image_size: [usize; 2], patch_size: [usize; 2]) -> Result<Self> {
        Ok(Self {
            grid: PatchGrid::new(channels, image_size, patch_size)?,
        })
    }
    /// The image channels.
    pub fn channels(&self) -> usize {
        self.grid.channels
    }
    /// The image [height, width].
    pub fn image_size(&self) -> [usize; 2] {
        self.grid.image_size
    }
    /// The number of patches.
    pub fn num_patch(&self) -> usize {
        self.grid.num_patch()
    }
    /// The length of a flattened patch.
    pub fn patch_dim(&self) -> usize {
        self.grid.patch_dim()
    }
}

impl Layer for Image2Patch {}

impl Forward<Variable4> for Image2Patch {
    type Output = Variable3;
    fn forward(&self, input: Variable4) -> Result<Variable3> {
        let PatchGrid {
            channels,
            image_size: [h, w],
            patch_size: [ph, pw],
        } = self.grid;
        let (batch_size, c, ih, iw) = input.dim();
        ensure!(
            (c, ih, iw) == (channels, h, w),
            "Image2Patch expected [_, {channels}, {h}, {w}], found {:?}!",
            input.shape()
        );
        let [nh, nw] = self.grid.grid();
        input
            .into_shape([batch_size, c, nh, ph, nw, pw])?
            .permuted_axes([0, 2, 4, 1, 3, 5])
            .into_shape([batch_size, nh * nw, c * ph * pw])
    }
}

/// Reassembles images from flattened patches, the inverse of [`Image2Patch`].
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Patch2Image {
    grid: PatchGrid,
}

impl Patch2Image {
    /// Creates a new [`Patch2Image`].
    ///
    /// **Errors**
    ///
    /// The image size must be divisible by the patch size.
    pub fn new(channels: usize, image_size: [usize; 2], patch_size: [usize; 2]) -> Result<Self> {
        Ok(Self {
            grid: PatchGrid::new(channels, image_size, patch_size)?,
        })
    }
    /// The number of patches.
    pub fn num_patch(&self) -> usize {
        self.grid.num_patch()
    }
    /// The length of a flattened patch.
    pub fn patch_dim(&self) -> usize {
        self.grid.patch_dim()
    }
}

impl Layer for Patch2Image {}

impl Forward<Variable3> for Patch2Image {
    type Output = Variable4;
    fn forward(&self, input: Variable3) -> Result<Variable4> {
        let PatchGrid {
            channels,
            image_size: [h, w],
            patch_size: [ph, pw],
        } = self.grid;
        let (batch_size, num_patch, patch_dim) = input.dim();
        ensure!(
            (num_patch, patch_dim) == (self.num_patch(), self.patch_dim()),
            "Patch2Image expected [_, {}, {}], found {:?}!",
            self.num_patch(),
            self.patch_dim(),
            input.shape()
        );
        let [nh, nw] = self.grid.grid();
        input
            .into_shape([batch_size, nh, nw, channels, ph, pw])?
            .permuted_axes([0, 3, 1, 4, 2, 5])
            .into_shape([batch_size, channels, h, w])
    }
}
