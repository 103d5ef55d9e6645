//! Hardware channels.
//!
//! A channel is a numbered pulser output owned by exactly one function. Its hardware address is
//! allocated lazily, the first time an update needs it, and never changes afterwards. Bitmap
//! channels additionally carry a [`HardwareImage`].
//!
//! Behavior lives in the [`BaseChannel`] trait, written against a handful of field accessors.

use std::fmt;

use ndarray::Array2;

use crate::error::{PulseError, Result};
use crate::function::FunctionKind;
use crate::image::HardwareImage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelAddr {
    /// Bit `bit` of field `field` of a bitmap pulser
    Bitmap { field: usize, bit: usize },
    /// Output `position` of a delay-chain pulser
    Chain { position: usize },
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddr::Bitmap { field, bit } => write!(f, "field{}/bit{}", field, bit),
            ChannelAddr::Chain { position } => write!(f, "chain{}", position),
        }
    }
}

pub trait BaseChannel {
    // Field methods
    fn id(&self) -> usize;
    fn function(&self) -> FunctionKind;
    fn address(&self) -> Option<ChannelAddr>;
    fn image(&self) -> Option<&HardwareImage>;
    // Mutable field references
    fn address_(&mut self) -> &mut Option<ChannelAddr>;
    fn image_(&mut self) -> &mut Option<HardwareImage>;

    fn is_addressed(&self) -> bool {
        self.address().is_some()
    }

    /// Assigns the hardware address handed out by `allocate` unless one is already set.
    /// Addresses are stable: a second call is a no-op.
    fn ensure_address<F>(&mut self, allocate: F) -> Result<ChannelAddr>
    where
        F: FnOnce() -> Result<ChannelAddr>,
    {
        if let Some(addr) = self.address() {
            return Ok(addr);
        }
        let addr = allocate()?;
        *self.address_() = Some(addr);
        Ok(addr)
    }

    /// Returns the pending image, creating it (or resizing it to `rows`) as needed.
    fn image_for(&mut self, rows: usize, window: usize) -> &mut HardwareImage {
        let image = self
            .image_()
            .get_or_insert_with(|| HardwareImage::new(rows, window));
        image.resize(rows);
        image
    }

    /// Copy of the committed image, rows by ticks.
    fn committed_image(&self) -> Result<Array2<u8>> {
        self.image()
            .map(|image| image.committed().clone())
            .ok_or_else(|| {
                PulseError::Config(format!(
                    "channel {} ({}) has no hardware image",
                    self.id(),
                    self.function()
                ))
            })
    }
}

#[derive(Clone, Debug)]
pub struct Channel {
    id: usize,
    function: FunctionKind,
    address: Option<ChannelAddr>,
    image: Option<HardwareImage>,
}

impl Channel {
    pub fn new(id: usize, function: FunctionKind) -> Self {
        Self {
            id,
            function,
            address: None,
            image: None,
        }
    }
}

impl BaseChannel for Channel {
    fn id(&self) -> usize {
        self.id
    }
    fn function(&self) -> FunctionKind {
        self.function
    }
    fn address(&self) -> Option<ChannelAddr> {
        self.address
    }
    fn image(&self) -> Option<&HardwareImage> {
        self.image.as_ref()
    }
    fn address_(&mut self) -> &mut Option<ChannelAddr> {
        &mut self.address
    }
    fn image_(&mut self) -> &mut Option<HardwareImage> {
        &mut self.image
    }
}
