//! Animated GIF encoding.
//!
//! [`GifWriter`] accepts RGBA frames one at a time, quantises each to a
//! 256-colour palette with the `gif` crate's NeuQuant quantiser, and writes
//! it straight into an in-memory buffer. Only the current frame's pixels are
//! held while encoding.

use gif::{Encoder, Frame, Repeat};
use image::RgbaImage;

use crate::error::ConversionError;

/// NeuQuant sampling speed (1 = best quality, 30 = fastest).
const QUANTIZE_SPEED: i32 = 10;

/// A frame reduced to a palette, ready to be written any number of times.
#[derive(Debug, Clone)]
pub struct QuantizedFrame(Frame<'static>);

/// Streaming GIF encoder over a `Vec<u8>`.
pub struct GifWriter {
    encoder: Encoder<Vec<u8>>,
    width: u16,
    height: u16,
    frames: u64,
}

impl GifWriter {
    /// Start a GIF of the given canvas size.
    ///
    /// A looping GIF carries the NETSCAPE2.0 extension with an infinite
    /// repeat count; a non-looping GIF omits it and plays once.
    pub fn new(width: u32, height: u32, looping: bool) -> Result<Self, ConversionError> {
        let (width, height) = match (u16::try_from(width), u16::try_from(height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(ConversionError::EncodeFailure(format!(
                    "canvas {width}x{height} is outside the GIF range"
                )));
            }
        };

        let mut encoder = Encoder::new(Vec::new(), width, height, &[]).map_err(|error| {
            ConversionError::EncodeFailure(format!("Failed to create GIF encoder: {error}"))
        })?;
        if looping {
            encoder.set_repeat(Repeat::Infinite).map_err(|error| {
                ConversionError::EncodeFailure(format!("Failed to set GIF repeat: {error}"))
            })?;
        }

        log::debug!("Started {width}x{height} GIF (looping={looping})");
        Ok(Self {
            encoder,
            width,
            height,
            frames: 0,
        })
    }

    /// Quantise and append one frame shown for `delay` centiseconds.
    ///
    /// The image must match the canvas size.
    pub fn push(&mut self, image: &RgbaImage, delay: u16) -> Result<(), ConversionError> {
        let mut frame = self.quantize(image)?;
        self.push_quantized(&mut frame, delay)
    }

    /// Quantise an image for this canvas without writing it.
    ///
    /// A frame shown for several output slots is quantised once and written
    /// with [`push_quantized`](GifWriter::push_quantized) per slot.
    pub fn quantize(&self, image: &RgbaImage) -> Result<QuantizedFrame, ConversionError> {
        if image.width() != self.width as u32 || image.height() != self.height as u32 {
            return Err(ConversionError::EncodeFailure(format!(
                "frame is {}x{} but the canvas is {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height,
            )));
        }

        let mut pixels = image.as_raw().clone();
        Ok(QuantizedFrame(Frame::from_rgba_speed(
            self.width,
            self.height,
            &mut pixels,
            QUANTIZE_SPEED,
        )))
    }

    /// Append an already quantised frame shown for `delay` centiseconds.
    pub fn push_quantized(
        &mut self,
        frame: &mut QuantizedFrame,
        delay: u16,
    ) -> Result<(), ConversionError> {
        frame.0.delay = delay;
        self.encoder.write_frame(&frame.0).map_err(|error| {
            ConversionError::EncodeFailure(format!("Failed to write GIF frame: {error}"))
        })?;
        self.frames += 1;
        Ok(())
    }

    /// Frames written so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Write the trailer and return the encoded bytes.
    pub fn finish(self) -> Result<Vec<u8>, ConversionError> {
        if self.frames == 0 {
            return Err(ConversionError::EncodeFailure(
                "a GIF needs at least one frame".to_string(),
            ));
        }
        self.encoder.into_inner().map_err(|error| {
            ConversionError::EncodeFailure(format!("Failed to finish GIF: {error}"))
        })
    }
}
