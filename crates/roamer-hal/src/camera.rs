//! Image frames returned by the robot's camera.

use roamer_types::RoamerError;

/// Encoding of a captured frame's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    Jpeg,
    Png,
}

impl ImageEncoding {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageEncoding::Jpeg => "image/jpeg",
            ImageEncoding::Png => "image/png",
        }
    }
}

/// A single encoded image from the robot's camera.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub encoding: ImageEncoding,
    /// Encoded image bytes, exactly as returned by the robot.
    pub data: Vec<u8>,
}

impl CameraFrame {
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            encoding: ImageEncoding::Jpeg,
            data,
        }
    }

    /// Reject frames that carry no image data.
    ///
    /// # Errors
    ///
    /// Returns [`RoamerError::Transport`] when `data` is empty.
    pub fn non_empty(self) -> Result<Self, RoamerError> {
        if self.data.is_empty() {
            Err(RoamerError::transport(
                "capture_image",
                "captured image data is empty",
            ))
        } else {
            Ok(self)
        }
    }
}
