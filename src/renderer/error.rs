use crate::renderer::device::{Extent2d, ImageId};
use crate::renderer::format::TextureFormat;

/// Errors surfaced by the frame orchestrator and its devices.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("no {role} format supports {required}; tried {candidates:?}")]
    UnsupportedFormat {
        role: &'static str,
        required: &'static str,
        candidates: Vec<TextureFormat>,
    },

    #[error("device error: {0}")]
    Device(String),

    #[error("allocation of {label} failed: {reason}")]
    Allocation { label: String, reason: String },

    #[error("descriptor set references image {0:?} which no longer exists")]
    StaleBinding(ImageId),

    #[error("image {0:?} is still referenced by in-flight GPU work")]
    ResourceInFlight(ImageId),

    #[error("unknown image {0:?}")]
    UnknownImage(ImageId),

    #[error("capture target is {actual:?}, swapchain is {expected:?}")]
    CaptureExtent { expected: Extent2d, actual: Extent2d },

    #[error("readback error: {0}")]
    Readback(String),

    #[error(transparent)]
    Transition(#[from] TransitionViolation),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn device<T: ToString>(msg: T) -> Self {
        RenderError::Device(msg.to_string())
    }

    pub fn readback<T: ToString>(msg: T) -> Self {
        RenderError::Readback(msg.to_string())
    }
}

/// An attachment used against its declared load/store contract.
///
/// These are defects in the recorded frame, never recoverable at runtime.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionViolation {
    #[error("pass {pass:?} writes depth {image:?} declared read-only")]
    DepthWriteToReadonly { pass: String, image: ImageId },

    #[error("pass {pass:?} writes colour target {image:?} declared read-only")]
    ColorWriteToReadonly { pass: String, image: ImageId },

    #[error("pass {pass:?} samples {image:?} while it is bound as a writable attachment")]
    SampledWhileWritable { pass: String, image: ImageId },

    #[error("pass {pass:?} storage-writes {image:?} while it is bound as an attachment")]
    StorageWhileAttached { pass: String, image: ImageId },
}

pub type RenderResult<T> = Result<T, RenderError>;
