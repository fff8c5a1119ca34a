use std::fmt;

/// Result alias that carries the custom [`AvatarError`] type.
pub type Result<T> = std::result::Result<T, AvatarError>;

/// Exclusive devices a session may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Microphone,
    Capture,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Microphone => f.write_str("microphone"),
            Device::Capture => f.write_str("capture output"),
        }
    }
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    /// A clip never became ready to play. Absorbed by the clip library.
    #[error("clip `{locator}` failed to load: {message}")]
    AssetLoad { locator: String, message: String },
    /// Permission denied or hardware missing for an exclusive device.
    #[error("{device} unavailable: {message}")]
    DeviceAccess { device: Device, message: String },
    /// Capture was requested before the first frame was composited.
    #[error("output surface does not exist yet")]
    RenderSurfaceUnavailable,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
}

impl AvatarError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn asset_load(locator: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::AssetLoad {
            locator: locator.into(),
            message: message.to_string(),
        }
    }

    pub fn device(device: Device, message: impl fmt::Display) -> Self {
        Self::DeviceAccess {
            device,
            message: message.to_string(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Device and surface failures are reported to the user; everything else
    /// is handled inside the engine.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::DeviceAccess { .. } | Self::RenderSurfaceUnavailable
        )
    }
}

impl From<&str> for AvatarError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for AvatarError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
