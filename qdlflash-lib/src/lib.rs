pub mod error;
pub mod events;
pub mod image;
pub mod manager;
pub mod manifest;
pub mod partition;
pub mod protocol;
pub mod sim;
pub mod transport;
pub mod utils;

pub use error::{Error, Result};
pub use events::{
    CallbackObserver, ChannelObserver, ErrorCondition, FlashEvent, FlashObserver,
    FlashObserverArc, FlashSnapshot, NoOpObserver, PROGRESS_UNKNOWN, Step, no_op_observer,
};
pub use image::{ImageConfig, ImageManager};
pub use manager::{FlashConfig, FlashManager, SessionHandle, VerifyMode};
pub use manifest::{ImageDescriptor, Manifest, VersionEntry, VersionList};
pub use transport::usb::{UsbConfig, UsbConnector};
pub use transport::{Connector, Transport, TransportError};
