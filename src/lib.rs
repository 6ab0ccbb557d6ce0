//! A library for flashing Bouffalo Lab BL60x/BL70x/BL61x/BL808 family
//! devices over their serial boot ROM, and for building the signed and
//! encrypted firmware images the boot ROM consumes.
//!
//! The serial half (transport, connection, loader, listener) sits behind the
//! default-on `serialport` feature; the image builder works everywhere.
//!
//! ```no_run
//! use blflash::{
//!     chip::Chip,
//!     connection::{Connection, HandshakeOptions},
//!     loader::{LoadOptions, Loader},
//!     transport::SerialTransport,
//! };
//!
//! # fn main() -> Result<(), blflash::Error> {
//! let transport = SerialTransport::open("/dev/ttyUSB0", 500_000)?;
//! let mut connection = Connection::new(Box::new(transport), Chip::Bl602);
//!
//! let image = std::fs::read("firmware_whole.bin").unwrap();
//! let mut loader = Loader::new(&mut connection, None);
//! let info = loader.load_image(
//!     &image,
//!     &LoadOptions {
//!         run: true,
//!         ..LoadOptions::default()
//!     },
//! )?;
//! println!("flashed chip {}", info.chip_id);
//! # Ok(())
//! # }
//! ```

pub mod chip;
pub mod config;
#[cfg(feature = "serialport")]
pub mod connection;
pub mod crypto;
pub mod error;
pub mod image;
#[cfg(feature = "serialport")]
pub mod listener;
#[cfg(feature = "serialport")]
pub mod loader;
#[cfg(feature = "serialport")]
pub mod transport;

pub use chip::Chip;
pub use config::Config;
pub use error::Error;
#[cfg(feature = "serialport")]
pub use loader::{BootInfo, ChipRegistry};
