//! # altofs
//!
//! Read/write access to a Xerox-Alto-class workstation's on-disk file system,
//! stored as a raw disk image on a modern host.
//!
//! ## Architecture
//!
//! Two modules, bottom to top:
//! * `img` decodes host bytes into sectors and relates a sector's virtual
//!   disk address (VDA) to the physical disk address (DA) packed into its
//!   label.  It knows nothing about files or directories.
//! * `fs` builds files, the directory, and the disk descriptor on top of
//!   `img`, and exposes `FileSystem` as the entry point: `mount`, `list`,
//!   `open_file`, `read_text`, `create_file`, `delete_file`, `check`.
//!
//! Two physical disk families are supported (`img::Family`): a small
//! cartridge-disk family and a larger pack-disk family, distinguished by file
//! extension and size at `FileSystem::mount`.
//!
//! ```no_run
//! use altofs::fs::{FileSystem, FileSystemOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut fs = FileSystem::mount("press.dsk80", FileSystemOptions::default())?;
//! if let Some(view) = fs.open_file("Press.Meter")? {
//!     let text = fs.read_text(&view)?;
//!     println!("{}", text);
//! }
//! # Ok(())
//! # }
//! ```

pub mod fs;
pub mod img;

/// A boxed error trait object, used at API boundaries that can surface
/// either `img::Error` or `fs::Error`.
pub type DYNERR = Box<dyn std::error::Error>;
/// Shorthand for a fallible operation with no payload on success.
pub type STDRESULT = Result<(), DYNERR>;
