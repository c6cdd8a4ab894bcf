//! rfs-box: Box.com backend
//!
//! Box addresses files and folders by numeric ID, so every path is
//! resolved through the core [`DirCache`](rfs_core::DirCache). Calls are
//! spaced by the backend's [`Pacer`](rfs_core::Pacer), and big files go
//! through Box's chunked upload sessions, limited to a fixed number at a
//! time.

mod api;
mod client;
mod fs;
mod names;
mod object;
mod options;
mod upload;

pub use fs::BoxFs;
pub use object::BoxObject;
pub use options::BoxOptions;
pub use upload::UploadStrategy;
