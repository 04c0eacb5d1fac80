pub mod manifest;
pub mod resolver;

pub use manifest::{Manifest, ManifestSnapshot};
pub use resolver::{DataLayout, DirScanResolver, FileResolver, TagInfo, TagResolver};
