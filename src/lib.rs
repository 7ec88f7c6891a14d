//! amifuse: mount Amiga disk images by running the original filesystem
//! handler binary inside an emulated m68k machine and bridging its
//! AmigaDOS packet interface to FUSE.

pub mod amiga;
pub mod boot;
pub mod bridge;
pub mod cache;
pub mod cpu;
pub mod device;
pub mod error;
pub mod exec;
pub mod fs;
pub mod hunk;
pub mod mem;
pub mod rdb;

pub use boot::{BootConfig, boot};
pub use bridge::Bridge;
pub use cache::InodeCache;
pub use error::AmiError;
pub use fs::AmigaFs;
