//! Various utilities functions and types

mod geometry;

pub use self::geometry::{Buffer, Physical, Point, Rectangle, Size};

use std::os::unix::io::{AsFd, AsRawFd};
use std::path::PathBuf;

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        use std::fs;

        fs::read_link(format!("/proc/self/fd/{:?}", self.as_fd().as_raw_fd())).ok()
    }
}
