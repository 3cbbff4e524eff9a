//! Free space on the scratch volume

use std::io;
use std::path::PathBuf;

/// Local disk that downloads are written to
pub trait ScratchSpace: Send + Sync {
    fn usable_bytes(&self) -> io::Result<u64>;
}

/// Free space on the volume holding `dir`
#[derive(Debug, Clone)]
pub struct FsScratchSpace {
    dir: PathBuf,
}

impl FsScratchSpace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ScratchSpace for FsScratchSpace {
    fn usable_bytes(&self) -> io::Result<u64> {
        // The scratch dir may not exist before the first download
        let dir = if self.dir.is_relative() {
            std::env::current_dir()?.join(&self.dir)
        } else {
            self.dir.clone()
        };
        let existing = dir
            .ancestors()
            .find(|p| p.exists())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        fs2::available_space(existing)
    }
}
