#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Summary {
    pub bytes_transferred: u64,
    pub files_transferred: usize,
    /// Files skipped by the restart filter.
    pub files_skipped: usize,
    pub files_failed: usize,
    pub directories_created: usize,
}

impl Summary {
    pub fn file(bytes: u64) -> Self {
        Self {
            bytes_transferred: bytes,
            files_transferred: 1,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            files_skipped: 1,
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            files_failed: 1,
            ..Default::default()
        }
    }

    pub fn directory() -> Self {
        Self {
            directories_created: 1,
            ..Default::default()
        }
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            files_transferred: self.files_transferred + other.files_transferred,
            files_skipped: self.files_skipped + other.files_skipped,
            files_failed: self.files_failed + other.files_failed,
            directories_created: self.directories_created + other.directories_created,
        }
    }
}

impl std::ops::AddAssign for Summary {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            files transferred: {}\n\
            files skipped: {}\n\
            files failed: {}\n\
            directories created: {}",
            bytesize::ByteSize(self.bytes_transferred),
            self.files_transferred,
            self.files_skipped,
            self.files_failed,
            self.directories_created,
        )
    }
}
