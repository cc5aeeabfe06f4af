use crate::error::{Error, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

/// A disk image to be written. The contents are treated as an opaque byte blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSource {
    pub path: PathBuf,
    pub size: u64,
}

impl ImageSource {
    /// Checks that `path` names a readable regular file and records its size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("no image file selected".to_string()));
        }

        let file = File::open(path).map_err(|e| {
            Error::InvalidInput(format!("cannot read image {}: {}", path.display(), e))
        })?;
        let metadata = file.metadata().map_err(|e| {
            Error::InvalidInput(format!("cannot stat image {}: {}", path.display(), e))
        })?;

        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }

    pub(crate) fn reader(&self) -> std::io::Result<File> {
        File::open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_records_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 512]).unwrap();

        let image = ImageSource::open(file.path()).unwrap();
        assert_eq!(image.size, 512);
        assert_eq!(image.path, file.path());
    }

    #[test]
    fn test_rejects_missing_empty_and_directory_paths() {
        assert!(matches!(
            ImageSource::open(""),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            ImageSource::open("/definitely/not/here.iso"),
            Err(Error::InvalidInput(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageSource::open(dir.path()),
            Err(Error::InvalidInput(_))
        ));
    }
}
