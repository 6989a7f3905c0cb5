use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Expand `paths` into the ordered list of files they name.
///
/// Files are taken as-is; directories contribute their regular files (one
/// level deep, sorted by name). Later duplicates are dropped.
pub fn find_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for path in paths {
        let path = path.as_ref();
        let meta = fs::metadata(path)
            .map_err(|e| Error::load(format!("cannot access {}: {e}", path.display())))?;

        let mut found = Vec::new();
        if meta.is_dir() {
            for entry in fs::read_dir(path)? {
                let entry_path = entry?.path();
                if entry_path.is_file() {
                    found.push(entry_path);
                }
            }
            found.sort();
        } else {
            found.push(path.to_path_buf());
        }

        for file in found {
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }

    Ok(files)
}

/// The set of files making up one compiled model.
#[derive(Clone, Debug)]
pub struct ModelArtifact {
    files: Vec<PathBuf>,
}

impl ModelArtifact {
    pub fn from_files(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    pub fn locate<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        Ok(Self::from_files(find_files(paths)?))
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// The one file with extension `ext`. None or several is a load error.
    pub fn single_with_extension(&self, ext: &str) -> Result<&Path> {
        let mut matches = self.files.iter().filter(|f| {
            f.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ext))
        });

        let first = matches.next().ok_or_else(|| {
            Error::load(format!(
                "no *.{ext} file among {} artifact file(s)",
                self.files.len()
            ))
        })?;
        if let Some(second) = matches.next() {
            return Err(Error::load(format!(
                "ambiguous artifact: both {} and {} are *.{ext} files",
                first.display(),
                second.display()
            )));
        }

        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_expand_sorted_and_dedup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("b.json"), "{}")?;
        fs::write(dir.path().join("a.txt"), "")?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::write(dir.path().join("nested").join("c.json"), "{}")?;

        let explicit = dir.path().join("b.json");
        let files = find_files(&[dir.path().to_path_buf(), explicit.clone()])?;

        assert_eq!(files, vec![dir.path().join("a.txt"), explicit]);
        Ok(())
    }

    #[test]
    fn missing_path_is_load_error() {
        let err = find_files(&["/definitely/not/here"]).unwrap_err();
        assert!(matches!(err, Error::Load(_)));
    }

    #[test]
    fn single_with_extension_requires_exactly_one() {
        let artifact = ModelArtifact::from_files(vec![
            PathBuf::from("m/model.json"),
            PathBuf::from("m/readme.md"),
        ]);
        assert_eq!(
            artifact.single_with_extension("json").unwrap(),
            Path::new("m/model.json")
        );
        assert!(artifact.single_with_extension("so").is_err());

        let ambiguous = ModelArtifact::from_files(vec![
            PathBuf::from("a.JSON"),
            PathBuf::from("b.json"),
        ]);
        assert!(matches!(
            ambiguous.single_with_extension("json"),
            Err(Error::Load(_))
        ));
    }
}
