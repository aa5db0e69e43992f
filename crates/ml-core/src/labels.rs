use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::ModelError;

/// Class-id to label lookup loaded from a `<model>.names` sidecar file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one label per line; blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path).map_err(|err| ModelError::Load {
            path: path.to_path_buf(),
            source: err.into(),
        })?;
        Ok(Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        ))
    }

    pub fn sidecar_for(model_path: &Path) -> PathBuf {
        model_path.with_extension("names")
    }

    /// Load the sidecar next to `model_path`, or an empty table when absent.
    pub fn for_model(model_path: &Path) -> Result<Self, ModelError> {
        let sidecar = Self::sidecar_for(model_path);
        if sidecar.exists() {
            Self::from_file(&sidecar)
        } else {
            tracing::warn!(
                "no class names found at {}; labels fall back to numeric ids",
                sidecar.display()
            );
            Ok(Self::default())
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn label(&self, class_id: i64) -> String {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.names.get(idx))
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn reads_sidecar_next_to_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("fall_model.pt");
        let mut file = fs::File::create(dir.path().join("fall_model.names")).unwrap();
        writeln!(file, "# fall classes\nfall-detected\n\nnofall").unwrap();

        let names = ClassNames::for_model(&model).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names.label(0), "fall-detected");
        assert_eq!(names.label(1), "nofall");
    }

    #[test]
    fn missing_sidecar_falls_back_to_ids() {
        let dir = tempfile::tempdir().unwrap();
        let names = ClassNames::for_model(&dir.path().join("yolo11n.pt")).unwrap();
        assert!(names.is_empty());
        assert_eq!(names.label(3), "class3");
        assert_eq!(names.label(-1), "class-1");
    }
}
