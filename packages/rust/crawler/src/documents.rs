//! On-disk page documents, one pretty-printed JSON file per page.

use std::path::{Path, PathBuf};

use wikiharvest_shared::{HarvestError, Result, WikiPageDoc, make_filename};

/// Writes fetched page documents into a flat output directory.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    output_dir: PathBuf,
}

impl DocumentStore {
    /// Create the store, making `output_dir` if needed.
    pub fn new(output_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_dir).map_err(|e| HarvestError::io(output_dir, e))?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path a document for `title`/`page_id` is written to.
    pub fn path_for(&self, title: &str, page_id: u64) -> PathBuf {
        self.output_dir.join(make_filename(title, page_id))
    }

    /// Serialize `doc` to its file, replacing any previous version.
    pub fn write(&self, doc: &WikiPageDoc) -> Result<PathBuf> {
        let path = self.path_for(&doc.title, doc.pageid);
        let json = serde_json::to_string_pretty(doc)?;
        std::fs::write(&path, json).map_err(|e| HarvestError::io(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn writes_sanitized_filename() {
        let dir = std::env::temp_dir().join(format!("wh_docs_{}", Uuid::now_v7()));
        let store = DocumentStore::new(&dir).unwrap();

        let doc = WikiPageDoc {
            pageid: 7,
            title: "Cat: Basic?".into(),
            revid: 70,
            ..Default::default()
        };
        let path = store.write(&doc).unwrap();

        assert_eq!(path.file_name().unwrap(), "Cat_ Basic__7.json");
        let back: WikiPageDoc = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.revid, 70);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
