//! Local directory standing in for the hosted file bucket.

use actix_web::web;
use anyhow::{Context, Result, anyhow};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::model::attachment::OwnerKind;

// leaves room for the "{uuid}-" prefix under the 255-byte name limit
const MAX_FILENAME_BYTES: usize = 200;

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

/// Strip path separators, control characters and leading dots; cap the UTF-8 length.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    let mut end = trimmed.len().min(MAX_FILENAME_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let capped = trimmed[..end].to_string();

    if capped.is_empty() {
        "file".to_string()
    } else {
        capped
    }
}

/// `"{owner_kind}/{owner_id}/{uuid}-{name}"`
pub fn storage_key(kind: OwnerKind, owner_id: u64, filename: &str) -> String {
    format!(
        "{}/{}/{}-{}",
        kind.as_ref(),
        owner_id,
        Uuid::new_v4(),
        sanitize_filename(filename)
    )
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key below the root, refusing anything that could escape it.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("invalid storage key {key:?}"));
        }
        Ok(self.root.join(relative))
    }

    pub async fn save(&self, key: &str, bytes: web::Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        web::block(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))
        })
        .await
        .map_err(|e| anyhow!("blocking pool error: {e}"))?
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        web::block(move || std::fs::read(&path).with_context(|| format!("reading {}", path.display())))
            .await
            .map_err(|e| anyhow!("blocking pool error: {e}"))?
    }

    /// Remove a stored file; a missing file is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        web::block(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("removing {}: {e}", path.display())),
        })
        .await
        .map_err(|e| anyhow!("blocking pool error: {e}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_controls() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\cv final.pdf"), "cv_final.pdf");
        assert_eq!(sanitize_filename("..hidden"), "hidden");
        assert_eq!(sanitize_filename("a\u{0}b?.txt"), "ab_.txt");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("dir/"), "file");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).len(), MAX_FILENAME_BYTES);
    }

    #[test]
    fn sanitize_cuts_multibyte_names_on_char_boundary() {
        let long = format!("{}.pdf", "é".repeat(130));
        let name = sanitize_filename(&long);
        assert!(name.len() <= MAX_FILENAME_BYTES);
        assert_eq!(name, "é".repeat(MAX_FILENAME_BYTES / 2));
    }

    #[test]
    fn keys_are_scoped_by_owner() {
        let key = storage_key(OwnerKind::Candidate, 17, "résumé.pdf");
        assert!(key.starts_with("candidate/17/"));
        assert!(key.ends_with("-résumé.pdf"));
    }

    #[test]
    fn keys_cannot_escape_root() {
        let store = LocalStore::new("/srv/uploads");
        assert!(store.path_for("../secret").is_err());
        assert!(store.path_for("/etc/passwd").is_err());
        assert_eq!(
            store.path_for("lead/1/a.txt").unwrap(),
            PathBuf::from("/srv/uploads/lead/1/a.txt")
        );
    }

    #[actix_web::test]
    async fn save_read_remove() {
        let root = std::env::temp_dir().join(format!("opsdash_store_{}", Uuid::new_v4()));
        let store = LocalStore::new(&root);
        let key = storage_key(OwnerKind::Lead, 3, "notes.txt");

        store
            .save(&key, web::Bytes::from_static(b"call back tuesday"))
            .await
            .unwrap();
        assert_eq!(store.read(&key).await.unwrap(), b"call back tuesday");

        store.remove(&key).await.unwrap();
        assert!(store.read(&key).await.is_err());
        // removing twice is fine
        store.remove(&key).await.unwrap();

        let _ = std::fs::remove_dir_all(root);
    }

    #[actix_web::test]
    async fn long_multibyte_name_is_stored() {
        let root = std::env::temp_dir().join(format!("opsdash_store_{}", Uuid::new_v4()));
        let store = LocalStore::new(&root);
        let key = storage_key(OwnerKind::Candidate, 1, &format!("{}.pdf", "é".repeat(130)));
        let file_name = key.rsplit('/').next().unwrap();
        assert!(file_name.len() <= 255, "{} bytes", file_name.len());

        store.save(&key, web::Bytes::from_static(b"%PDF")).await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), b"%PDF");

        let _ = std::fs::remove_dir_all(root);
    }
}
