//! Durable storage for finished images plus a small object store for video
//! inputs. `LocalGallery` keeps everything under the session directory.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use duky_contracts::tools::ToolKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::{extension_for_mime, now_utc_iso, to_data_url};

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryImage {
    pub tool: ToolKey,
    pub label: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub trait GallerySink: Send + Sync {
    /// Stores `images` and returns one URL per image, in order. With
    /// `persist` off nothing is written and inline `data:` URLs come back.
    fn add_images(&self, images: &[GalleryImage], persist: bool) -> Result<Vec<String>>;
}

pub trait ObjectStorage: Send + Sync {
    fn upload(&self, bytes: &[u8], mime_type: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub url: String,
    pub tool: ToolKey,
    pub label: String,
    pub mime_type: String,
    pub sha256: String,
    pub created_at: String,
}

pub struct LocalGallery {
    dir: PathBuf,
    uploads_dir: PathBuf,
    index_path: PathBuf,
    index_lock: Mutex<()>,
}

impl LocalGallery {
    pub fn open(session_dir: &Path) -> Result<Self> {
        let dir = session_dir.join("gallery");
        let uploads_dir = session_dir.join("uploads");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            index_path: session_dir.join("gallery.json"),
            dir,
            uploads_dir,
            index_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entries newest first.
    pub fn list(&self) -> Result<Vec<GalleryEntry>> {
        if !self.index_path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.index_path)
            .with_context(|| format!("failed reading {}", self.index_path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid gallery index {}", self.index_path.display()))
    }

    /// Copies every stored image into `dest` and returns the new paths.
    pub fn export(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut written = Vec::new();
        for (idx, entry) in self.list()?.iter().rev().enumerate() {
            let source = PathBuf::from(&entry.url);
            let ext = extension_for_mime(&entry.mime_type);
            let target = dest.join(format!("{:03}-{}.{ext}", idx + 1, entry.tool));
            std::fs::copy(&source, &target).with_context(|| {
                format!("failed to export {} to {}", source.display(), target.display())
            })?;
            written.push(target);
        }
        Ok(written)
    }

    fn write_index(&self, entries: &[GalleryEntry]) -> Result<()> {
        std::fs::write(&self.index_path, serde_json::to_string_pretty(entries)?)
            .with_context(|| format!("failed writing {}", self.index_path.display()))
    }
}

impl GallerySink for LocalGallery {
    fn add_images(&self, images: &[GalleryImage], persist: bool) -> Result<Vec<String>> {
        if !persist {
            return Ok(images
                .iter()
                .map(|image| to_data_url(&image.mime_type, &image.bytes))
                .collect());
        }

        let _guard = match self.index_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut entries = self.list()?;
        let mut urls = Vec::with_capacity(images.len());
        for image in images {
            let digest = hex::encode(Sha256::digest(&image.bytes));
            if let Some(existing) = entries.iter().find(|entry| entry.sha256 == digest) {
                urls.push(existing.url.clone());
                continue;
            }
            let path = self.dir.join(format!(
                "{}-{}.{}",
                image.tool,
                &digest[..12],
                extension_for_mime(&image.mime_type)
            ));
            std::fs::write(&path, &image.bytes)
                .with_context(|| format!("failed writing {}", path.display()))?;
            let url = path.to_string_lossy().into_owned();
            entries.insert(
                0,
                GalleryEntry {
                    url: url.clone(),
                    tool: image.tool,
                    label: image.label.clone(),
                    mime_type: image.mime_type.clone(),
                    sha256: digest,
                    created_at: now_utc_iso(),
                },
            );
            urls.push(url);
        }
        self.write_index(&entries)?;
        Ok(urls)
    }
}

impl ObjectStorage for LocalGallery {
    fn upload(&self, bytes: &[u8], mime_type: &str) -> Result<String> {
        std::fs::create_dir_all(&self.uploads_dir)
            .with_context(|| format!("failed to create {}", self.uploads_dir.display()))?;
        let digest = hex::encode(Sha256::digest(bytes));
        let path = self
            .uploads_dir
            .join(format!("{}.{}", &digest[..16], extension_for_mime(mime_type)));
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use duky_contracts::tools::ToolKey;

    use super::*;

    fn image(bytes: &[u8]) -> GalleryImage {
        GalleryImage {
            tool: ToolKey::PosterCreator,
            label: "Style: studio_professional - Variation 1".to_string(),
            bytes: bytes.to_vec(),
            mime_type: "image/png".to_string(),
        }
    }

    #[test]
    fn persisted_images_are_indexed_newest_first_and_deduplicated() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gallery = LocalGallery::open(temp.path())?;
        let first = gallery.add_images(&[image(b"one")], true)?;
        let second = gallery.add_images(&[image(b"two"), image(b"one")], true)?;
        assert_eq!(second[1], first[0]);

        let entries = gallery.list()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, second[0]);
        assert_eq!(std::fs::read(&entries[1].url)?, b"one");
        Ok(())
    }

    #[test]
    fn unpersisted_images_stay_inline() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gallery = LocalGallery::open(temp.path())?;
        let urls = gallery.add_images(&[image(b"x")], false)?;
        assert!(urls[0].starts_with("data:image/png;base64,"));
        assert!(gallery.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn export_copies_in_creation_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gallery = LocalGallery::open(&temp.path().join("session"))?;
        gallery.add_images(&[image(b"a"), image(b"b")], true)?;
        let exported = gallery.export(&temp.path().join("out"))?;
        assert_eq!(exported.len(), 2);
        assert_eq!(std::fs::read(&exported[0])?, b"a");
        assert!(exported[0].ends_with("001-poster-creator.png"));
        Ok(())
    }

    #[test]
    fn uploads_land_in_their_own_folder() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let gallery = LocalGallery::open(temp.path())?;
        let url = gallery.upload(b"jpeg", "image/jpeg")?;
        assert!(url.contains("uploads"));
        assert!(url.ends_with(".jpg"));
        Ok(())
    }
}
