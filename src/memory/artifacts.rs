// src/memory/artifacts.rs — On-disk storage for generated images
//
// Files are written atomically (temp file + rename) so a crash never leaves a
// half-written image behind a recorded locator.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::types::Variant;
use crate::infra::errors::PipelineResult;
use crate::provider::ImageArtifact;

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Images go under `<root>/images`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// `<label>_iter<k>_v<i>.<ext>`
    pub fn file_name(label: &str, iteration: u32, index: u32, content_type: &str) -> String {
        format!(
            "{}_iter{}_v{}.{}",
            sanitize_label(label),
            iteration,
            index,
            extension_for(content_type)
        )
    }

    /// Write the image and return its storage locator.
    pub fn save(
        &self,
        label: &str,
        iteration: u32,
        index: u32,
        artifact: &ImageArtifact,
    ) -> PipelineResult<String> {
        let dir = self.images_dir();
        std::fs::create_dir_all(&dir)?;

        let name = Self::file_name(label, iteration, index, &artifact.content_type);
        let tmp = dir.join(format!(".{name}.tmp"));
        let dst = dir.join(&name);

        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&artifact.bytes)?;
        f.flush()?;
        f.sync_all()?;
        std::fs::rename(&tmp, &dst)?;
        Ok(dst.to_string_lossy().into_owned())
    }

    /// Read a stored variant back for evaluation.
    pub fn load(&self, variant: &Variant) -> PipelineResult<ImageArtifact> {
        let bytes = std::fs::read(Path::new(&variant.storage_locator))?;
        Ok(ImageArtifact {
            bytes,
            width: variant.width,
            height: variant.height,
            content_type: variant.content_type.clone(),
            source_url: None,
        })
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "scene".into()
    } else {
        cleaned
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}
