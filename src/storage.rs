//! On-disk layout for received documents.
//!
//! Every completed session gets its own directory `session-<id>` under the
//! store root. The root is wiped at startup; archiving earlier documents is
//! left to the operator.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::errors::Result;
use crate::session::SessionId;

pub const DOCS_DIR: &str = "DocsDirectory";
pub const FALLBACK_DOCUMENT_NAME: &str = "document.bin";
const TEMP_PREFIX: &str = ".incoming-";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recreates the root directory empty.
    pub fn reset(&self) -> Result<()> {
        if self.root.exists() {
            info!("clearing documents under {}", self.root.display());
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn session_dir(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("session-{id}"))
    }

    /// Writes the document of session `id` and returns where it landed.
    ///
    /// The content goes to a temporary file first and is renamed into
    /// place, so a half-written document is never visible under its name.
    pub fn persist(
        &self,
        id: SessionId,
        document_name: &str,
        content: &[u8],
    ) -> Result<PathBuf> {
        let directory = self.session_dir(id);
        fs::create_dir_all(&directory)?;

        let target = directory.join(sanitize_file_name(document_name));
        let temp_name: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(10)
            .collect();
        let temp = directory.join(format!("{TEMP_PREFIX}{temp_name}"));

        let written = File::create(&temp).and_then(|mut file| {
            file.write_all(content)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&temp, &target)) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        debug!(
            "stored {} bytes for session {id} at {}",
            content.len(),
            target.display()
        );
        Ok(target)
    }
}

/// Reduces a submitter-provided name to a bare file name.
///
/// Both `/` and `\` count as separators since submitters may run on any
/// platform.
pub fn sanitize_file_name(name: &str) -> String {
    let candidate = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match candidate {
        "" | "." | ".." => FALLBACK_DOCUMENT_NAME.to_owned(),
        name if name.starts_with(TEMP_PREFIX) => {
            format!("_{name}")
        }
        name => name.to_owned(),
    }
}
