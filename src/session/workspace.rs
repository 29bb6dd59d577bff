use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::environment::EnvironmentDescriptor;

use super::SessionError;

/// Sandbox runtimes may run under another uid and need read/write access
const WORKSPACE_DIR_PERMISSIONS: u32 = 0o777;
const SOURCE_FILE_PERMISSIONS: u32 = 0o666;

/// Scratch directory owned by exactly one session
///
/// The directory is removed by [`Workspace::teardown`]. If the owner is dropped
/// before that (panic, cancelled future), `Drop` removes it synchronously.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Creates `<root>/<session_id>` and writes the source file into it
    ///
    /// The session directory is created non-recursively, so an existing path
    /// fails the call instead of being shared between sessions.
    pub fn prepare(
        root: &Path,
        session_id: &str,
        descriptor: &EnvironmentDescriptor,
        source_code: &str,
    ) -> Result<Self, SessionError> {
        fs::create_dir_all(root).map_err(|e| workspace_error("create root", root, e))?;

        let path = root.join(session_id);
        fs::create_dir(&path).map_err(|e| workspace_error("create", &path, e))?;
        // From here on, failures must still remove the directory
        let workspace = Self {
            path,
            removed: false,
        };

        fs::set_permissions(
            &workspace.path,
            fs::Permissions::from_mode(WORKSPACE_DIR_PERMISSIONS),
        )
        .map_err(|e| workspace_error("chmod", &workspace.path, e))?;

        let source_path = workspace.source_path(descriptor);
        fs::write(&source_path, source_code)
            .map_err(|e| workspace_error("write", &source_path, e))?;
        fs::set_permissions(
            &source_path,
            fs::Permissions::from_mode(SOURCE_FILE_PERMISSIONS),
        )
        .map_err(|e| workspace_error("chmod", &source_path, e))?;

        log::debug!("Prepared workspace {}", workspace.path.display());
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_path(&self, descriptor: &EnvironmentDescriptor) -> PathBuf {
        self.path.join(&descriptor.file_name)
    }

    /// Removes the directory; a directory that is already gone is not an error
    pub async fn teardown(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.removed = true;
        log::debug!("Removed workspace {}", self.path.display());
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::warn!(
                "Workspace {} removed on drop without teardown",
                self.path.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!(
                "Failed to remove workspace {}, directory leaked: {e}",
                self.path.display()
            ),
        }
    }
}

fn workspace_error(action: &str, path: &Path, e: io::Error) -> SessionError {
    SessionError::Workspace(format!("{action} {}: {e}", path.display()))
}
