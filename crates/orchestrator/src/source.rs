use std::fs;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;
use uuid::Uuid;

/// Where a deployment's project comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentSource {
    /// A gzip-compressed tar archive uploaded by the requester.
    Upload { archive_path: PathBuf },
    /// A git repository cloned at default-branch HEAD.
    Repository { url: String },
}

impl DeploymentSource {
    pub fn description(&self) -> String {
        match self {
            DeploymentSource::Upload { archive_path } => {
                let name = archive_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| archive_path.display().to_string());
                format!("upload:{name}")
            }
            DeploymentSource::Repository { url } => format!("repository:{url}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("invalid archive {path}: {message}")]
    InvalidArchive { path: String, message: String },
    #[error("archive entry '{entry}' escapes the extraction directory")]
    PathTraversal { entry: String },
    #[error("malformed repository url '{url}': {message}")]
    MalformedUrl { url: String, message: String },
    #[error("failed to clone {url}: {source}")]
    CloneFailed {
        url: String,
        #[source]
        source: git2::Error,
    },
    #[error("workspace i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Materialize the project for `deployment_id` into a fresh directory under
/// `workspace_root` and return it. The uploaded archive is deleted after a
/// successful extraction; the workspace survives until teardown. On failure
/// the partially-populated workspace is removed.
pub async fn acquire(
    deployment_id: Uuid,
    source: &DeploymentSource,
    workspace_root: &Path,
) -> Result<PathBuf, AcquireError> {
    let dest = workspace_root.join(deployment_id.to_string());
    let source = source.clone();
    let result = tokio::task::spawn_blocking({
        let dest = dest.clone();
        move || acquire_blocking(&source, &dest)
    })
    .await
    .map_err(|err| AcquireError::Io(std::io::Error::other(err)))?;

    match result {
        Ok(()) => Ok(dest),
        Err(err) => {
            let _ = fs::remove_dir_all(&dest);
            Err(err)
        }
    }
}

fn acquire_blocking(source: &DeploymentSource, dest: &Path) -> Result<(), AcquireError> {
    fs::create_dir_all(dest)?;
    match source {
        DeploymentSource::Upload { archive_path } => {
            extract_archive(archive_path, dest)?;
            fs::remove_file(archive_path)?;
            Ok(())
        }
        DeploymentSource::Repository { url } => clone_repository(url, dest),
    }
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<(), AcquireError> {
    let invalid = |message: String| AcquireError::InvalidArchive {
        path: archive_path.display().to_string(),
        message,
    };

    let file = fs::File::open(archive_path)
        .map_err(|err| invalid(format!("cannot open archive: {err}")))?;
    let gz = GzDecoder::new(file);
    let mut archive = tar::Archive::new(gz);

    let entries = archive
        .entries()
        .map_err(|err| invalid(format!("not a gzip-compressed tar archive: {err}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|err| invalid(format!("corrupt archive entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| invalid(format!("unreadable entry path: {err}")))?
            .into_owned();

        // Every entry must resolve inside the extraction directory.
        if path.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        }) {
            return Err(AcquireError::PathTraversal {
                entry: path.display().to_string(),
            });
        }

        entry
            .unpack_in(dest)
            .map_err(|err| invalid(format!("failed to unpack '{}': {err}", path.display())))?;
    }

    Ok(())
}

fn clone_repository(url: &str, dest: &Path) -> Result<(), AcquireError> {
    url::Url::parse(url).map_err(|err| AcquireError::MalformedUrl {
        url: url.to_string(),
        message: err.to_string(),
    })?;

    git2::Repository::clone(url, dest)
        .map(|_| ())
        .map_err(|source| AcquireError::CloneFailed {
            url: url.to_string(),
            source,
        })
}
