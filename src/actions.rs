//! Built-in [`crate::workflow::RecoveryAction`] and
//! [`crate::workflow::StateValidator`] implementations (§6, §A.6): file
//! backup/restore compensations and simple state validators.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::BoxError;
use crate::workflow::{RecoveryAction, StateValidator};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

fn backup_path(original: &Path, action_id: &str) -> PathBuf {
    let mut name = original.as_os_str().to_owned();
    name.push(format!(".backup.{}", action_id));
    PathBuf::from(name)
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// On execute, copies `original` to `<original>.backup.<id>` (mode `0644`).
/// On rollback, copies the backup back over `original` and removes it.
pub struct FileBackupAction {
    id: String,
    original: PathBuf,
}

impl FileBackupAction {
    pub fn new(id: impl Into<String>, original: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), original: original.into() }
    }

    fn backup(&self) -> PathBuf {
        backup_path(&self.original, &self.id)
    }
}

#[async_trait]
impl RecoveryAction for FileBackupAction {
    async fn execute(&self, _cancel: &tokio_util::sync::CancellationToken) -> Result<(), BoxError> {
        let backup = self.backup();
        fs::copy(&self.original, &backup).await?;
        set_permissions(&backup, 0o644).await?;
        Ok(())
    }

    async fn rollback(&self, _cancel: &tokio_util::sync::CancellationToken) -> Result<(), BoxError> {
        let backup = self.backup();
        fs::copy(&backup, &self.original).await?;
        fs::remove_file(&backup).await?;
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "back up a file, restoring it on rollback"
    }
}

/// The inverse compensation: on execute, replaces `original` with its
/// `<original>.backup.<id>` counterpart (created by a prior
/// [`FileBackupAction`] or another process); on rollback, restores the
/// pre-restore contents from a second-order backup so the operation is
/// itself undoable.
pub struct FileRestoreAction {
    id: String,
    original: PathBuf,
}

impl FileRestoreAction {
    pub fn new(id: impl Into<String>, original: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), original: original.into() }
    }

    fn source_backup(&self) -> PathBuf {
        backup_path(&self.original, &self.id)
    }

    fn pre_restore_backup(&self) -> PathBuf {
        backup_path(&self.original, &format!("{}.pre-restore", self.id))
    }
}

#[async_trait]
impl RecoveryAction for FileRestoreAction {
    async fn execute(&self, _cancel: &tokio_util::sync::CancellationToken) -> Result<(), BoxError> {
        let pre_restore = self.pre_restore_backup();
        fs::copy(&self.original, &pre_restore).await?;
        set_permissions(&pre_restore, 0o644).await?;
        fs::copy(&self.source_backup(), &self.original).await?;
        Ok(())
    }

    async fn rollback(&self, _cancel: &tokio_util::sync::CancellationToken) -> Result<(), BoxError> {
        let pre_restore = self.pre_restore_backup();
        fs::copy(&pre_restore, &self.original).await?;
        fs::remove_file(&pre_restore).await?;
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "restore a file from backup, undoable via a pre-restore snapshot"
    }
}

/// Creates a directory (mode `0755`) on execute; removes it on rollback if
/// still empty.
pub struct DirectoryCreateAction {
    id: String,
    path: PathBuf,
}

impl DirectoryCreateAction {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), path: path.into() }
    }
}

#[async_trait]
impl RecoveryAction for DirectoryCreateAction {
    async fn execute(&self, _cancel: &tokio_util::sync::CancellationToken) -> Result<(), BoxError> {
        fs::create_dir_all(&self.path).await?;
        set_permissions(&self.path, 0o755).await?;
        Ok(())
    }

    async fn rollback(&self, _cancel: &tokio_util::sync::CancellationToken) -> Result<(), BoxError> {
        match fs::remove_dir(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "create a directory, removing it on rollback if empty"
    }
}

/// Rejects empty state strings.
pub struct NonEmptyStateValidator;

#[async_trait]
impl StateValidator for NonEmptyStateValidator {
    async fn validate(&self, state: &str) -> Result<(), BoxError> {
        if state.trim().is_empty() {
            Err(Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, "state must not be empty")))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &str {
        "non_empty"
    }
}

/// Wraps an arbitrary predicate as a named validator, for ad-hoc rules that
/// do not warrant a dedicated type.
pub struct PredicateStateValidator<F> {
    name: String,
    predicate: F,
}

impl<F> PredicateStateValidator<F>
where
    F: Fn(&str) -> bool + Send + Sync,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self { name: name.into(), predicate }
    }
}

#[async_trait]
impl<F> StateValidator for PredicateStateValidator<F>
where
    F: Fn(&str) -> bool + Send + Sync,
{
    async fn validate(&self, state: &str) -> Result<(), BoxError> {
        if (self.predicate)(state) {
            Ok(())
        } else {
            Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("state failed predicate '{}'", self.name),
            )))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn backup_then_rollback_restores_original_contents() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("data.txt");
        fs::write(&original, b"v1").await.unwrap();

        let action = FileBackupAction::new("a1", &original);
        let cancel = CancellationToken::new();
        action.execute(&cancel).await.unwrap();

        fs::write(&original, b"v2").await.unwrap();
        action.rollback(&cancel).await.unwrap();

        let contents = fs::read(&original).await.unwrap();
        assert_eq!(contents, b"v1");
        assert!(!action.backup().exists());
    }

    #[tokio::test]
    async fn directory_create_rolls_back_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let action = DirectoryCreateAction::new("d1", &target);
        let cancel = CancellationToken::new();
        action.execute(&cancel).await.unwrap();
        assert!(target.is_dir());
        action.rollback(&cancel).await.unwrap();
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn non_empty_validator_rejects_blank_state() {
        let validator = NonEmptyStateValidator;
        assert!(validator.validate("").await.is_err());
        assert!(validator.validate("ready").await.is_ok());
    }

    #[tokio::test]
    async fn predicate_validator_names_itself_in_error() {
        let validator = PredicateStateValidator::new("starts_with_ok", |s: &str| s.starts_with("ok"));
        let err = validator.validate("bad").await.unwrap_err();
        assert!(err.to_string().contains("starts_with_ok"));
    }
}
