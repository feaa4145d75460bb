use crate::megacmd::{remote_join, CommandRunner, Credentials, MegaCmd, MegaError, PutMode};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Upload failures, each mapped to its own process exit code.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    ToolMissing(MegaError),
    #[error(transparent)]
    Auth(MegaError),
    #[error("upload of {folder} failed: {source}")]
    Folder {
        folder: String,
        #[source]
        source: MegaError,
    },
}

impl UploadError {
    pub fn exit_code(&self) -> u8 {
        match self {
            UploadError::Aborted(_) => 1,
            UploadError::InvalidInput(_) => 2,
            UploadError::ToolMissing(_) => 3,
            UploadError::Auth(_) => 4,
            UploadError::Folder { .. } => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub targets: Vec<PathBuf>,
    pub dest: String,
    pub skip_if_exists: bool,
    pub dry_run: bool,
    pub queue: bool,
}

#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: Vec<PathBuf>,
    pub skipped: Vec<String>,
}

/// Targets that are missing or not directories, for an up-front rejection.
pub fn missing_targets(targets: &[PathBuf]) -> Vec<PathBuf> {
    targets.iter().filter(|p| !p.is_dir()).cloned().collect()
}

/// Log in (unless dry-run), then check and push each folder in order.
/// The first failure ends the run.
pub fn execute_plan<R, F>(
    mega: &MegaCmd<R>,
    plan: &UploadPlan,
    credentials: F,
) -> Result<UploadReport, UploadError>
where
    R: CommandRunner,
    F: FnOnce() -> anyhow::Result<Credentials>,
{
    if plan.skip_if_exists && !mega.has_ls() {
        return Err(UploadError::ToolMissing(MegaError::ToolMissing(
            "mega-ls".to_string(),
        )));
    }

    if !plan.dry_run {
        mega.ensure_login(credentials).map_err(UploadError::Auth)?;
    }

    let mode = PutMode {
        queue: plan.queue,
        dry_run: plan.dry_run,
    };
    let mut report = UploadReport::default();

    for folder in &plan.targets {
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if plan.skip_if_exists {
            let remote = remote_join(&plan.dest, &name);
            if plan.dry_run {
                println!("[dry-run] existence check: {remote}");
            } else if mega.remote_entry_exists(&remote).map_err(UploadError::Auth)? {
                println!("skip: already exists: {remote}");
                report.skipped.push(remote);
                continue;
            }
        }

        println!("uploading: {}", folder.display());
        mega.upload_folder(folder, &plan.dest, mode)
            .map_err(|source| UploadError::Folder {
                folder: folder.display().to_string(),
                source,
            })?;
        if !plan.dry_run {
            info!("queued {} -> {}", folder.display(), remote_join(&plan.dest, &name));
        }
        report.uploaded.push(folder.clone());
    }

    Ok(report)
}
