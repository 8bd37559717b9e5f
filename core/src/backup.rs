use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub backup_path: Option<PathBuf>,
    pub final_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("백업 파일을 생성하지 못했습니다: {0}")]
    BackupCreate(String),
}

/// 임시 파일에 먼저 기록한 뒤 rename 으로 교체합니다.
///
/// 중간에 실패하면 대상 파일은 이전 상태 그대로 남습니다.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<WriteOutcome, BackupError> {
    write_with_backup(target, contents, false)
}

/// 기존 파일이 있으면 `<name>.bak.<timestamp>` 로 복사해 둔 뒤 교체합니다.
pub fn backup_and_swap(target: &Path, contents: &[u8]) -> Result<WriteOutcome, BackupError> {
    write_with_backup(target, contents, true)
}

fn write_with_backup(
    target: &Path,
    contents: &[u8],
    keep_backup: bool,
) -> Result<WriteOutcome, BackupError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let backup_path = if keep_backup && target.exists() {
        let candidate = build_backup_path(target);
        fs::copy(target, &candidate).map_err(|err| BackupError::BackupCreate(err.to_string()))?;
        Some(candidate)
    } else {
        None
    };

    let temp_path = build_temp_path(target);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    #[cfg(target_os = "windows")]
    {
        use std::io::ErrorKind;
        if let Err(err) = fs::rename(&temp_path, target) {
            if err.kind() == ErrorKind::AlreadyExists || err.kind() == ErrorKind::PermissionDenied {
                fs::remove_file(target)?;
                fs::rename(&temp_path, target)?;
            } else {
                return Err(BackupError::Io(err));
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        fs::rename(&temp_path, target)?;
    }

    Ok(WriteOutcome {
        backup_path,
        final_path: target.to_path_buf(),
    })
}

fn build_backup_path(target: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d%H%M%S");
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    target.with_file_name(format!("{name}.bak.{timestamp}"))
}

fn build_temp_path(target: &Path) -> PathBuf {
    let mut temp = target.to_path_buf();
    let suffix = format!(".__tmp__pid_{}", std::process::id());
    match temp.file_name() {
        Some(name) => {
            let mut os_string = name.to_os_string();
            os_string.push(suffix);
            temp.set_file_name(os_string);
        }
        None => {
            temp.push(format!("temp{suffix}"));
        }
    }
    temp
}
