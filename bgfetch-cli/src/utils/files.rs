use std::path::{Path, PathBuf};

use url::Url;

use crate::error::AppError;

/// Creates all directories in the given path, including parent directories if they don't exist.
#[inline]
pub async fn create_dirs(path: &Path) -> Result<(), AppError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(AppError::Io)?;
    Ok(())
}

/// File name for a downloaded URL: its last non-empty path segment, or the
/// host when the path has none
pub fn file_name_for_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .map(str::to_owned)
        .or_else(|| url.host_str().map(str::to_owned))
        .unwrap_or_else(|| "download".to_owned())
}

/// Copy a finished download out of the cache into `output_dir`
pub async fn copy_to_output(
    cached: &Path,
    output_dir: &Path,
    url: &Url,
) -> Result<PathBuf, AppError> {
    let dest = output_dir.join(file_name_for_url(url));
    tokio::fs::copy(cached, &dest).await?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_for_url() {
        let name = |s: &str| file_name_for_url(&Url::parse(s).unwrap());
        assert_eq!(name("https://example.com/files/video.mp4"), "video.mp4");
        assert_eq!(name("https://example.com/files/"), "files");
        assert_eq!(name("https://example.com/"), "example.com");
        assert_eq!(name("https://example.com/a.bin?token=1"), "a.bin");
    }

    #[tokio::test]
    async fn test_copy_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("0f11");
        tokio::fs::write(&cached, "payload").await.unwrap();
        let out = dir.path().join("out");
        create_dirs(&out).await.unwrap();

        let url = Url::parse("https://example.com/data.txt").unwrap();
        let dest = copy_to_output(&cached, &out, &url).await.unwrap();

        assert_eq!(dest, out.join("data.txt"));
        assert_eq!(tokio::fs::read_to_string(dest).await.unwrap(), "payload");
    }
}
