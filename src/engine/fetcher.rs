//! Artifact acquisition: download-and-extract for JSON deploys, raw zip
//! extraction for developer uploads.
//!
//! Both paths land in a fresh temporary directory owned by the caller; the
//! directory is removed when the handle drops, which is what guarantees
//! cleanup on success, failure and panic alike.

use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tracing::debug;
use zip::ZipArchive;

const MANIFEST_FILE: &str = "manifest.yml";

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `artifact_url`, extract it and write `manifest` (when
    /// non-empty) as `manifest.yml` into the extracted directory.
    async fn fetch(&self, artifact_url: &str, manifest: &str) -> Result<TempDir>;

    /// Extract an uploaded zip body into a fresh directory.
    async fn fetch_from_zip(&self, body: &[u8]) -> Result<TempDir>;
}

pub struct ArtifactFetcher {
    client: reqwest::Client,
}

impl ArtifactFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl Fetcher for ArtifactFetcher {
    async fn fetch(&self, artifact_url: &str, manifest: &str) -> Result<TempDir> {
        debug!(url = artifact_url, "fetching artifact");

        let response = self
            .client
            .get(artifact_url)
            .send()
            .await
            .with_context(|| format!("cannot fetch artifact: {artifact_url}"))?;
        if !response.status().is_success() {
            bail!(
                "cannot fetch artifact: {artifact_url} returned {}",
                response.status()
            );
        }
        let body = response
            .bytes()
            .await
            .with_context(|| format!("cannot fetch artifact: {artifact_url}"))?;

        let dir = extract_to_temp_dir(&body)
            .await
            .context("invalid artifact")?;

        if !manifest.is_empty() {
            tokio::fs::write(dir.path().join(MANIFEST_FILE), manifest)
                .await
                .context("cannot write manifest into artifact directory")?;
        }

        Ok(dir)
    }

    async fn fetch_from_zip(&self, body: &[u8]) -> Result<TempDir> {
        extract_to_temp_dir(body).await
    }
}

async fn extract_to_temp_dir(body: &[u8]) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("deploy-")
        .tempdir()
        .context("failed to create extraction directory")?;

    let destination = dir.path().to_path_buf();
    let body = body.to_vec();

    // the zip crate is synchronous; keep it off the async workers
    tokio::task::spawn_blocking(move || extract_archive(&body, &destination))
        .await
        .context("extraction task failed")??;

    Ok(dir)
}

fn extract_archive(body: &[u8], destination: &Path) -> Result<()> {
    let mut archive =
        ZipArchive::new(Cursor::new(body)).context("failed to open archive")?;
    if archive.len() == 0 {
        bail!("archive contains no files");
    }

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .context("failed to read file from archive")?;
        let name = entry.name().to_string();

        if name.contains("..") || name.starts_with('/') || name.starts_with('\\') {
            bail!("archive entry escapes the extraction directory: {name}");
        }
        let out_path = destination.join(&name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create directory {name}"))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create parent directory for {name}"))?;
        }
        let mut file = std::fs::File::create(&out_path)
            .with_context(|| format!("failed to create {name}"))?;
        std::io::copy(&mut entry, &mut file)
            .with_context(|| format!("failed to write {name}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::io::Write;

    fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    async fn serve_artifact(body: Vec<u8>) -> String {
        let app = axum::Router::new().route(
            "/app.jar",
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/app.jar")
    }

    #[tokio::test]
    async fn fetch_downloads_extracts_and_writes_the_manifest() {
        let archive = build_zip(&[
            ("index.js", b"console.log('hi')".as_slice()),
            ("lib/util.js", b"module.exports = {}".as_slice()),
        ]);
        let url = serve_artifact(archive).await;

        let fetcher = ArtifactFetcher::new().unwrap();
        let manifest = "---\napplications:\n- name: orders\n";
        let dir = fetcher.fetch(&url, manifest).await.unwrap();

        assert!(dir.path().join("index.js").exists());
        assert!(dir.path().join("lib/util.js").exists());
        let written = std::fs::read_to_string(dir.path().join("manifest.yml")).unwrap();
        assert_eq!(written, manifest);
    }

    #[tokio::test]
    async fn fetch_without_manifest_writes_none() {
        let archive = build_zip(&[("index.js", b"1".as_slice())]);
        let url = serve_artifact(archive).await;

        let fetcher = ArtifactFetcher::new().unwrap();
        let dir = fetcher.fetch(&url, "").await.unwrap();
        assert!(!dir.path().join("manifest.yml").exists());
    }

    #[tokio::test]
    async fn fetch_reports_http_failures() {
        let app = axum::Router::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let fetcher = ArtifactFetcher::new().unwrap();
        let err = fetcher
            .fetch(&format!("http://{addr}/missing.jar"), "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot fetch artifact"));
    }

    #[tokio::test]
    async fn fetch_from_zip_extracts_the_upload() {
        let archive = build_zip(&[
            ("manifest.yml", b"---\napplications: []\n".as_slice()),
            ("src/main.go", b"package main".as_slice()),
        ]);

        let fetcher = ArtifactFetcher::new().unwrap();
        let dir = fetcher.fetch_from_zip(&archive).await.unwrap();
        assert!(dir.path().join("manifest.yml").exists());
        assert!(dir.path().join("src/main.go").exists());
    }

    #[tokio::test]
    async fn empty_archives_are_rejected() {
        let archive = build_zip(&[]);
        let fetcher = ArtifactFetcher::new().unwrap();
        let err = fetcher.fetch_from_zip(&archive).await.unwrap_err();
        assert!(err.to_string().contains("no files"));
    }

    #[tokio::test]
    async fn garbage_bytes_are_rejected() {
        let fetcher = ArtifactFetcher::new().unwrap();
        let err = fetcher.fetch_from_zip(b"definitely not a zip").await.unwrap_err();
        assert!(err.to_string().contains("failed to open archive"));
    }

    #[tokio::test]
    async fn path_traversal_entries_are_rejected() {
        let archive = build_zip(&[("../evil.txt", b"pwned".as_slice())]);
        let fetcher = ArtifactFetcher::new().unwrap();
        let err = fetcher.fetch_from_zip(&archive).await.unwrap_err();
        assert!(err.to_string().contains("escapes the extraction directory"));
    }

    #[tokio::test]
    async fn extraction_directory_is_removed_on_drop() {
        let archive = build_zip(&[("file.txt", b"contents".as_slice())]);
        let fetcher = ArtifactFetcher::new().unwrap();
        let dir = fetcher.fetch_from_zip(&archive).await.unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.exists());
        drop(dir);
        assert!(!path.exists());
    }
}
