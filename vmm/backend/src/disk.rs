//! Base and diff disk preparation.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{event, instrument, Level};

use mdn_downloader::{Digest, Options};

use crate::process::run_tool;
use crate::BaseDriver;

/// Byte offset of the primary volume descriptor's standard identifier.
const ISO9660_MAGIC_OFFSET: u64 = 0x8001;
const ISO9660_MAGIC: &[u8; 5] = b"CD001";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
struct QemuImgInfo {
    format: String,
    virtual_size: u64,
    backing_filename: Option<PathBuf>,
}

pub async fn is_iso9660(path: &Path) -> Result<bool> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {path:?}"))?;
    let len = file.metadata().await?.len();
    if len < ISO9660_MAGIC_OFFSET + ISO9660_MAGIC.len() as u64 {
        return Ok(false);
    }
    file.seek(std::io::SeekFrom::Start(ISO9660_MAGIC_OFFSET))
        .await?;
    let mut magic = [0u8; 5];
    file.read_exact(&mut magic).await?;
    Ok(&magic == ISO9660_MAGIC)
}

/// Create (or truncate) `path` as a sparse file of `size` bytes.
pub async fn make_sparse(path: &Path, size: u64) -> Result<()> {
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create sparse disk {path:?}"))?;
    file.set_len(size)
        .await
        .with_context(|| format!("resize sparse disk {path:?} to {size} bytes"))
}

async fn qemu_img_info(qemu_img: &Path, image: &Path) -> Result<QemuImgInfo> {
    let output = run_tool(
        tokio::process::Command::new(qemu_img)
            .arg("info")
            .arg("--output=json")
            .arg("--")
            .arg(image),
    )
    .await
    .with_context(|| format!("Failed to query image metadata for {image:?}"))?;

    serde_json::from_slice(&output).with_context(|| {
        format!(
            "Failed to parse `qemu-img info` output for {:?}: {:?}",
            image,
            String::from_utf8_lossy(&output),
        )
    })
}

/// Convert `src` into a raw image at `dst`, grown to at least `size` bytes.
/// Raw sources are copied as-is. Sources with a backing file are refused.
#[instrument(skip(qemu_img), err(Debug, level = Level::WARN))]
pub async fn convert_to_raw(qemu_img: &Path, src: &Path, dst: &Path, size: u64) -> Result<()> {
    let info = qemu_img_info(qemu_img, src).await?;
    if let Some(backing) = info.backing_filename {
        bail!("image {src:?} has a backing file ({backing:?}), refusing to convert");
    }

    let tmp = dst.with_extension("img.tmp");
    if info.format == "raw" {
        event!(Level::DEBUG, ?src, ?dst, "Source is already raw, copying");
        tokio::fs::copy(src, &tmp)
            .await
            .with_context(|| format!("copy {src:?} to {tmp:?}"))?;
    } else {
        event!(Level::INFO, ?src, format = %info.format, "Converting image to raw");
        run_tool(
            tokio::process::Command::new(qemu_img)
                .arg("convert")
                .arg("-O")
                .arg("raw")
                .arg(src)
                .arg(&tmp),
        )
        .await
        .with_context(|| format!("Failed to convert {src:?} to a raw disk"))?;
    }

    // Never shrink below the image's own virtual size:
    let size = size.max(info.virtual_size);
    let file = tokio::fs::OpenOptions::new().write(true).open(&tmp).await?;
    if file.metadata().await?.len() < size {
        file.set_len(size).await?;
    }
    std::mem::drop(file);

    tokio::fs::rename(&tmp, dst)
        .await
        .with_context(|| format!("rename {tmp:?} into {dst:?}"))
}

/// Download the machine's base disk unless it is already there.
#[instrument(skip(base), fields(machine = %base.machine.name), err(Debug, level = Level::WARN))]
pub async fn ensure_base_disk(base: &BaseDriver) -> Result<()> {
    let base_disk = base.dir.base_disk();
    if tokio::fs::try_exists(&base_disk).await? {
        return Ok(());
    }

    let spec = base.spec();
    let image = base
        .image
        .as_ref()
        .ok_or_else(|| anyhow!("unexpected image name: [{}]", spec.image.name))?;
    if image.arch != spec.arch() {
        bail!(
            "{:?}: unsupported arch: {:?}, expected={:?}",
            image.location,
            image.arch,
            spec.arch()
        );
    }

    let expected: Option<Digest> = image
        .digest
        .as_deref()
        .map(str::parse::<Digest>)
        .transpose()
        .with_context(|| format!("invalid digest for image {}", spec.image.name))?;
    let file_name = image
        .location
        .rsplit('/')
        .next()
        .unwrap_or(image.location.as_str());

    let mut opts = Options::default()
        .with_decompress(true)
        .with_description(format!("guest vm image ({file_name})"))
        .with_expected_digest(expected);
    if let Some(ref cache) = base.cache_dir {
        opts = opts.with_cache_dir(cache);
    }

    let res = mdn_downloader::download(Some(base_disk.as_path()), &image.location, &opts)
        .await
        .with_context(|| format!("failed to download {:?}", image.location))?;
    event!(
        Level::INFO,
        image = %spec.image.name,
        location = %image.location,
        status = ?res.status,
        "Downloaded base disk"
    );
    Ok(())
}

/// Ensure both disks of a machine exist. ISO base images get an empty sparse
/// data disk; anything else is converted into a raw diff disk of the
/// requested capacity.
#[instrument(skip(base), fields(machine = %base.machine.name), err(Debug, level = Level::WARN))]
pub async fn ensure_disk(base: &BaseDriver) -> Result<()> {
    let diff_disk = base.dir.diff_disk();
    if tokio::fs::try_exists(&diff_disk).await? {
        return Ok(());
    }

    ensure_base_disk(base).await?;

    let size = base.spec().disk_bytes()?;
    if size == 0 {
        return Ok(());
    }

    let base_disk = base.dir.base_disk();
    if is_iso9660(&base_disk).await? {
        event!(Level::DEBUG, ?diff_disk, size, "Base disk is an ISO, creating sparse data disk");
        return make_sparse(&diff_disk, size).await;
    }

    convert_to_raw(&base.backend.qemu_img_binary, &base_disk, &diff_disk, size)
        .await
        .with_context(|| format!("failed to convert {base_disk:?} to a raw disk {diff_disk:?}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_iso_detection() {
        let dir = tempfile::tempdir().unwrap();

        let iso = dir.path().join("a.iso");
        let mut data = vec![0u8; 0x8800];
        data[0x8001..0x8006].copy_from_slice(b"CD001");
        std::fs::write(&iso, &data).unwrap();
        assert!(is_iso9660(&iso).await.unwrap());

        let raw = dir.path().join("b.img");
        std::fs::write(&raw, vec![0u8; 0x8800]).unwrap();
        assert!(!is_iso9660(&raw).await.unwrap());

        let tiny = dir.path().join("c.img");
        std::fs::write(&tiny, b"CD001").unwrap();
        assert!(!is_iso9660(&tiny).await.unwrap());
    }

    #[tokio::test]
    async fn test_make_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("diff.img");
        make_sparse(&disk, 64 << 20).await.unwrap();
        assert_eq!(std::fs::metadata(&disk).unwrap().len(), 64 << 20);
    }

    #[test]
    fn test_parse_qemu_img_info() {
        let info: QemuImgInfo = serde_json::from_str(
            r#"{"virtual-size": 2361393152, "filename": "noble.img", "format": "qcow2",
                "actual-size": 594812928, "dirty-flag": false}"#,
        )
        .unwrap();
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.virtual_size, 2361393152);
        assert!(info.backing_filename.is_none());
    }
}
