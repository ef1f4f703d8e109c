//! Fetch remote files into a content-addressed on-disk cache.
//!
//! Every remote URL gets its own cache directory, named after the SHA-256 of
//! the URL, holding:
//!
//! - `url`: the URL itself
//! - `data`: the downloaded bytes
//! - `time` / `type`: `Last-Modified` and `Content-Type` of the response
//! - `<algorithm>.digest`: the digest the data was validated against
//!
//! When a cache entry carries a digest file, reuse compares that stored
//! string against the expected digest instead of re-hashing `data`.
//! Interrupted transfers leave a `data.tmp` behind; if the server announced
//! range support (recorded in a `data.tmp.accept-ranges` marker), the next
//! attempt resumes it with a `Range` request.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use sha2::Digest as _;
use tokio::io::AsyncWriteExt;
use tracing::{event, instrument, Level};

use meridian_rs::util::{digest_tree_path, expand_home};

pub mod digest;
pub mod progress;

pub use digest::{Algorithm, Digest, DigestMismatch};
use progress::{Progress, ProgressReader};

/// Maximum number of bytes of an error response body kept for the error
/// message.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Downloaded,
    /// The local path already existed. No digest validation happened.
    Skipped,
    UsedCache,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub status: Status,
    pub cache_path: Option<PathBuf>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub validated_digest: bool,
}

impl DownloadResult {
    fn new(status: Status, validated_digest: bool) -> Self {
        DownloadResult {
            status,
            cache_path: None,
            last_modified: None,
            content_type: None,
            validated_digest,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Caching is disabled when unset.
    pub cache_dir: Option<PathBuf>,
    /// Decompress (or untar) the data into the local path, based on the
    /// URL's extension.
    pub decompress: bool,
    pub description: Option<String>,
    pub expected_digest: Option<Digest>,
}

impl Options {
    /// Cache under the user's cache directory (`~/.cache/meridian` or the
    /// platform equivalent).
    pub fn with_user_cache(self) -> Result<Self> {
        let cache = dirs::cache_dir().ok_or_else(|| anyhow!("no user cache directory"))?;
        Ok(self.with_cache_dir(cache.join("meridian")))
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_expected_digest(mut self, digest: Option<Digest>) -> Self {
        self.expected_digest = digest;
        self
    }

    fn description_for(&self, remote: &str) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| remote.to_string())
    }
}

/// Whether `s` names a local file rather than a remote URL.
pub fn is_local(s: &str) -> bool {
    !s.contains("://") || s.starts_with("file://")
}

fn canonical_local_path(s: &str) -> Result<PathBuf> {
    if s.is_empty() {
        bail!("got empty path");
    }
    if !is_local(s) {
        bail!("got non-local path {s:?}");
    }
    if let Some(rest) = s.strip_prefix("file://") {
        let path = PathBuf::from(rest);
        if !path.is_absolute() {
            bail!("got non-absolute path {rest:?}");
        }
        return Ok(path);
    }
    let expanded = expand_home(s);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()
            .context("resolve relative path")?
            .join(expanded))
    }
}

/// Cache directory for one remote URL.
pub fn cache_entry_dir(cache_dir: &Path, remote: &str) -> PathBuf {
    let url_sha = sha2::Sha256::digest(remote.as_bytes());
    digest_tree_path(cache_dir.join("download").join("by-url-sha256"), &url_sha, 0)
}

fn cache_digest_path(entry: &Path, expected: &Digest) -> PathBuf {
    entry.join(format!("{}.digest", expected.algorithm()))
}

async fn read_optional(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Compare a cache entry's stored digest string against the expected one.
async fn validate_cached_digest(digest_file: &Path, expected: &Digest) -> Result<()> {
    let stored = tokio::fs::read_to_string(digest_file)
        .await
        .with_context(|| format!("read cached digest {digest_file:?}"))?;
    let stored = stored.trim();
    if stored != expected.to_string() {
        return Err(DigestMismatch {
            expected: expected.to_string(),
            actual: stored.to_string(),
        }
        .into());
    }
    Ok(())
}

async fn validate_local_file_digest(path: &Path, expected: Option<&Digest>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    event!(Level::INFO, ?path, %expected, "Verifying digest of local file");
    let actual = Digest::of_file(expected.algorithm(), path).await?;
    expected.verify(&actual)?;
    Ok(())
}

/// Download `remote` into `local`.
///
/// With `local == None` the download only populates the cache ("caching-only
/// mode"), which requires a cache directory. If `local` already exists, the
/// call returns [`Status::Skipped`] without validating its digest. Local
/// sources (plain paths and `file://` URLs) are copied, never cached.
#[instrument(skip(opts), fields(cache_dir = ?opts.cache_dir), err(Debug, level = Level::WARN))]
pub async fn download(local: Option<&Path>, remote: &str, opts: &Options) -> Result<DownloadResult> {
    let validated = opts.expected_digest.is_some();

    let local_path = match local {
        None => {
            if opts.cache_dir.is_none() {
                bail!("caching-only mode requires the cache directory to be specified");
            }
            None
        }
        Some(local) => {
            let local_path = canonical_local_path(&local.to_string_lossy())?;
            match tokio::fs::metadata(&local_path).await {
                Ok(_) => {
                    event!(
                        Level::INFO,
                        ?local_path,
                        remote,
                        "File already exists, skipping download (and digest validation)"
                    );
                    return Ok(DownloadResult::new(Status::Skipped, false));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(e).with_context(|| format!("stat {local_path:?}")),
            }
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create directory {parent:?}"))?;
            }
            Some(local_path)
        }
    };

    let ext = extension_of(remote);

    if is_local(remote) {
        copy_local(
            local_path.as_deref(),
            remote,
            &ext,
            opts.decompress,
            &opts.description_for(remote),
            opts.expected_digest.as_ref(),
        )
        .await?;
        return Ok(DownloadResult::new(Status::Downloaded, validated));
    }

    let Some(ref cache_dir) = opts.cache_dir else {
        // No cache: fetch right next to the destination.
        let local_path = local_path.ok_or_else(|| anyhow!("no local path given"))?;
        let staging = path_with_suffix(&local_path, ".download");
        fetch(remote, &staging, opts.expected_digest.as_ref(), &opts.description_for(remote))
            .await?;
        let staging_str = staging.to_string_lossy().to_string();
        let res = copy_local(
            Some(&local_path),
            &staging_str,
            &ext,
            opts.decompress,
            &opts.description_for(remote),
            None,
        )
        .await;
        remove_quietly(&staging).await;
        res?;
        return Ok(DownloadResult::new(Status::Downloaded, validated));
    };

    let entry = cache_entry_dir(cache_dir, remote);
    let data = entry.join("data");
    let data_str = data.to_string_lossy().to_string();

    if tokio::fs::metadata(&data).await.is_ok() {
        event!(Level::INFO, ?local_path, cached = ?data, "File is cached");
        let stored_digest = match opts.expected_digest {
            Some(ref expected) => {
                let digest_file = cache_digest_path(&entry, expected);
                match tokio::fs::metadata(&digest_file).await {
                    Ok(_) => Some((expected, digest_file)),
                    Err(_) => None,
                }
            }
            None => None,
        };
        match stored_digest {
            Some((expected, digest_file)) => {
                event!(
                    Level::INFO,
                    %expected,
                    "Comparing expected digest with the cached digest file, not computing the actual digest",
                );
                validate_cached_digest(&digest_file, expected).await?;
                copy_local(local_path.as_deref(), &data_str, &ext, opts.decompress, "", None)
                    .await?;
            }
            None => {
                copy_local(
                    local_path.as_deref(),
                    &data_str,
                    &ext,
                    opts.decompress,
                    &opts.description_for(remote),
                    opts.expected_digest.as_ref(),
                )
                .await?;
            }
        }
        return Ok(result_from_cache(Status::UsedCache, &entry, validated).await);
    }

    tokio::fs::create_dir_all(&entry)
        .await
        .with_context(|| format!("create cache entry {entry:?}"))?;
    tokio::fs::write(entry.join("url"), remote)
        .await
        .with_context(|| format!("write url file in {entry:?}"))?;

    let meta = fetch(
        remote,
        &data,
        opts.expected_digest.as_ref(),
        &opts.description_for(remote),
    )
    .await?;
    if let Some(ref last_modified) = meta.last_modified {
        write_cache_info(&entry.join("time"), last_modified).await;
    }
    if let Some(ref content_type) = meta.content_type {
        write_cache_info(&entry.join("type"), content_type).await;
    }

    // Already verified while streaming:
    copy_local(local_path.as_deref(), &data_str, &ext, opts.decompress, "", None).await?;

    if let Some(ref expected) = opts.expected_digest {
        tokio::fs::write(cache_digest_path(&entry, expected), expected.to_string())
            .await
            .with_context(|| format!("write digest file in {entry:?}"))?;
    }

    Ok(result_from_cache(Status::Downloaded, &entry, validated).await)
}

/// Check whether `remote` is in the cache, validating its digest.
#[instrument(skip(opts), err(Debug, level = Level::DEBUG))]
pub async fn cached(remote: &str, opts: &Options) -> Result<DownloadResult> {
    let Some(ref cache_dir) = opts.cache_dir else {
        bail!("caching-only mode requires the cache directory to be specified");
    };
    if is_local(remote) {
        bail!("local files are not cached");
    }

    let entry = cache_entry_dir(cache_dir, remote);
    let data = entry.join("data");
    tokio::fs::metadata(&data)
        .await
        .with_context(|| format!("{remote} is not cached"))?;

    if let Some(ref expected) = opts.expected_digest {
        let digest_file = cache_digest_path(&entry, expected);
        if tokio::fs::metadata(&digest_file).await.is_ok() {
            validate_cached_digest(&digest_file, expected).await?;
        } else {
            validate_local_file_digest(&data, Some(expected)).await?;
        }
    }

    Ok(result_from_cache(Status::UsedCache, &entry, opts.expected_digest.is_some()).await)
}

async fn result_from_cache(status: Status, entry: &Path, validated: bool) -> DownloadResult {
    DownloadResult {
        status,
        cache_path: Some(entry.join("data")),
        last_modified: read_optional(&entry.join("time")).await,
        content_type: read_optional(&entry.join("type")).await,
        validated_digest: validated,
    }
}

async fn write_cache_info(path: &Path, content: &str) {
    if content.is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::write(path, content).await {
        event!(Level::WARN, ?path, ?e, "Failed to write cache info");
    }
}

fn extension_of(remote: &str) -> String {
    let without_query = remote.split(['?', '#']).next().unwrap_or(remote);
    Path::new(without_query)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// External program used to decompress a file with the given extension.
fn decompressor(ext: &str) -> Option<&'static str> {
    match ext {
        ".gz" => Some("tar"),
        ".bz2" => Some("bzip2"),
        ".xz" => Some("xz"),
        ".zst" => Some("zstd"),
        _ => None,
    }
}

/// Copy (and optionally decompress) a local file to `dst`, validating its
/// digest first. With `dst == None` only the digest is validated.
async fn copy_local(
    dst: Option<&Path>,
    src: &str,
    ext: &str,
    decompress: bool,
    description: &str,
    expected: Option<&Digest>,
) -> Result<()> {
    let src_path = canonical_local_path(src)?;
    validate_local_file_digest(&src_path, expected).await?;

    let Some(dst) = dst else {
        return Ok(());
    };

    if decompress {
        if let Some(command) = decompressor(ext) {
            return decompress_local(command, dst, &src_path, description).await;
        }
    }

    tokio::fs::copy(&src_path, dst)
        .await
        .with_context(|| format!("copy {src_path:?} to {dst:?}"))?;
    Ok(())
}

async fn decompress_local(command: &str, dst: &Path, src: &Path, description: &str) -> Result<()> {
    use std::process::Stdio;

    let description = if description.is_empty() {
        src.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    } else {
        description.to_string()
    };
    event!(Level::INFO, command, ?src, ?dst, "Decompressing {description}");

    let input = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open {src:?}"))?;
    let total = input.metadata().await.ok().map(|m| m.len());

    let mut cmd = tokio::process::Command::new(command);
    if command == "tar" {
        let dir = dst.parent().unwrap_or_else(|| Path::new("."));
        cmd.arg("-xf").arg("-").arg("-C").arg(dir).stdout(Stdio::null());
    } else {
        let out = std::fs::File::create(dst).with_context(|| format!("create {dst:?}"))?;
        cmd.arg("-d").stdout(Stdio::from(out));
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {command}"))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("{command} has no stdin"))?;
    let mut reader = ProgressReader::new(input, Progress::new(description, total, 0));
    let copy_res = tokio::io::copy(&mut reader, &mut stdin).await;
    std::mem::drop(stdin);
    reader.into_progress().finish();

    child
        .wait_with_output()
        .await
        .map_err(anyhow::Error::from)
        .and_then(|output| {
            if !output.status.success() {
                bail!(
                    "Running {} failed with exit-code {:?}, stderr: {:?}",
                    command,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr),
                );
            }
            Ok(())
        })
        .with_context(|| format!("decompress {src:?} into {dst:?}"))?;

    copy_res.with_context(|| format!("feed {src:?} into {command}"))?;
    Ok(())
}

struct FetchMeta {
    last_modified: Option<String>,
    content_type: Option<String>,
}

fn header_string(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Stream `url` into `dst`, via `dst.tmp`, resuming a previous partial
/// transfer where the server allows it.
async fn fetch(url: &str, dst: &Path, expected: Option<&Digest>, description: &str) -> Result<FetchMeta> {
    use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, CONTENT_TYPE, LAST_MODIFIED, RANGE};
    use reqwest::StatusCode;

    let tmp = path_with_suffix(dst, ".tmp");
    let marker = path_with_suffix(&tmp, ".accept-ranges");

    let mut current = match (
        tokio::fs::metadata(&marker).await,
        tokio::fs::metadata(&tmp).await,
    ) {
        (Ok(_), Ok(meta)) => meta.len(),
        _ => 0,
    };

    event!(Level::INFO, url, ?dst, resume_from = current, "Downloading");

    let client = reqwest::Client::builder()
        .user_agent(concat!("meridian/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build HTTP client")?;
    let mut req = client.get(url);
    if current > 0 {
        req = req.header(RANGE, format!("bytes={current}-"));
    }
    let mut resp = req.send().await.with_context(|| format!("GET {url}"))?;

    if current > 0 && resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        // Partial file already holds the full content.
        event!(Level::DEBUG, ?tmp, "Server reports nothing left to fetch");
        if let Some(expected) = expected {
            let actual = Digest::of_file(expected.algorithm(), &tmp).await?;
            if let Err(mismatch) = expected.verify(&actual) {
                discard_partial(&tmp, &marker).await;
                return Err(mismatch.into());
            }
        }
        rename_into(&tmp, dst).await?;
        remove_quietly(&marker).await;
        return Ok(FetchMeta {
            last_modified: None,
            content_type: None,
        });
    }

    if !resp.status().is_success() {
        let status = resp.status();
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.unwrap_or(None) {
            body.extend_from_slice(&chunk);
            if body.len() >= ERROR_BODY_LIMIT {
                body.truncate(ERROR_BODY_LIMIT);
                break;
            }
        }
        bail!(
            "GET {url}: unexpected status {status}: {}",
            String::from_utf8_lossy(&body)
        );
    }

    let resuming = current > 0 && resp.status() == StatusCode::PARTIAL_CONTENT;
    if current > 0 && !resuming {
        event!(Level::DEBUG, url, "Server ignored range request, starting over");
        current = 0;
    }

    let supports_ranges = resp.status() == StatusCode::PARTIAL_CONTENT
        || resp.headers().contains_key(CONTENT_RANGE)
        || resp
            .headers()
            .get(ACCEPT_RANGES)
            .map(|v| v.as_bytes() != b"none")
            .unwrap_or(false);
    if supports_ranges {
        tokio::fs::write(&marker, b"")
            .await
            .with_context(|| format!("write {marker:?}"))?;
    } else {
        remove_quietly(&marker).await;
    }

    let meta = FetchMeta {
        last_modified: header_string(&resp, LAST_MODIFIED),
        content_type: header_string(&resp, CONTENT_TYPE),
    };

    let mut hasher = expected.map(|d| d.algorithm().hasher());
    let mut file = if resuming {
        if let Some(ref mut hasher) = hasher {
            prime_hasher(hasher, &tmp).await?;
        }
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&tmp)
            .await
            .with_context(|| format!("open {tmp:?} for appending"))?
    } else {
        tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {tmp:?}"))?
    };

    let total = resp.content_length().map(|len| len + current);
    let mut progress = Progress::new(description, total, current);

    while let Some(chunk) = resp
        .chunk()
        .await
        .with_context(|| format!("read body of {url}"))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("write {tmp:?}"))?;
        if let Some(ref mut hasher) = hasher {
            hasher.update(&chunk);
        }
        progress.advance(chunk.len() as u64);
    }
    progress.finish();

    if let (Some(hasher), Some(expected)) = (hasher, expected) {
        let actual = hasher.finalize();
        if let Err(mismatch) = expected.verify(&actual) {
            std::mem::drop(file);
            discard_partial(&tmp, &marker).await;
            return Err(mismatch.into());
        }
    }

    file.sync_all()
        .await
        .with_context(|| format!("sync {tmp:?}"))?;
    std::mem::drop(file);

    rename_into(&tmp, dst).await?;
    remove_quietly(&marker).await;
    Ok(meta)
}

async fn prime_hasher(hasher: &mut digest::Hasher, path: &Path) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let mut f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {path:?}"))?;
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

/// Best-effort cleanup; a file that is already gone is fine.
async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => event!(Level::DEBUG, ?path, ?e, "Failed to remove file"),
    }
}

async fn discard_partial(tmp: &Path, marker: &Path) {
    remove_quietly(tmp).await;
    remove_quietly(marker).await;
}

async fn rename_into(tmp: &Path, dst: &Path) -> Result<()> {
    match tokio::fs::remove_file(dst).await {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => return Err(e).with_context(|| format!("remove {dst:?}")),
    }
    tokio::fs::rename(tmp, dst)
        .await
        .with_context(|| format!("rename {tmp:?} to {dst:?}"))
}
