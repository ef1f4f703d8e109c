use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mdn_downloader::{cache_entry_dir, cached, download, Algorithm, Digest, DigestMismatch, Options, Status};

const IMAGE: &[u8] = b"meridian test image contents";

fn digest_of(data: &[u8]) -> Digest {
    let mut hasher = Algorithm::Sha256.hasher();
    hasher.update(data);
    hasher.finalize()
}

async fn serve_image(server: &MockServer, expected_requests: u64) {
    Mock::given(method("GET"))
        .and(path("/images/base.img"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(IMAGE)
                .insert_header("Content-Type", "application/octet-stream")
                .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
        )
        .expect(expected_requests)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_download_is_idempotent_and_cached() {
    let server = MockServer::start().await;
    serve_image(&server, 1).await;
    let url = format!("{}/images/base.img", server.uri());

    let dir = tempfile::tempdir().unwrap();
    let opts = Options::default()
        .with_cache_dir(dir.path().join("cache"))
        .with_expected_digest(Some(digest_of(IMAGE)));

    let local = dir.path().join("vm1/base.img");
    let res = download(Some(local.as_path()), &url, &opts).await.unwrap();
    assert_eq!(res.status, Status::Downloaded);
    assert!(res.validated_digest);
    assert_eq!(res.content_type.as_deref(), Some("application/octet-stream"));
    assert_eq!(std::fs::read(&local).unwrap(), IMAGE);

    // Same local path: skipped without touching the network.
    let res = download(Some(local.as_path()), &url, &opts).await.unwrap();
    assert_eq!(res.status, Status::Skipped);
    assert_eq!(std::fs::read(&local).unwrap(), IMAGE);

    // Different local path: served from the cache.
    let other = dir.path().join("vm2/base.img");
    let res = download(Some(other.as_path()), &url, &opts).await.unwrap();
    assert_eq!(res.status, Status::UsedCache);
    assert_eq!(std::fs::read(&other).unwrap(), IMAGE);

    let res = cached(&url, &opts).await.unwrap();
    assert_eq!(res.status, Status::UsedCache);
    assert!(res.cache_path.unwrap().ends_with("data"));
}

#[tokio::test]
async fn test_digest_mismatch_is_fatal() {
    let server = MockServer::start().await;
    serve_image(&server, 1).await;
    let url = format!("{}/images/base.img", server.uri());

    let dir = tempfile::tempdir().unwrap();
    let opts = Options::default()
        .with_cache_dir(dir.path().join("cache"))
        .with_expected_digest(Some(digest_of(b"something else")));

    let local = dir.path().join("base.img");
    let err = download(Some(local.as_path()), &url, &opts).await.unwrap_err();
    assert!(err.downcast_ref::<DigestMismatch>().is_some(), "{err:?}");
    assert!(!local.exists());

    let entry = cache_entry_dir(&dir.path().join("cache"), &url);
    assert!(!entry.join("data").exists());
    assert!(!entry.join("data.tmp").exists());
}

#[tokio::test]
async fn test_cached_digest_mismatch_copies_nothing() {
    let server = MockServer::start().await;
    serve_image(&server, 1).await;
    let url = format!("{}/images/base.img", server.uri());

    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    let good = Options::default()
        .with_cache_dir(&cache)
        .with_expected_digest(Some(digest_of(IMAGE)));
    download(None, &url, &good).await.unwrap();

    // Same algorithm, so the stored `sha256.digest` file is compared:
    let bad = Options::default()
        .with_cache_dir(&cache)
        .with_expected_digest(Some(digest_of(b"tampered")));

    let local = dir.path().join("base.img");
    let err = download(Some(local.as_path()), &url, &bad).await.unwrap_err();
    assert!(err.downcast_ref::<DigestMismatch>().is_some(), "{err:?}");
    assert!(!local.exists());

    assert!(cached(&url, &bad).await.is_err());
}

#[tokio::test]
async fn test_resumes_partial_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/images/base.img"))
        .and(header("Range", "bytes=8-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(&IMAGE[8..])
                .insert_header("Accept-Ranges", "bytes")
                .insert_header(
                    "Content-Range",
                    format!("bytes 8-{}/{}", IMAGE.len() - 1, IMAGE.len()).as_str(),
                ),
        )
        .expect(1)
        .mount(&server)
        .await;
    let url = format!("{}/images/base.img", server.uri());

    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    let entry = cache_entry_dir(&cache, &url);
    std::fs::create_dir_all(&entry).unwrap();
    std::fs::write(entry.join("data.tmp"), &IMAGE[..8]).unwrap();
    std::fs::write(entry.join("data.tmp.accept-ranges"), b"").unwrap();

    let opts = Options::default()
        .with_cache_dir(&cache)
        .with_expected_digest(Some(digest_of(IMAGE)));
    let local = dir.path().join("base.img");
    let res = download(Some(local.as_path()), &url, &opts).await.unwrap();
    assert_eq!(res.status, Status::Downloaded);
    assert_eq!(std::fs::read(&local).unwrap(), IMAGE);
    assert!(!entry.join("data.tmp").exists());
    assert!(!entry.join("data.tmp.accept-ranges").exists());
}

#[tokio::test]
async fn test_local_source_validates_digest() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.img");
    std::fs::write(&src, IMAGE).unwrap();
    let src = src.to_string_lossy().to_string();

    let ok = Options::default().with_expected_digest(Some(digest_of(IMAGE)));
    let dst = dir.path().join("out/dst.img");
    let res = download(Some(dst.as_path()), &src, &ok).await.unwrap();
    assert_eq!(res.status, Status::Downloaded);
    assert_eq!(std::fs::read(&dst).unwrap(), IMAGE);

    let bad = Options::default().with_expected_digest(Some(digest_of(b"nope")));
    let dst2 = dir.path().join("dst2.img");
    assert!(download(Some(dst2.as_path()), &src, &bad).await.is_err());
    assert!(!dst2.exists());
}

#[tokio::test]
async fn test_caching_only_mode_requires_cache_dir() {
    let err = download(None, "https://example.invalid/a.img", &Options::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cache directory"));
}
