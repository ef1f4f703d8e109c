//! Image pulls.
//!
//! A pull fills the downloader cache for one catalog image; the backend's
//! `create_disk` later materializes the machine's base disk from that cache.
//! Concurrent pulls of the same image share one in-flight download.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{event, instrument, Level};

use mdn_downloader::{Digest, Options};
use meridian_rs::image::{Image, ImageSource, ImageStatus};

use crate::store::Store;

type PullResult = Option<Result<(), String>>;

/// Handle on an in-flight (or finished) pull.
#[derive(Clone)]
pub struct Pulling {
    name: String,
    done: watch::Receiver<PullResult>,
}

impl Pulling {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve once the pull has completed.
    pub async fn wait(mut self) -> Result<()> {
        let res = self
            .done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("pull of image {} was abandoned", self.name))?
            .clone();
        match res {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(anyhow!("pull image {}: {message}", self.name)),
            None => Err(anyhow!("pull of image {} did not finish", self.name)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("image {0:?} not found")]
pub struct UnknownImage(pub String);

pub struct ImageMgr {
    store: Arc<dyn Store<Image>>,
    catalog: HashMap<String, ImageSource>,
    cache_dir: PathBuf,
    inflight: Mutex<HashMap<String, Pulling>>,
}

impl ImageMgr {
    pub fn new(
        store: Arc<dyn Store<Image>>,
        catalog: HashMap<String, ImageSource>,
        cache_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(ImageMgr {
            store,
            catalog,
            cache_dir,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pulling>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn source(&self, name: &str) -> Option<&ImageSource> {
        self.catalog.get(name)
    }

    /// Pulled records plus every catalog entry that was never pulled.
    pub async fn list(&self) -> Result<Vec<Image>> {
        let mut images = self.store.list().await?;
        for (name, source) in self.catalog.iter() {
            if !images.iter().any(|i| &i.name == name) {
                images.push(Image::new(name.clone(), source.clone()));
            }
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Image>> {
        if let Some(image) = self.store.get(name).await? {
            return Ok(Some(image));
        }
        Ok(self
            .catalog
            .get(name)
            .map(|source| Image::new(name, source.clone())))
    }

    /// Start pulling `name`, or join the pull already in flight.
    pub fn pull(self: &Arc<Self>, name: &str) -> Result<Pulling, UnknownImage> {
        let source = self
            .catalog
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownImage(name.to_string()))?;

        let mut inflight = self.inflight();
        if let Some(pulling) = inflight.get(name) {
            return Ok(pulling.clone());
        }

        let (tx, rx) = watch::channel(None);
        let pulling = Pulling {
            name: name.to_string(),
            done: rx,
        };
        inflight.insert(name.to_string(), pulling.clone());
        drop(inflight);

        let this = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let res = this.do_pull(&name, source).await;
            this.inflight().remove(&name);
            tx.send_replace(Some(res.map_err(|e| format!("{e:#}"))));
        });
        Ok(pulling)
    }

    async fn save(&self, image: &Image) -> Result<()> {
        if self.store.get(&image.name).await?.is_some() {
            self.store.update(image).await
        } else {
            self.store.create(image).await
        }
    }

    #[instrument(skip(self, source), err(Debug, level = Level::WARN))]
    async fn do_pull(&self, name: &str, source: ImageSource) -> Result<()> {
        let mut image = Image::new(name, source.clone());
        image.status = ImageStatus::Pulling;
        self.save(&image).await?;

        let res = self.fetch(name, &source).await;
        match res {
            Ok(()) => {
                image.status = ImageStatus::Pulled;
                image.message = String::new();
                image.pulled_at = Some(Utc::now());
                event!(Level::INFO, image = %name, "Image pulled");
            }
            Err(ref e) => {
                image.status = ImageStatus::Error;
                image.message = format!("{e:#}");
            }
        }
        self.save(&image).await?;
        res
    }

    async fn fetch(&self, name: &str, source: &ImageSource) -> Result<()> {
        let expected: Option<Digest> = source
            .digest
            .as_deref()
            .map(str::parse::<Digest>)
            .transpose()
            .with_context(|| format!("invalid digest for image {name}"))?;
        let opts = Options::default()
            .with_cache_dir(&self.cache_dir)
            .with_description(format!("image {name}"))
            .with_expected_digest(expected);

        // Caching-only: the base disk is copied out of the cache per machine.
        let res = mdn_downloader::download(None, &source.location, &opts)
            .await
            .with_context(|| format!("failed to download {:?}", source.location))?;
        event!(Level::DEBUG, image = %name, status = ?res.status, "Download finished");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::FileStore;
    use meridian_rs::spec::{Arch, Os};

    fn source(location: String, digest: Option<String>) -> ImageSource {
        ImageSource {
            os: Os::Linux,
            arch: Arch::native(),
            location,
            digest,
            version: None,
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_pull_local_image() {
        let dir = tempfile::tempdir().unwrap();
        let image_file = dir.path().join("disk.img");
        std::fs::write(&image_file, b"hello").unwrap();

        let mut catalog = HashMap::new();
        catalog.insert(
            "good".to_string(),
            source(image_file.display().to_string(), None),
        );
        catalog.insert(
            "bad".to_string(),
            source(
                image_file.display().to_string(),
                Some(format!("sha256:{}", "0".repeat(64))),
            ),
        );

        let store = Arc::new(FileStore::<Image>::new(dir.path().join("images")));
        let mgr = ImageMgr::new(store.clone(), catalog, dir.path().join("cache"));

        assert!(matches!(mgr.pull("missing"), Err(UnknownImage(_))));

        let first = mgr.pull("good").unwrap();
        let second = mgr.pull("good").unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        let good = store.get("good").await.unwrap().unwrap();
        assert_eq!(good.status, ImageStatus::Pulled);
        assert!(good.pulled_at.is_some());

        let err = mgr.pull("bad").unwrap().wait().await.unwrap_err();
        assert!(format!("{err:#}").contains("bad"));
        let bad = store.get("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, ImageStatus::Error);
        assert!(!bad.message.is_empty());

        let names: Vec<String> = mgr.list().await.unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["bad", "good"]);
    }
}
