use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::{event, Level};

const KEY_NAME: &str = "id_ed25519";

/// Owns the SSH key pair injected into every guest.
#[derive(Debug, Clone)]
pub struct SshKeyMgr {
    dir: PathBuf,
    user_ssh_dir: Option<PathBuf>,
}

impl SshKeyMgr {
    /// Keys live in `<config_dir>/ssh`. Public keys found in `~/.ssh` are
    /// authorized as well.
    pub fn new(config_dir: &Path) -> Self {
        SshKeyMgr {
            dir: config_dir.join("ssh"),
            user_ssh_dir: dirs::home_dir().map(|home| home.join(".ssh")),
        }
    }

    pub fn with_user_ssh_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.user_ssh_dir = dir;
        self
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(KEY_NAME)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.dir.join(format!("{KEY_NAME}.pub"))
    }

    /// Generate the key pair if it does not exist yet.
    pub async fn ensure(&self) -> Result<()> {
        if tokio::fs::try_exists(self.private_key_path()).await? {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create ssh key directory {:?}", self.dir))?;

        let mut private = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519)
            .context("generate ed25519 key")?;
        private.set_comment("meridian");
        let public = private.public_key().to_openssh()?;

        let private_path = self.private_key_path();
        private
            .write_openssh_file(&private_path, LineEnding::LF)
            .with_context(|| format!("write private key {private_path:?}"))?;
        tokio::fs::write(self.public_key_path(), format!("{public}\n"))
            .await
            .with_context(|| format!("write public key {:?}", self.public_key_path()))?;

        event!(Level::INFO, path = ?private_path, "Generated ssh key");
        Ok(())
    }

    /// The managed public key followed by every `*.pub` in the user's ssh
    /// directory, de-duplicated.
    pub async fn load_pub_keys(&self) -> Result<Vec<String>> {
        self.ensure().await?;

        let own = tokio::fs::read_to_string(self.public_key_path())
            .await
            .with_context(|| format!("read public key {:?}", self.public_key_path()))?;
        let mut keys = vec![own.trim().to_string()];

        let Some(ref ssh_dir) = self.user_ssh_dir else {
            return Ok(keys);
        };
        let mut entries = match tokio::fs::read_dir(ssh_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e).with_context(|| format!("read {ssh_dir:?}")),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("pub") {
                let key = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read SSH key file: {path:?}"))?;
                found.push(key.trim().to_string());
            }
        }
        found.sort();

        for key in found {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_generate_once_and_collect_user_keys() {
        let config = tempfile::tempdir().unwrap();
        let home_ssh = tempfile::tempdir().unwrap();
        std::fs::write(home_ssh.path().join("id_rsa.pub"), "ssh-rsa AAAA user@host\n").unwrap();
        std::fs::write(home_ssh.path().join("id_rsa"), "private").unwrap();

        let mgr = SshKeyMgr::new(config.path())
            .with_user_ssh_dir(Some(home_ssh.path().to_path_buf()));
        let keys = mgr.load_pub_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].starts_with("ssh-ed25519 "));
        assert_eq!(keys[1], "ssh-rsa AAAA user@host");

        // A second call reuses the existing pair:
        let again = mgr.load_pub_keys().await.unwrap();
        assert_eq!(again, keys);
    }
}
