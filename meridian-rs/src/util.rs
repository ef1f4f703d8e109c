pub mod hex_slice {
    //! Wrapper type around a slice to print it as a lower-case hex
    //! string.
    use std::fmt;

    /// Wrapper type around a slice to print it as a lower-case hex
    /// string. Implements both [`Display`](fmt::Display) and
    /// [`Debug`](fmt::Debug).
    pub struct HexSlice<'a>(pub &'a [u8]);

    impl<'a> fmt::Debug for HexSlice<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for b in self.0.iter() {
                write!(f, "{:0>2x}", *b)?;
            }

            Ok(())
        }
    }

    impl<'a> fmt::Display for HexSlice<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }
}

use std::path::{Path, PathBuf};

/// Join `digest` onto `base`, nested below `nest_level` directories named
/// after its leading bytes (`ab/abcdef...`).
pub fn digest_tree_path<P: AsRef<Path>>(base: P, digest: &[u8], nest_level: usize) -> PathBuf {
    let mut current_path: PathBuf = base.as_ref().into();

    for byte in digest.iter().take(nest_level) {
        current_path = current_path.join(hex_slice::HexSlice(&[*byte]).to_string());
    }

    current_path.join(hex_slice::HexSlice(digest).to_string())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let home = match dirs::home_dir() {
        Some(home) => home,
        None => return PathBuf::from(path),
    };

    if path == "~" {
        home
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Render an error and its causes on one line, for `Machine.message`.
pub fn fmt_message(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_digest_tree_path() {
        let p = digest_tree_path("/cache", &[0xab, 0x01, 0xff], 1);
        assert_eq!(p, PathBuf::from("/cache/ab/ab01ff"));
        assert_eq!(
            digest_tree_path("/cache", &[0x0f], 0),
            PathBuf::from("/cache/0f")
        );
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/mdata"), home.join("mdata"));
        }
    }

    #[test]
    fn test_fmt_message_includes_causes() {
        let err = anyhow::anyhow!("disk full").context("create machine vm1");
        assert_eq!(fmt_message(&err), "create machine vm1: disk full");
    }
}
