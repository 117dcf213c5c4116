//! Encrypted content-addressable store.
//!
//! Files live under a per-node storage root at a path derived from their CAS
//! key: the hex SHA-1 of the key split into 5-character directory segments,
//! with the full digest as the file name (see [`common::crypto::cas_path`]).
//! Content on disk is always `IV(16) ‖ AES-CTR ciphertext`.
//!
//! Writes are create-and-copy: the destination is truncated and rewritten,
//! which is atomic from the reader's point of view as long as callers never
//! write the same key concurrently on one node (an invariant the coordinator
//! upholds — the dispatch task is the only writer for replicated content).

use common::crypto::{self, DecryptReader, IV_SIZE};
use common::WireError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};

/// On-disk CAS rooted at one directory.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute (root-joined) path for a CAS key. Pure derivation — the
    /// entry need not exist.
    pub fn full_path_for(&self, key: &str) -> PathBuf {
        self.root.join(crypto::cas_path(key).relative())
    }

    /// Stat-only existence check.
    pub async fn has(&self, key: &str) -> bool {
        fs::metadata(self.full_path_for(key)).await.is_ok()
    }

    /// Writes `src` verbatim under `key`, creating the directory chain.
    /// Returns bytes written.
    pub async fn write<R>(&self, key: &str, src: &mut R) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.full_path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(&path).await?;
        tokio::io::copy(src, &mut file).await
    }

    /// Streams `src` through the cipher into the entry for `key`. Returns
    /// bytes written to disk, the 16-byte IV prefix included.
    pub async fn write_encrypt<R>(
        &self,
        enc_key: &[u8],
        key: &str,
        src: &mut R,
    ) -> Result<u64, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.full_path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(&path).await?;
        crypto::copy_encrypt(enc_key, src, &mut file).await
    }

    /// Opens the raw entry. Returns the on-disk byte count and the file;
    /// a missing key surfaces as a not-found I/O error.
    pub async fn read(&self, key: &str) -> std::io::Result<(u64, File)> {
        let path = self.full_path_for(key);
        let meta = fs::metadata(&path).await?;
        let file = File::open(&path).await?;
        Ok((meta.len(), file))
    }

    /// Opens the entry for `key` and returns its plaintext size together
    /// with a lazy decrypting reader positioned past the IV.
    pub async fn read_decrypt(
        &self,
        enc_key: &[u8],
        key: &str,
    ) -> Result<(u64, DecryptReader<File>), WireError> {
        let (disk_size, mut file) = self.read(key).await?;

        let mut iv = [0u8; IV_SIZE];
        file.read_exact(&mut iv).await?;
        let reader = DecryptReader::new(enc_key, &iv, file)?;

        Ok((disk_size.saturating_sub(IV_SIZE as u64), reader))
    }

    /// Removes the entry for `key` and prunes any directory segments left
    /// empty, up to (but not including) the storage root. Deleting a missing
    /// key is not an error.
    pub async fn delete(&self, key: &str) -> std::io::Result<()> {
        let path = self.full_path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root {
                break;
            }
            // remove_dir refuses non-empty directories, which ends the prune
            if fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::crypto::generate_key;

    fn temp_store() -> (tempfile::TempDir, CasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CasStore::new(dir.path().join("files"));
        (dir, store)
    }

    async fn read_all(store: &CasStore, enc_key: &[u8], key: &str) -> Vec<u8> {
        let (size, mut reader) = store.read_decrypt(enc_key, key).await.unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out.len() as u64, size);
        out
    }

    #[tokio::test]
    async fn write_encrypt_read_decrypt_roundtrip() {
        let (_dir, store) = temp_store();
        let enc_key = generate_key();

        let payload = b"some bytes that will not survive a restart unencrypted";
        let written = store
            .write_encrypt(&enc_key, "somekey", &mut &payload[..])
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64 + IV_SIZE as u64);

        assert!(store.has("somekey").await);
        assert_eq!(read_all(&store, &enc_key, "somekey").await, payload);
    }

    #[tokio::test]
    async fn on_disk_bytes_are_ciphertext() {
        let (_dir, store) = temp_store();
        let enc_key = generate_key();

        store
            .write_encrypt(&enc_key, "k", &mut &b"plaintext"[..])
            .await
            .unwrap();

        let raw = fs::read(store.full_path_for("k")).await.unwrap();
        assert_eq!(raw.len(), b"plaintext".len() + IV_SIZE);
        assert!(!raw.windows(9).any(|w| w == b"plaintext"));
    }

    #[tokio::test]
    async fn write_overwrites_existing_entry() {
        let (_dir, store) = temp_store();
        let enc_key = generate_key();

        store
            .write_encrypt(&enc_key, "k", &mut &b"first version, longer"[..])
            .await
            .unwrap();
        store
            .write_encrypt(&enc_key, "k", &mut &b"second"[..])
            .await
            .unwrap();

        assert_eq!(read_all(&store, &enc_key, "k").await, b"second");
    }

    #[tokio::test]
    async fn plain_write_and_read() {
        let (_dir, store) = temp_store();
        let n = store.write("k", &mut &b"verbatim"[..]).await.unwrap();
        assert_eq!(n, 8);

        let (size, mut file) = store.read("k").await.unwrap();
        assert_eq!(size, 8);
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"verbatim");
    }

    #[tokio::test]
    async fn read_missing_key_is_not_found() {
        let (_dir, store) = temp_store();
        let err = store.read("nope").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_missing_key_is_ok() {
        let (_dir, store) = temp_store();
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_entry_and_prunes_empty_dirs() {
        let (_dir, store) = temp_store();
        let enc_key = generate_key();

        store
            .write_encrypt(&enc_key, "k", &mut &b"bytes"[..])
            .await
            .unwrap();
        let leaf = store.full_path_for("k");
        let top_segment = store
            .root()
            .join(common::crypto::cas_path("k").dir.split('/').next().unwrap());
        assert!(fs::metadata(&top_segment).await.is_ok());

        store.delete("k").await.unwrap();

        assert!(fs::metadata(&leaf).await.is_err());
        assert!(
            fs::metadata(&top_segment).await.is_err(),
            "empty directory chain must be pruned"
        );
        assert!(
            fs::metadata(store.root()).await.is_ok(),
            "storage root must survive the prune"
        );
    }

    #[tokio::test]
    async fn delete_keeps_directories_shared_with_other_entries() {
        let (_dir, store) = temp_store();
        let enc_key = generate_key();

        store
            .write_encrypt(&enc_key, "a", &mut &b"one"[..])
            .await
            .unwrap();
        store
            .write_encrypt(&enc_key, "b", &mut &b"two"[..])
            .await
            .unwrap();

        store.delete("a").await.unwrap();

        assert!(!store.has("a").await);
        assert!(store.has("b").await);
    }

    #[tokio::test]
    async fn full_path_matches_derivation() {
        let (_dir, store) = temp_store();
        let expected = store
            .root()
            .join("1ff51/b817f/2aa0f/f2884/5b648/e54fa/24e05/cb151")
            .join("1ff51b817f2aa0ff28845b648e54fa24e05cb151");
        assert_eq!(store.full_path_for("cooldawg"), expected);
    }
}
