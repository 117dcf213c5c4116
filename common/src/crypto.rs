//! Streaming cipher and content hashing.
//!
//! # At-rest format
//!
//! Every CAS file is `IV(16) ‖ AES-CTR-256(key, IV, plaintext)`. The IV is
//! drawn fresh from a cryptographic RNG per write and prepended to the
//! ciphertext, so plaintext size is always `on_disk_size − 16`.
//!
//! # Key derivation of paths and identifiers
//!
//! - [`hash_key`] produces the *wire identifier* `H(K)`: hex MD5 of the
//!   logical key. MD5 is used for identifier stability across peers and for
//!   path derivation, not for security.
//! - [`cas_path`] produces the on-disk layout: hex SHA-1 of the CAS key,
//!   split into 5-character segments joined by `/`, with the full digest as
//!   the file name.

use crate::WireError;
use aes::cipher::{KeyIvInit, StreamCipher};
use md5::Md5;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// AES-256 in CTR mode with a big-endian 128-bit counter over the IV block.
pub type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Encryption key length (AES-256).
pub const KEY_SIZE: usize = 32;

/// IV length prepended to every encrypted file.
pub const IV_SIZE: usize = 16;

/// Chunk size for the XOR-streaming copy loops.
const COPY_CHUNK_SIZE: usize = 32 * 1024;

// ============================================================================
// Keys and identifiers
// ============================================================================

/// Generates a fresh 32-byte encryption key from a cryptographic RNG.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Hex MD5 of a logical key — the wire identifier `H(K)`.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derived on-disk location of a CAS entry, relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasPath {
    /// Directory chain: the SHA-1 digest split into 5-character segments
    /// joined by `/`.
    pub dir: String,
    /// File name: the full 40-character SHA-1 digest.
    pub filename: String,
}

impl CasPath {
    /// Full relative path (`dir/filename`).
    pub fn relative(&self) -> String {
        format!("{}/{}", self.dir, self.filename)
    }
}

/// Splits the hex SHA-1 of `key` into the CAS directory layout.
pub fn cas_path(key: &str) -> CasPath {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    const BLOCK: usize = 5;
    let segments: Vec<&str> = (0..digest.len() / BLOCK)
        .map(|i| &digest[i * BLOCK..(i + 1) * BLOCK])
        .collect();

    CasPath {
        dir: segments.join("/"),
        filename: digest,
    }
}

// ============================================================================
// Streaming cipher
// ============================================================================

fn new_cipher(key: &[u8], iv: &[u8; IV_SIZE]) -> Result<Aes256Ctr, WireError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|_| WireError::KeyLength {
        expected: KEY_SIZE,
        actual: key.len(),
    })
}

/// Encrypts `src` into `dst`: writes a random 16-byte IV, then XOR-streams
/// the source in 32 KiB chunks. Returns total bytes written to the sink,
/// IV included.
pub async fn copy_encrypt<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    let mut cipher = new_cipher(key, &iv)?;

    dst.write_all(&iv).await?;
    let mut written = IV_SIZE as u64;

    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;

    Ok(written)
}

/// Decrypts `src` into `dst`: reads exactly 16 IV bytes, then XOR-streams
/// the remainder. Returns total plaintext bytes written to the sink.
pub async fn copy_decrypt<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, WireError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await?;
    let mut cipher = new_cipher(key, &iv)?;

    let mut written = 0u64;
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;

    Ok(written)
}

/// A lazy reader that yields plaintext from an underlying ciphertext source.
///
/// The caller reads the 16-byte IV off the source first and hands it to
/// [`DecryptReader::new`]; every subsequent read pulls ciphertext from the
/// inner reader and decrypts it in place.
pub struct DecryptReader<R> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R> DecryptReader<R> {
    /// Builds a decrypting reader over `inner`, positioned just past the IV.
    pub fn new(key: &[u8], iv: &[u8; IV_SIZE], inner: R) -> Result<Self, WireError> {
        Ok(Self {
            inner,
            cipher: new_cipher(key, iv)?,
        })
    }
}

impl<R> std::fmt::Debug for DecryptReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptReader").finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut me.inner).poll_read(cx, buf))?;
        let after = buf.filled().len();
        me.cipher.apply_keystream(&mut buf.filled_mut()[before..after]);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn encrypt_vec(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut src = plaintext;
        let mut dst = Cursor::new(Vec::new());
        copy_encrypt(key, &mut src, &mut dst).await.unwrap();
        dst.into_inner()
    }

    async fn decrypt_vec(key: &[u8], ciphertext: &[u8]) -> Vec<u8> {
        let mut src = ciphertext;
        let mut dst = Cursor::new(Vec::new());
        copy_decrypt(key, &mut src, &mut dst).await.unwrap();
        dst.into_inner()
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let plaintext = b"my big data file here!";

        let ciphertext = encrypt_vec(&key, plaintext).await;
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);

        let decrypted = decrypt_vec(&key, &ciphertext).await;
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn roundtrip_empty_input() {
        let key = generate_key();
        let ciphertext = encrypt_vec(&key, b"").await;
        assert_eq!(ciphertext.len(), IV_SIZE);
        assert_eq!(decrypt_vec(&key, &ciphertext).await, b"");
    }

    #[tokio::test]
    async fn roundtrip_spans_multiple_chunks() {
        let key = generate_key();
        let plaintext: Vec<u8> = (0..(COPY_CHUNK_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();

        let ciphertext = encrypt_vec(&key, &plaintext).await;
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);
        assert_eq!(decrypt_vec(&key, &ciphertext).await, plaintext);
    }

    #[tokio::test]
    async fn ciphertext_does_not_leak_plaintext() {
        let key = generate_key();
        let ciphertext = encrypt_vec(&key, b"plaintext").await;
        let window_found = ciphertext
            .windows(b"plaintext".len())
            .any(|w| w == b"plaintext");
        assert!(!window_found, "ciphertext must not contain the plaintext");
    }

    #[tokio::test]
    async fn fresh_iv_per_encryption() {
        let key = generate_key();
        let a = encrypt_vec(&key, b"same input").await;
        let b = encrypt_vec(&key, b"same input").await;
        assert_ne!(&a[..IV_SIZE], &b[..IV_SIZE], "IV must be drawn per write");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn wrong_key_yields_garbage_not_error() {
        // CTR mode is unauthenticated: decryption always succeeds but the
        // output only matches under the original key.
        let ciphertext = encrypt_vec(&generate_key(), b"secret bytes").await;
        let garbage = decrypt_vec(&generate_key(), &ciphertext).await;
        assert_ne!(garbage, b"secret bytes");
    }

    #[tokio::test]
    async fn short_iv_is_an_error() {
        let key = generate_key();
        let mut src: &[u8] = &[0u8; IV_SIZE - 1];
        let mut dst = Cursor::new(Vec::new());
        assert!(copy_decrypt(&key, &mut src, &mut dst).await.is_err());
    }

    #[tokio::test]
    async fn bad_key_length_is_reported() {
        let mut src: &[u8] = b"data";
        let mut dst = Cursor::new(Vec::new());
        match copy_encrypt(&[0u8; 7], &mut src, &mut dst).await {
            Err(WireError::KeyLength { expected, actual }) => {
                assert_eq!(expected, KEY_SIZE);
                assert_eq!(actual, 7);
            }
            other => panic!("expected KeyLength error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn decrypt_reader_matches_copy_decrypt() {
        let key = generate_key();
        let plaintext = b"streamed through the lazy reader";
        let ciphertext = encrypt_vec(&key, plaintext).await;

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&ciphertext[..IV_SIZE]);
        let mut reader = DecryptReader::new(&key, &iv, &ciphertext[IV_SIZE..]).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn hash_key_known_vectors() {
        assert_eq!(hash_key(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hash_key("hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn cas_path_known_vector() {
        let path = cas_path("cooldawg");
        assert_eq!(
            path.dir,
            "1ff51/b817f/2aa0f/f2884/5b648/e54fa/24e05/cb151"
        );
        assert_eq!(path.filename, "1ff51b817f2aa0ff28845b648e54fa24e05cb151");
        assert_eq!(
            path.relative(),
            "1ff51/b817f/2aa0f/f2884/5b648/e54fa/24e05/cb151/1ff51b817f2aa0ff28845b648e54fa24e05cb151"
        );
    }

    #[test]
    fn cas_path_shape() {
        let path = cas_path("abc");
        assert_eq!(path.filename, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(path.dir.split('/').count(), 8);
        assert!(path.dir.split('/').all(|seg| seg.len() == 5));
        assert_eq!(path.dir.replace('/', ""), path.filename);
    }

    #[test]
    fn generated_keys_are_distinct() {
        assert_ne!(generate_key(), generate_key());
    }
}
