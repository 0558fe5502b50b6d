//! AES-256-CBC with PKCS#7 padding over buffers and streams
//!
//! The stream paths hold at most one read chunk plus one cipher block in
//! memory, so payload size is bounded only by the reader. The buffer paths
//! are thin wrappers that run the stream path over an in-memory cursor.
//!
//! Every stream pass also accumulates size + SHA-256 of both sides, so a
//! caller needing plaintext and ciphertext metadata never reads twice.

use std::io::{Cursor, Read, Write};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ebx_core::{EbxError, EbxResult, FileMetadata};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::digest::MetadataHasher;
use crate::{BLOCK_SIZE, DEFAULT_CHUNK_SIZE, IV_SIZE, KEY_SIZE};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Plaintext and ciphertext metadata gathered during one stream pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherDigest {
    pub plaintext: FileMetadata,
    pub ciphertext: FileMetadata,
}

/// Incremental block transform fed by the stream drivers.
trait CbcTransform {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>);
    fn finish(self, out: &mut Vec<u8>) -> EbxResult<()>;
}

struct CbcEncrypt {
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl CbcEncrypt {
    fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            cipher: Aes256CbcEnc::new(key.into(), iv.into()),
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }
}

impl CbcTransform for CbcEncrypt {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let full = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        for block in self.pending[..full].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..full]);
        self.pending.drain(..full);
    }

    fn finish(self, out: &mut Vec<u8>) -> EbxResult<()> {
        // pending < BLOCK_SIZE, so one padded block always fits
        let len = self.pending.len();
        let mut block = [0u8; BLOCK_SIZE];
        block[..len].copy_from_slice(&self.pending);
        let last = self
            .cipher
            .encrypt_padded_mut::<Pkcs7>(&mut block, len)
            .map_err(|_| EbxError::Crypto("padding final block".into()))?;
        out.extend_from_slice(last);
        Ok(())
    }
}

struct CbcDecrypt {
    cipher: Aes256CbcDec,
    pending: Vec<u8>,
}

impl CbcDecrypt {
    fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            cipher: Aes256CbcDec::new(key.into(), iv.into()),
            pending: Vec::with_capacity(2 * BLOCK_SIZE),
        }
    }
}

impl CbcTransform for CbcDecrypt {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let full = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        // The last complete block carries the padding; hold it until finish.
        let ready = if full == self.pending.len() {
            full.saturating_sub(BLOCK_SIZE)
        } else {
            full
        };
        for block in self.pending[..ready].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..ready]);
        self.pending.drain(..ready);
    }

    fn finish(mut self, out: &mut Vec<u8>) -> EbxResult<()> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(EbxError::Crypto(format!(
                "ciphertext length is not a positive multiple of {BLOCK_SIZE} bytes"
            )));
        }
        let plain = self
            .cipher
            .decrypt_padded_mut::<Pkcs7>(&mut self.pending)
            .map_err(|_| EbxError::Crypto("invalid PKCS#7 padding (wrong key or corrupted data)".into()))?;
        out.extend_from_slice(plain);
        Ok(())
    }
}

/// Encrypt a buffer. Deterministic for identical key, IV and plaintext.
pub fn encrypt_bytes(
    plaintext: &[u8],
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
) -> EbxResult<Vec<u8>> {
    let mut out = Vec::with_capacity(padded_len(plaintext.len() as u64) as usize);
    encrypt_stream(Cursor::new(plaintext), &mut out, key, iv, DEFAULT_CHUNK_SIZE)?;
    Ok(out)
}

/// Decrypt a buffer produced by [`encrypt_bytes`]. Fails with
/// [`EbxError::Crypto`] on truncated input or bad padding.
pub fn decrypt_bytes(
    ciphertext: &[u8],
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
) -> EbxResult<Vec<u8>> {
    let mut out = Vec::with_capacity(ciphertext.len());
    decrypt_stream(Cursor::new(ciphertext), &mut out, key, iv, DEFAULT_CHUNK_SIZE)?;
    Ok(out)
}

/// Encrypt everything remaining in `input` into `output`.
pub fn encrypt_stream<R: Read, W: Write>(
    input: R,
    output: W,
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    chunk_size: usize,
) -> EbxResult<CipherDigest> {
    let (plaintext, ciphertext) =
        drive_sync(CbcEncrypt::new(key, iv), input, output, chunk_size)?;
    Ok(CipherDigest {
        plaintext,
        ciphertext,
    })
}

/// Decrypt everything remaining in `input` into `output`.
///
/// On error, `output` may already hold a prefix of the plaintext and must be discarded.
pub fn decrypt_stream<R: Read, W: Write>(
    input: R,
    output: W,
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    chunk_size: usize,
) -> EbxResult<CipherDigest> {
    let (ciphertext, plaintext) =
        drive_sync(CbcDecrypt::new(key, iv), input, output, chunk_size)?;
    Ok(CipherDigest {
        plaintext,
        ciphertext,
    })
}

/// Async encrypt with cancellation checked at every chunk boundary.
///
/// After `Err(Cancelled)` the content of `output` is a truncated ciphertext
/// and must be discarded by the caller.
pub async fn encrypt_stream_async<R, W>(
    input: R,
    output: W,
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    chunk_size: usize,
    cancel: &CancellationToken,
) -> EbxResult<CipherDigest>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (plaintext, ciphertext) =
        drive_async(CbcEncrypt::new(key, iv), input, output, chunk_size, cancel).await?;
    Ok(CipherDigest {
        plaintext,
        ciphertext,
    })
}

/// Async decrypt with cancellation checked at every chunk boundary.
pub async fn decrypt_stream_async<R, W>(
    input: R,
    output: W,
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    chunk_size: usize,
    cancel: &CancellationToken,
) -> EbxResult<CipherDigest>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (ciphertext, plaintext) =
        drive_async(CbcDecrypt::new(key, iv), input, output, chunk_size, cancel).await?;
    Ok(CipherDigest {
        plaintext,
        ciphertext,
    })
}

/// Ciphertext length for a plaintext of `len` bytes (PKCS#7 always adds 1..=16 bytes).
pub fn padded_len(len: u64) -> u64 {
    (len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

fn drive_sync<T, R, W>(
    mut transform: T,
    mut input: R,
    mut output: W,
    chunk_size: usize,
) -> EbxResult<(FileMetadata, FileMetadata)>
where
    T: CbcTransform,
    R: Read,
    W: Write,
{
    let mut buf = vec![0u8; chunk_size.max(BLOCK_SIZE)];
    let mut out = Vec::with_capacity(buf.len() + BLOCK_SIZE);
    let mut read_side = MetadataHasher::new();
    let mut write_side = MetadataHasher::new();

    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        read_side.update(&buf[..n]);
        out.clear();
        transform.update(&buf[..n], &mut out);
        write_side.update(&out);
        output.write_all(&out)?;
    }

    out.clear();
    transform.finish(&mut out)?;
    write_side.update(&out);
    output.write_all(&out)?;
    output.flush()?;

    Ok((read_side.finish(), write_side.finish()))
}

async fn drive_async<T, R, W>(
    mut transform: T,
    mut input: R,
    mut output: W,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> EbxResult<(FileMetadata, FileMetadata)>
where
    T: CbcTransform,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(BLOCK_SIZE)];
    let mut out = Vec::with_capacity(buf.len() + BLOCK_SIZE);
    let mut read_side = MetadataHasher::new();
    let mut write_side = MetadataHasher::new();

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EbxError::Cancelled),
            read = input.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }
        read_side.update(&buf[..n]);
        out.clear();
        transform.update(&buf[..n], &mut out);
        write_side.update(&out);
        output.write_all(&out).await?;
    }

    if cancel.is_cancelled() {
        return Err(EbxError::Cancelled);
    }
    out.clear();
    transform.finish(&mut out)?;
    write_side.update(&out);
    output.write_all(&out).await?;
    output.flush().await?;

    Ok((read_side.finish(), write_side.finish()))
}
