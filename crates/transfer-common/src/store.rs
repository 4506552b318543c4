//! On-disk storage for uploaded files
//!
//! Files land under `<root>/<client_id_hex>/<basename(file_name)>`. Taking
//! only the basename of the client-supplied name is the directory-traversal
//! guard the original transfer server applies before ever touching the
//! filesystem.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::crypto;

/// Root directory under which all client files are stored.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Canonical on-disk path for a client's file, sandboxed to its own
    /// subdirectory with only the basename of `file_name` kept.
    pub fn path_of(&self, client_id_hex: &str, file_name: &str) -> PathBuf {
        let basename = Path::new(file_name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(file_name));
        self.root.join(client_id_hex).join(basename)
    }

    /// Write a fragment of a file, truncating on the first fragment of an
    /// upload and appending on every subsequent one.
    pub async fn write_fragment(
        &self,
        client_id_hex: &str,
        file_name: &str,
        bytes: &[u8],
        first_fragment: bool,
    ) -> crate::Result<PathBuf> {
        let path = self.path_of(client_id_hex, file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(first_fragment)
            .append(!first_fragment)
            .open(&path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        Ok(path)
    }

    /// Decrypt a completed upload in place with its client's AES key.
    pub async fn decrypt_in_place(&self, path: &Path, aes_key: &[u8]) -> crate::Result<()> {
        let ciphertext = fs::read(path).await?;
        let plaintext = crypto::unwrap_file(&ciphertext, aes_key)?;
        fs::write(path, plaintext).await?;
        Ok(())
    }

    /// Read back the full (decrypted) contents of a stored file.
    pub async fn read(&self, path: &Path) -> crate::Result<Vec<u8>> {
        Ok(fs::read(path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_of_strips_directory_traversal() {
        let store = FileStore::new("transferred_files");
        let path = store.path_of("abc123", "../../../../etc/passwd");
        assert_eq!(path, PathBuf::from("transferred_files/abc123/passwd"));
    }

    #[tokio::test]
    async fn write_fragment_truncates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store
            .write_fragment("client1", "report.bin", b"first-", true)
            .await
            .unwrap();
        let path = store
            .write_fragment("client1", "report.bin", b"second", false)
            .await
            .unwrap();

        let contents = fs::read(&path).await.unwrap();
        assert_eq!(contents, b"first-second");
    }

    #[tokio::test]
    async fn decrypt_in_place_overwrites_with_plaintext() {
        use aes::Aes256;
        use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let key = crypto::new_symmetric_key();
        let plaintext = b"hello world!!!!!"; // 16 bytes, one block
        let cipher = Aes256::new(GenericArray::from_slice(&key));

        // CBC-encrypt by hand under a zero IV: block 1 is XORed with the
        // IV (a no-op here), block 2 (pure padding) is XORed with block 1's
        // ciphertext.
        let mut block = GenericArray::clone_from_slice(plaintext);
        cipher.encrypt_block(&mut block);
        let c1 = block;

        let padding = [16u8; 16];
        let mut padded_block = [0u8; 16];
        for i in 0..16 {
            padded_block[i] = padding[i] ^ c1[i];
        }
        let mut padded_block = GenericArray::from(padded_block);
        cipher.encrypt_block(&mut padded_block);

        let mut ciphertext = c1.to_vec();
        ciphertext.extend_from_slice(&padded_block);

        let path = store
            .write_fragment("client1", "report.bin", &ciphertext, true)
            .await
            .unwrap();
        store.decrypt_in_place(&path, &key).await.unwrap();

        let contents = store.read(&path).await.unwrap();
        assert_eq!(contents, plaintext);
    }
}
