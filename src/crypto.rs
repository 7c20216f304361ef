//! Online-mode login cryptography: the RSA key pair the shared secret is
//! exchanged under, the AES/CFB8 stream ciphers, and the session server hash.

use aes::{
    Aes128,
    cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, inout::InOutBuf},
};
use anyhow::{Context, Result, anyhow, bail};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey, pkcs8::EncodePublicKey};
use sha1::{Digest, Sha1};

/// Size of the login key pair; vanilla servers use the same
const KEY_BITS: usize = 1024;

/// Length of the AES key the client picks
pub const SECRET_LEN: usize = 16;

pub type Encryptor = cfb8::Encryptor<Aes128>;
pub type Decryptor = cfb8::Decryptor<Aes128>;

/// KeyPair is the listener's login key, generated once at startup
pub struct KeyPair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

/// KeyPair implementation block
impl KeyPair {
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS).context("failed to generate login key")?;
        let public_der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .context("failed to encode login key")?
            .as_bytes()
            .to_vec();
        Ok(Self { private, public_der })
    }

    /// public_der is the public key as sent in the encryption request
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, data)
            .context("failed to decrypt login data")
    }
}

/// ciphers builds both directions of a connection's stream cipher. The
/// shared secret is both key and IV.
pub fn ciphers(secret: &[u8]) -> Result<(Encryptor, Decryptor)> {
    if secret.len() != SECRET_LEN {
        bail!("shared secret is {} bytes, expected {SECRET_LEN}", secret.len());
    }
    let encryptor = Encryptor::new_from_slices(secret, secret).map_err(|_| anyhow!("invalid shared secret"))?;
    let decryptor = Decryptor::new_from_slices(secret, secret).map_err(|_| anyhow!("invalid shared secret"))?;
    Ok((encryptor, decryptor))
}

/// encrypt runs the stream cipher over `data` in place
pub fn encrypt(cipher: &mut Encryptor, data: &mut [u8]) {
    let (blocks, _) = InOutBuf::from(data).into_chunks();
    cipher.encrypt_blocks_inout_mut(blocks);
}

/// decrypt runs the stream cipher over `data` in place
pub fn decrypt(cipher: &mut Decryptor, data: &mut [u8]) {
    let (blocks, _) = InOutBuf::from(data).into_chunks();
    cipher.decrypt_blocks_inout_mut(blocks);
}

/// server_hash is the id both client and proxy present to the session
/// server: a SHA-1 digest printed as a signed hexadecimal number
pub fn server_hash(server_id: &str, secret: &[u8], public_key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(secret);
    hasher.update(public_key);
    let mut digest: [u8; 20] = hasher.finalize().into();

    // Two's complement for negative digests
    let negative = digest[0] & 0x80 != 0;
    if negative {
        for byte in digest.iter_mut() {
            *byte = !*byte;
        }
        for byte in digest.iter_mut().rev() {
            let (value, carry) = byte.overflowing_add(1);
            *byte = value;
            if !carry {
                break;
            }
        }
    }

    let hex = hex::encode(digest);
    let trimmed = hex.trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    if negative {
        format!("-{trimmed}")
    } else {
        trimmed.to_string()
    }
}
