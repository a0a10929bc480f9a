use aes::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit};
use aes::cipher::generic_array::GenericArray;
use crate::error::{Error, Result};
use super::{CipherAlgo, Encrypt, Decrypt};

/// "aes128-cbc" cipher from RFC 4253.
pub static AES128_CBC: CipherAlgo = CipherAlgo {
    name: "aes128-cbc",
    block_len: 16,
    key_len: 16,
    iv_len: 16,
    make_encrypt: |key, iv| Ok(Box::new(CbcEncrypt(new_cbc::<cbc::Encryptor<aes::Aes128>>(key, iv)?))),
    make_decrypt: |key, iv| Ok(Box::new(CbcDecrypt(new_cbc::<cbc::Decryptor<aes::Aes128>>(key, iv)?))),
};

/// "aes256-cbc" cipher from RFC 4253.
pub static AES256_CBC: CipherAlgo = CipherAlgo {
    name: "aes256-cbc",
    block_len: 16,
    key_len: 32,
    iv_len: 16,
    make_encrypt: |key, iv| Ok(Box::new(CbcEncrypt(new_cbc::<cbc::Encryptor<aes::Aes256>>(key, iv)?))),
    make_decrypt: |key, iv| Ok(Box::new(CbcDecrypt(new_cbc::<cbc::Decryptor<aes::Aes256>>(key, iv)?))),
};

struct CbcEncrypt<T>(T);
struct CbcDecrypt<T>(T);

fn new_cbc<T: KeyIvInit>(key: &[u8], iv: &[u8]) -> Result<T> {
    T::new_from_slices(key, iv).map_err(|_| Error::Crypto("invalid key or iv length for cbc cipher"))
}

impl<T: BlockEncryptMut> Encrypt for CbcEncrypt<T> {
    fn encrypt(&mut self, data: &mut [u8]) {
        let block_len = T::block_size();
        debug_assert!(data.len() % block_len == 0, "plaintext is not aligned to block");
        for block in data.chunks_exact_mut(block_len) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

impl<T: BlockDecryptMut + BlockSizeUser> Decrypt for CbcDecrypt<T> {
    fn decrypt(&mut self, data: &mut [u8]) {
        let block_len = T::block_size();
        debug_assert!(data.len() % block_len == 0, "ciphertext is not aligned to block");
        for block in data.chunks_exact_mut(block_len) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}
