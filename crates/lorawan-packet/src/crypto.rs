//! LoRaWAN 1.0.x security primitives.
//!
//! - Message Integrity Code over data frames (AES-CMAC with a B0 prefix block)
//! - FRMPayload encryption (AES-128 keystream built from A blocks)
//! - Join request / join accept MIC and join accept encryption
//! - Session key derivation from the root AppKey

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::{AesKey, DevAddr, Direction, SecurityError};

/// MIC size in bytes.
pub const MIC_SIZE: usize = 4;

const BLOCK_SIZE: usize = 16;

fn cipher(key: &AesKey) -> Aes128 {
    Aes128::new(key.as_bytes().into())
}

fn cmac4(key: &AesKey, parts: &[&[u8]]) -> Result<[u8; MIC_SIZE], SecurityError> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| SecurityError::InvalidKeyLength(key.as_bytes().len()))?;
    for part in parts {
        mac.update(part);
    }
    let full = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    Ok(mic)
}

/// Compute the MIC of a data frame.
///
/// `msg` is the exact serialization of MHDR | FHDR | FPort | FRMPayload.
pub fn compute_data_mic(
    nwk_skey: &AesKey,
    msg: &[u8],
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
) -> Result<[u8; MIC_SIZE], SecurityError> {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = msg.len() as u8;
    cmac4(nwk_skey, &[&b0, msg])
}

/// Encrypt or decrypt an FRMPayload. The operation is its own inverse.
pub fn crypt_frm_payload(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = cipher(key);
    let mut out = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01;
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;
        cipher.encrypt_block((&mut a).into());
        out.extend(chunk.iter().zip(a.iter()).map(|(p, s)| p ^ s));
    }

    out
}

/// MIC over MHDR | JoinEUI | DevEUI | DevNonce.
pub fn compute_join_request_mic(app_key: &AesKey, msg: &[u8]) -> Result<[u8; MIC_SIZE], SecurityError> {
    cmac4(app_key, &[msg])
}

/// MIC over MHDR | AppNonce | NetID | DevAddr | DLSettings | RxDelay.
pub fn compute_join_accept_mic(app_key: &AesKey, msg: &[u8]) -> Result<[u8; MIC_SIZE], SecurityError> {
    cmac4(app_key, &[msg])
}

/// Network-side join accept encryption: AES decrypt of payload | MIC.
///
/// Input length must be a multiple of 16 bytes.
pub fn encrypt_join_accept(app_key: &AesKey, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(SecurityError::DecryptionFailed(format!(
            "join accept length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    let cipher = cipher(app_key);
    let mut out = data.to_vec();
    for chunk in out.chunks_mut(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        cipher.decrypt_block((&mut block).into());
        chunk.copy_from_slice(&block);
    }
    Ok(out)
}

/// Device-side inverse of [`encrypt_join_accept`].
pub fn decrypt_join_accept(app_key: &AesKey, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(SecurityError::DecryptionFailed(format!(
            "join accept length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    let cipher = cipher(app_key);
    let mut out = data.to_vec();
    for chunk in out.chunks_mut(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        cipher.encrypt_block((&mut block).into());
        chunk.copy_from_slice(&block);
    }
    Ok(out)
}

/// Derive (NwkSKey, AppSKey) from the root key and join parameters.
pub fn derive_session_keys(
    app_key: &AesKey,
    app_nonce: u32,
    net_id: u32,
    dev_nonce: u16,
) -> (AesKey, AesKey) {
    let cipher = cipher(app_key);
    let derive = |prefix: u8| {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = prefix;
        block[1..4].copy_from_slice(&app_nonce.to_le_bytes()[..3]);
        block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
        block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        cipher.encrypt_block((&mut block).into());
        AesKey::new(block)
    };
    (derive(0x01), derive(0x02))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> AesKey {
        AesKey::new([byte; 16])
    }

    #[test]
    fn test_frm_payload_roundtrip() {
        let k = key(0x2B);
        let payload = b"temperature=21.5;humidity=40".to_vec();
        let enc = crypt_frm_payload(&k, DevAddr(0x2601_1BDA), 7, Direction::Up, &payload);
        assert_ne!(enc, payload);
        let dec = crypt_frm_payload(&k, DevAddr(0x2601_1BDA), 7, Direction::Up, &enc);
        assert_eq!(dec, payload);
    }

    #[test]
    fn test_keystream_depends_on_counter_and_direction() {
        let k = key(0x11);
        let payload = vec![0u8; 20];
        let a = crypt_frm_payload(&k, DevAddr(1), 1, Direction::Up, &payload);
        let b = crypt_frm_payload(&k, DevAddr(1), 2, Direction::Up, &payload);
        let c = crypt_frm_payload(&k, DevAddr(1), 1, Direction::Down, &payload);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_data_mic_detects_single_bit_flip() {
        let k = key(0x42);
        let msg = vec![0x40, 1, 2, 3, 4, 0x80, 5, 0, 1, 0xAA, 0xBB, 0xCC];
        let mic = compute_data_mic(&k, &msg, DevAddr(0x0403_0201), 5, Direction::Up).unwrap();
        for byte in 0..msg.len() {
            for bit in 0..8 {
                let mut mutated = msg.clone();
                mutated[byte] ^= 1 << bit;
                let other =
                    compute_data_mic(&k, &mutated, DevAddr(0x0403_0201), 5, Direction::Up).unwrap();
                assert_ne!(mic, other, "flip at byte {} bit {} not detected", byte, bit);
            }
        }
    }

    #[test]
    fn test_join_accept_encryption_roundtrip() {
        let k = key(0x77);
        let data: Vec<u8> = (0..16u8).collect();
        let enc = encrypt_join_accept(&k, &data).unwrap();
        assert_ne!(enc, data);
        assert_eq!(decrypt_join_accept(&k, &enc).unwrap(), data);
    }

    #[test]
    fn test_join_accept_rejects_partial_block() {
        assert!(encrypt_join_accept(&key(1), &[0u8; 15]).is_err());
        assert!(decrypt_join_accept(&key(1), &[0u8; 17]).is_err());
    }

    #[test]
    fn test_session_keys_differ_and_depend_on_nonce() {
        let k = key(0x01);
        let (nwk, app) = derive_session_keys(&k, 0x00AB_CDEF, 0x13, 1);
        assert_ne!(nwk, app);
        let (nwk2, _) = derive_session_keys(&k, 0x00AB_CDEF, 0x13, 2);
        assert_ne!(nwk, nwk2);
    }
}
