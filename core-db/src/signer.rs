//! Device database signer.
//!
//! Post-2007 devices verify a keyed hash stamped into the mhbd header and
//! reject the database when it does not match, so signing is part of the
//! codec's correctness contract. Two schemes are implemented:
//!
//! - **HASH58** — HMAC-SHA1 under a key derived from the device's 8-byte
//!   FireWire GUID (Nano 3G/4G, Classic).
//! - **HASH72** — AES-128-CBC over the database SHA-1, keyed by a constant
//!   and the per-device `HashInfo` IV/rndpart (Classic, Nano 4G/5G).
//!
//! The Classic firmware checks HASH58 but iTunes writes both; HASH72 must
//! be written first because its bytes are part of HASH58's input.
//!
//! Header geometry: scheme selector u16 at 0x30, HASH58 slot 20 bytes at
//! 0x58, HASH72 slot 46 bytes at 0x72, db_id 8 bytes at 0x18, unk_0x32
//! 20 bytes at 0x32.

use crate::error::{DbError, Result};
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use core_device::{ChecksumKind, HashInfo};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

pub const OFFSET_DB_ID: usize = 0x18;
pub const OFFSET_SCHEME: usize = 0x30;
pub const OFFSET_UNK_0X32: usize = 0x32;
pub const OFFSET_HASH58: usize = 0x58;
pub const OFFSET_HASH72: usize = 0x72;
pub const HASH58_LEN: usize = 20;
pub const HASH72_LEN: usize = 46;

/// Minimum buffer length that contains every signed range.
const MIN_DB_LEN: usize = OFFSET_HASH72 + HASH72_LEN;

/// AES-128 key for HASH72 signatures (fixed across all devices).
const HASH72_AES_KEY: [u8; 16] = [
    0x61, 0x8C, 0xA1, 0x0D, 0xC7, 0xF5, 0x7F, 0xD3, 0xB4, 0x72, 0x3E, 0x08, 0x15, 0x74, 0x63,
    0xD7,
];

/// Constant prefixed to the derived bytes before the HASH58 key SHA-1.
const HASH58_PREFIX: [u8; 18] = [
    0x67, 0x23, 0xFE, 0x30, 0x45, 0x33, 0xF8, 0x90, 0x99, 0x21, 0x07, 0xC1, 0xD0, 0x12, 0xB2,
    0xA1, 0x07, 0x81,
];

/// AES forward S-box (T1 of the HASH58 key schedule).
#[rustfmt::skip]
const SBOX: [u8; 256] = [
    0x63, 0x7C, 0x77, 0x7B, 0xF2, 0x6B, 0x6F, 0xC5, 0x30, 0x01, 0x67, 0x2B, 0xFE, 0xD7, 0xAB, 0x76,
    0xCA, 0x82, 0xC9, 0x7D, 0xFA, 0x59, 0x47, 0xF0, 0xAD, 0xD4, 0xA2, 0xAF, 0x9C, 0xA4, 0x72, 0xC0,
    0xB7, 0xFD, 0x93, 0x26, 0x36, 0x3F, 0xF7, 0xCC, 0x34, 0xA5, 0xE5, 0xF1, 0x71, 0xD8, 0x31, 0x15,
    0x04, 0xC7, 0x23, 0xC3, 0x18, 0x96, 0x05, 0x9A, 0x07, 0x12, 0x80, 0xE2, 0xEB, 0x27, 0xB2, 0x75,
    0x09, 0x83, 0x2C, 0x1A, 0x1B, 0x6E, 0x5A, 0xA0, 0x52, 0x3B, 0xD6, 0xB3, 0x29, 0xE3, 0x2F, 0x84,
    0x53, 0xD1, 0x00, 0xED, 0x20, 0xFC, 0xB1, 0x5B, 0x6A, 0xCB, 0xBE, 0x39, 0x4A, 0x4C, 0x58, 0xCF,
    0xD0, 0xEF, 0xAA, 0xFB, 0x43, 0x4D, 0x33, 0x85, 0x45, 0xF9, 0x02, 0x7F, 0x50, 0x3C, 0x9F, 0xA8,
    0x51, 0xA3, 0x40, 0x8F, 0x92, 0x9D, 0x38, 0xF5, 0xBC, 0xB6, 0xDA, 0x21, 0x10, 0xFF, 0xF3, 0xD2,
    0xCD, 0x0C, 0x13, 0xEC, 0x5F, 0x97, 0x44, 0x17, 0xC4, 0xA7, 0x7E, 0x3D, 0x64, 0x5D, 0x19, 0x73,
    0x60, 0x81, 0x4F, 0xDC, 0x22, 0x2A, 0x90, 0x88, 0x46, 0xEE, 0xB8, 0x14, 0xDE, 0x5E, 0x0B, 0xDB,
    0xE0, 0x32, 0x3A, 0x0A, 0x49, 0x06, 0x24, 0x5C, 0xC2, 0xD3, 0xAC, 0x62, 0x91, 0x95, 0xE4, 0x79,
    0xE7, 0xC8, 0x37, 0x6D, 0x8D, 0xD5, 0x4E, 0xA9, 0x6C, 0x56, 0xF4, 0xEA, 0x65, 0x7A, 0xAE, 0x08,
    0xBA, 0x78, 0x25, 0x2E, 0x1C, 0xA6, 0xB4, 0xC6, 0xE8, 0xDD, 0x74, 0x1F, 0x4B, 0xBD, 0x8B, 0x8A,
    0x70, 0x3E, 0xB5, 0x66, 0x48, 0x03, 0xF6, 0x0E, 0x61, 0x35, 0x57, 0xB9, 0x86, 0xC1, 0x1D, 0x9E,
    0xE1, 0xF8, 0x98, 0x11, 0x69, 0xD9, 0x8E, 0x94, 0x9B, 0x1E, 0x87, 0xE9, 0xCE, 0x55, 0x28, 0xDF,
    0x8C, 0xA1, 0x89, 0x0D, 0xBF, 0xE6, 0x42, 0x68, 0x41, 0x99, 0x2D, 0x0F, 0xB0, 0x54, 0xBB, 0x16,
];

/// AES inverse S-box (T2 of the HASH58 key schedule).
#[rustfmt::skip]
const SBOX_INV: [u8; 256] = [
    0x52, 0x09, 0x6A, 0xD5, 0x30, 0x36, 0xA5, 0x38, 0xBF, 0x40, 0xA3, 0x9E, 0x81, 0xF3, 0xD7, 0xFB,
    0x7C, 0xE3, 0x39, 0x82, 0x9B, 0x2F, 0xFF, 0x87, 0x34, 0x8E, 0x43, 0x44, 0xC4, 0xDE, 0xE9, 0xCB,
    0x54, 0x7B, 0x94, 0x32, 0xA6, 0xC2, 0x23, 0x3D, 0xEE, 0x4C, 0x95, 0x0B, 0x42, 0xFA, 0xC3, 0x4E,
    0x08, 0x2E, 0xA1, 0x66, 0x28, 0xD9, 0x24, 0xB2, 0x76, 0x5B, 0xA2, 0x49, 0x6D, 0x8B, 0xD1, 0x25,
    0x72, 0xF8, 0xF6, 0x64, 0x86, 0x68, 0x98, 0x16, 0xD4, 0xA4, 0x5C, 0xCC, 0x5D, 0x65, 0xB6, 0x92,
    0x6C, 0x70, 0x48, 0x50, 0xFD, 0xED, 0xB9, 0xDA, 0x5E, 0x15, 0x46, 0x57, 0xA7, 0x8D, 0x9D, 0x84,
    0x90, 0xD8, 0xAB, 0x00, 0x8C, 0xBC, 0xD3, 0x0A, 0xF7, 0xE4, 0x58, 0x05, 0xB8, 0xB3, 0x45, 0x06,
    0xD0, 0x2C, 0x1E, 0x8F, 0xCA, 0x3F, 0x0F, 0x02, 0xC1, 0xAF, 0xBD, 0x03, 0x01, 0x13, 0x8A, 0x6B,
    0x3A, 0x91, 0x11, 0x41, 0x4F, 0x67, 0xDC, 0xEA, 0x97, 0xF2, 0xCF, 0xCE, 0xF0, 0xB4, 0xE6, 0x73,
    0x96, 0xAC, 0x74, 0x22, 0xE7, 0xAD, 0x35, 0x85, 0xE2, 0xF9, 0x37, 0xE8, 0x1C, 0x75, 0xDF, 0x6E,
    0x47, 0xF1, 0x1A, 0x71, 0x1D, 0x29, 0xC5, 0x89, 0x6F, 0xB7, 0x62, 0x0E, 0xAA, 0x18, 0xBE, 0x1B,
    0xFC, 0x56, 0x3E, 0x4B, 0xC6, 0xD2, 0x79, 0x20, 0x9A, 0xDB, 0xC0, 0xFE, 0x78, 0xCD, 0x5A, 0xF4,
    0x1F, 0xDD, 0xA8, 0x33, 0x88, 0x07, 0xC7, 0x31, 0xB1, 0x12, 0x10, 0x59, 0x27, 0x80, 0xEC, 0x5F,
    0x60, 0x51, 0x7F, 0xA9, 0x19, 0xB5, 0x4A, 0x0D, 0x2D, 0xE5, 0x7A, 0x9F, 0x93, 0xC9, 0x9C, 0xEF,
    0xA0, 0xE0, 0x3B, 0x4D, 0xAE, 0x2A, 0xF5, 0xB0, 0xC8, 0xEB, 0xBB, 0x3C, 0x83, 0x53, 0x99, 0x61,
    0x17, 0x2B, 0x04, 0x7E, 0xBA, 0x77, 0xD6, 0x26, 0xE1, 0x69, 0x14, 0x63, 0x55, 0x21, 0x0C, 0x7D,
];

fn check_header(db: &[u8]) -> Result<()> {
    if db.len() < MIN_DB_LEN {
        return Err(DbError::InvariantViolation(format!(
            "database too small to sign ({} bytes)",
            db.len()
        )));
    }
    if &db[..4] != b"mhbd" {
        return Err(DbError::InvariantViolation(
            "signer input is not an mhbd database".into(),
        ));
    }
    Ok(())
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// `lcm` with the device's convention that a zero operand yields 1.
fn lcm(a: u8, b: u8) -> u32 {
    if a == 0 || b == 0 {
        return 1;
    }
    let (a, b) = (a as u32, b as u32);
    a / gcd(a, b) * b
}

/// Derive the HMAC-SHA1 key from the FireWire GUID.
///
/// For each GUID byte pair, the lcm's high and low bytes index the forward
/// and inverse S-boxes into a 16-byte vector; the key is the SHA-1 of an
/// 18-byte constant followed by that vector. (HMAC zero-pads short keys to
/// the block size, so the 20-byte digest is used directly.)
fn hash58_key(guid: &[u8; 8]) -> [u8; 20] {
    let mut y = [0u8; 16];
    for i in 0..4 {
        let l = lcm(guid[2 * i], guid[2 * i + 1]);
        let hi = ((l >> 8) & 0xFF) as usize;
        let lo = (l & 0xFF) as usize;
        y[4 * i] = SBOX[hi];
        y[4 * i + 1] = SBOX_INV[hi];
        y[4 * i + 2] = SBOX[lo];
        y[4 * i + 3] = SBOX_INV[lo];
    }

    let mut hasher = Sha1::new();
    hasher.update(HASH58_PREFIX);
    hasher.update(y);
    hasher.finalize().into()
}

/// HASH58 hash input: db_id, unk_0x32, and the HASH58 slot read as zero.
/// The HASH72 slot is covered, which is why HASH72 goes in first.
fn hash58_normalized(db: &[u8]) -> Vec<u8> {
    let mut data = db.to_vec();
    data[OFFSET_DB_ID..OFFSET_DB_ID + 8].fill(0);
    data[OFFSET_UNK_0X32..OFFSET_UNK_0X32 + HASH58_LEN].fill(0);
    data[OFFSET_HASH58..OFFSET_HASH58 + HASH58_LEN].fill(0);
    data
}

/// HASH72 hash input: db_id and both signature slots read as zero
/// (unk_0x32 is NOT zeroed here).
fn hash72_normalized(db: &[u8]) -> Vec<u8> {
    let mut data = db.to_vec();
    data[OFFSET_DB_ID..OFFSET_DB_ID + 8].fill(0);
    data[OFFSET_HASH58..OFFSET_HASH58 + HASH58_LEN].fill(0);
    data[OFFSET_HASH72..OFFSET_HASH72 + HASH72_LEN].fill(0);
    data
}

/// Compute the 20-byte HASH58 signature for a database image.
pub fn hash58_signature(db: &[u8], guid: &[u8; 8]) -> Result<[u8; 20]> {
    check_header(db)?;
    let key = hash58_key(guid);
    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| DbError::InvariantViolation(format!("hmac key: {e}")))?;
    mac.update(&hash58_normalized(db));
    Ok(mac.finalize().into_bytes().into())
}

/// Compute the 46-byte HASH72 signature: `01 00 ‖ rndpart ‖
/// AES-CBC(sha1 ‖ rndpart)`.
pub fn hash72_signature(db: &[u8], info: &HashInfo) -> Result<[u8; 46]> {
    check_header(db)?;

    let sha1: [u8; 20] = Sha1::digest(hash72_normalized(db)).into();

    let mut plaintext = [0u8; 32];
    plaintext[..20].copy_from_slice(&sha1);
    plaintext[20..].copy_from_slice(&info.rndpart);

    let cipher = Aes128CbcEnc::new_from_slices(&HASH72_AES_KEY, &info.iv)
        .map_err(|e| DbError::InvariantViolation(format!("aes-cbc init: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&plaintext);

    let mut signature = [0u8; 46];
    signature[0] = 0x01;
    signature[1] = 0x00;
    signature[2..14].copy_from_slice(&info.rndpart);
    signature[14..46].copy_from_slice(&ciphertext);
    Ok(signature)
}

/// Check an existing HASH72 signature against the buffer contents.
pub fn verify_hash72(db: &[u8], info: &HashInfo) -> bool {
    match hash72_signature(db, info) {
        Ok(expected) => db.len() >= MIN_DB_LEN && db[OFFSET_HASH72..MIN_DB_LEN] == expected,
        Err(_) => false,
    }
}

/// Recover `(iv, rndpart)` from a genuinely signed database.
///
/// CBC's first block is `AES(P0 xor IV)`; decrypting it under `sha1[..16]`
/// as a fake IV yields `(P0 xor IV) xor sha1[..16] = IV`, because the real
/// first plaintext block is exactly `sha1[..16]`.
pub fn extract_hash_info(db: &[u8]) -> Option<([u8; 16], [u8; 12])> {
    if db.len() < MIN_DB_LEN || &db[..4] != b"mhbd" {
        return None;
    }
    let signature = &db[OFFSET_HASH72..MIN_DB_LEN];
    if signature[0] != 0x01 || signature[1] != 0x00 {
        return None;
    }

    let mut rndpart = [0u8; 12];
    rndpart.copy_from_slice(&signature[2..14]);

    let sha1: [u8; 20] = Sha1::digest(hash72_normalized(db)).into();

    let cipher = Aes128CbcDec::new_from_slices(&HASH72_AES_KEY, &sha1[..16]).ok()?;
    let mut block = [0u8; 16];
    block.copy_from_slice(&signature[14..30]);
    let decrypted = cipher.decrypt_padded_vec_mut::<NoPadding>(&block).ok()?;

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&decrypted);
    Some((iv, rndpart))
}

/// Sign a database image in place for a device class.
///
/// Identity fields excluded from a hash are only ever zeroed on scratch
/// copies, so the buffer's own bytes are intact when the signature lands in
/// its slot.
///
/// # Errors
///
/// `SignerInputMissing` when the device class requires key material that
/// was not supplied, or requires HASHAB (unsupported).
pub fn sign(
    db: &mut [u8],
    kind: ChecksumKind,
    guid: Option<&[u8; 8]>,
    hashinfo: Option<&HashInfo>,
) -> Result<()> {
    check_header(db)?;

    match kind {
        ChecksumKind::None | ChecksumKind::Unknown => {
            if kind == ChecksumKind::Unknown {
                warn!("device not in checksum table; writing unsigned database");
            }
            db[OFFSET_SCHEME..OFFSET_SCHEME + 2].copy_from_slice(&0u16.to_le_bytes());
            Ok(())
        }
        ChecksumKind::Hash58 => {
            let guid = guid.ok_or_else(|| {
                DbError::SignerInputMissing("FireWire GUID required for HASH58".into())
            })?;
            // Classic pattern: HASH72 first when the key material exists,
            // because HASH58 covers the HASH72 bytes.
            if let Some(info) = hashinfo {
                let signature = hash72_signature(db, info)?;
                db[OFFSET_HASH72..MIN_DB_LEN].copy_from_slice(&signature);
                debug!("hash72 signature written before hash58");
            }
            let signature = hash58_signature(db, guid)?;
            db[OFFSET_HASH58..OFFSET_HASH58 + HASH58_LEN].copy_from_slice(&signature);
            db[OFFSET_SCHEME..OFFSET_SCHEME + 2].copy_from_slice(&1u16.to_le_bytes());
            Ok(())
        }
        ChecksumKind::Hash72 => {
            let info = hashinfo.ok_or_else(|| {
                DbError::SignerInputMissing("HashInfo required for HASH72".into())
            })?;
            let signature = hash72_signature(db, info)?;
            db[OFFSET_HASH72..MIN_DB_LEN].copy_from_slice(&signature);
            db[OFFSET_SCHEME..OFFSET_SCHEME + 2].copy_from_slice(&2u16.to_le_bytes());
            Ok(())
        }
        ChecksumKind::Unsupported => Err(DbError::SignerInputMissing(
            "device requires HASHAB, which is not supported".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_db(len: usize) -> Vec<u8> {
        let mut db = vec![0u8; len];
        db[..4].copy_from_slice(b"mhbd");
        db[4..8].copy_from_slice(&244u32.to_le_bytes());
        db[8..12].copy_from_slice(&(len as u32).to_le_bytes());
        // Non-zero identity fields so normalization is observable.
        db[OFFSET_DB_ID..OFFSET_DB_ID + 8].copy_from_slice(&0x1122334455667788u64.to_le_bytes());
        for (i, b) in db[OFFSET_UNK_0X32..OFFSET_UNK_0X32 + 20].iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        for (i, b) in db[244..].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        db
    }

    fn hashinfo() -> HashInfo {
        HashInfo {
            uuid: [9u8; 20],
            rndpart: *b"rndpartbytes",
            iv: [7u8; 16],
        }
    }

    #[test]
    fn lcm_zero_convention() {
        assert_eq!(lcm(0, 5), 1);
        assert_eq!(lcm(5, 0), 1);
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(255, 254), 64770);
    }

    #[test]
    fn sbox_tables_are_inverse() {
        for i in 0..256 {
            assert_eq!(SBOX_INV[SBOX[i] as usize] as usize, i);
        }
    }

    #[test]
    fn hash58_is_deterministic_and_guid_sensitive() {
        let db = fake_db(600);
        let guid = [1, 2, 3, 4, 5, 6, 7, 8];
        let a = hash58_signature(&db, &guid).unwrap();
        let b = hash58_signature(&db, &guid).unwrap();
        assert_eq!(a, b);

        let other = hash58_signature(&db, &[8, 7, 6, 5, 4, 3, 2, 1]).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn hash58_ignores_identity_fields() {
        let guid = [1, 2, 3, 4, 5, 6, 7, 8];
        let db = fake_db(600);
        let mut altered = db.clone();
        altered[OFFSET_DB_ID] ^= 0xFF;
        altered[OFFSET_UNK_0X32 + 3] ^= 0xFF;
        assert_eq!(
            hash58_signature(&db, &guid).unwrap(),
            hash58_signature(&altered, &guid).unwrap()
        );
    }

    #[test]
    fn hash72_signature_structure() {
        let db = fake_db(600);
        let info = hashinfo();
        let signature = hash72_signature(&db, &info).unwrap();
        assert_eq!(signature[0], 0x01);
        assert_eq!(signature[1], 0x00);
        assert_eq!(&signature[2..14], &info.rndpart);
    }

    #[test]
    fn signed_hash72_verifies_and_extracts() {
        let mut db = fake_db(600);
        let info = hashinfo();
        sign(&mut db, ChecksumKind::Hash72, None, Some(&info)).unwrap();

        // Pure-HASH72 devices (Nano 5G class) get scheme selector 2.
        assert_eq!(
            u16::from_le_bytes([db[OFFSET_SCHEME], db[OFFSET_SCHEME + 1]]),
            2
        );
        assert!(verify_hash72(&db, &info));

        let (iv, rndpart) = extract_hash_info(&db).expect("extraction");
        assert_eq!(iv, info.iv);
        assert_eq!(rndpart, info.rndpart);
    }

    #[test]
    fn classic_writes_both_hashes() {
        let mut db = fake_db(600);
        let info = hashinfo();
        let guid = [1, 2, 3, 4, 5, 6, 7, 8];
        sign(&mut db, ChecksumKind::Hash58, Some(&guid), Some(&info)).unwrap();

        assert!(db[OFFSET_HASH58..OFFSET_HASH58 + HASH58_LEN]
            .iter()
            .any(|&b| b != 0));
        assert_eq!(db[OFFSET_HASH72], 0x01);
        assert_eq!(
            u16::from_le_bytes([db[OFFSET_SCHEME], db[OFFSET_SCHEME + 1]]),
            1
        );
        // The hash58 bytes must cover the hash72 signature.
        let with72 = hash58_signature(&db, &guid).unwrap();
        let mut without72 = db.clone();
        without72[OFFSET_HASH72..MIN_DB_LEN].fill(0);
        assert_ne!(with72, hash58_signature(&without72, &guid).unwrap());
    }

    #[test]
    fn signing_same_buffer_twice_is_stable() {
        let info = hashinfo();
        let guid = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut a = fake_db(600);
        let mut b = fake_db(600);
        sign(&mut a, ChecksumKind::Hash58, Some(&guid), Some(&info)).unwrap();
        sign(&mut b, ChecksumKind::Hash58, Some(&guid), Some(&info)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_inputs_are_fatal() {
        let mut db = fake_db(600);
        assert!(matches!(
            sign(&mut db, ChecksumKind::Hash58, None, None),
            Err(DbError::SignerInputMissing(_))
        ));
        assert!(matches!(
            sign(&mut db, ChecksumKind::Hash72, None, None),
            Err(DbError::SignerInputMissing(_))
        ));
        assert!(matches!(
            sign(&mut db, ChecksumKind::Unsupported, None, None),
            Err(DbError::SignerInputMissing(_))
        ));
    }

    #[test]
    fn unsigned_devices_get_scheme_zero() {
        let mut db = fake_db(600);
        sign(&mut db, ChecksumKind::None, None, None).unwrap();
        assert_eq!(
            u16::from_le_bytes([db[OFFSET_SCHEME], db[OFFSET_SCHEME + 1]]),
            0
        );
    }
}
