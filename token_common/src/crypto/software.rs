use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, BlockEncryptMut, BlockDecryptMut, KeyInit, KeyIvInit};
use aes::cipher::block_padding::NoPadding;
use aes::Aes128;
use cmac::{Cmac, Mac};
use hmac::Hmac;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::{OsRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{CryptoError, CryptoProvider, EcCurve, EcKeyPair};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Crypto provider backed by the RustCrypto crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareCrypto;

impl CryptoProvider for SoftwareCrypto {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0; len];
        OsRng.fill_bytes(&mut bytes);

        bytes
    }

    fn aes_cmac(&self, key: &[u8; 16], data: &[u8]) -> [u8; 16] {
        let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
        mac.update(data);

        mac.finalize().into_bytes().into()
    }

    fn aes_ecb_encrypt_block(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(key.into());
        let mut block = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut block);

        block.into()
    }

    fn aes_cbc_encrypt(&self, key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() % 16 != 0 {
            return Err(CryptoError::UnalignedInput(data.len()));
        }

        let ciphertext = Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<NoPadding>(data);

        Ok(ciphertext)
    }

    fn aes_cbc_decrypt(&self, key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = Aes128CbcDec::new(key.into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::UnalignedInput(data.len()))?;

        Ok(plaintext)
    }

    fn sha1(&self, data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
        Mac::update(&mut mac, data);

        Mac::finalize(mac).into_bytes().into()
    }

    fn ct_eq(&self, a: &[u8], b: &[u8]) -> bool {
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }

    fn generate_ec_key_pair(&self, curve: EcCurve) -> EcKeyPair {
        match curve {
            EcCurve::P256 => {
                let secret = p256::SecretKey::random(&mut OsRng);
                EcKeyPair {
                    curve,
                    public: secret.public_key().to_encoded_point(false).as_bytes().to_vec(),
                    private: Zeroizing::new(secret.to_bytes().to_vec()),
                }
            }
            EcCurve::P384 => {
                let secret = p384::SecretKey::random(&mut OsRng);
                EcKeyPair {
                    curve,
                    public: secret.public_key().to_encoded_point(false).as_bytes().to_vec(),
                    private: Zeroizing::new(secret.to_bytes().to_vec()),
                }
            }
        }
    }

    fn ecdh(&self, key_pair: &EcKeyPair, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let curve = key_pair.curve;
        let shared = match curve {
            EcCurve::P256 => {
                let secret = p256::SecretKey::from_slice(&key_pair.private)
                    .map_err(|_| CryptoError::InvalidPrivateKey(curve))?;
                let peer =
                    p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::InvalidPublicPoint(curve))?;

                p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine())
                    .raw_secret_bytes()
                    .to_vec()
            }
            EcCurve::P384 => {
                let secret = p384::SecretKey::from_slice(&key_pair.private)
                    .map_err(|_| CryptoError::InvalidPrivateKey(curve))?;
                let peer =
                    p384::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::InvalidPublicPoint(curve))?;

                p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine())
                    .raw_secret_bytes()
                    .to_vec()
            }
        };

        Ok(Zeroizing::new(shared))
    }

    fn ecdsa_sign(&self, key_pair: &EcKeyPair, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let curve = key_pair.curve;
        let signature = match curve {
            EcCurve::P256 => {
                use p256::ecdsa::signature::Signer;

                let key = p256::ecdsa::SigningKey::from_slice(&key_pair.private)
                    .map_err(|_| CryptoError::InvalidPrivateKey(curve))?;
                let signature: p256::ecdsa::Signature =
                    key.try_sign(message).map_err(|_| CryptoError::InvalidSignature)?;

                signature.to_der().as_bytes().to_vec()
            }
            EcCurve::P384 => {
                use p384::ecdsa::signature::Signer;

                let key = p384::ecdsa::SigningKey::from_slice(&key_pair.private)
                    .map_err(|_| CryptoError::InvalidPrivateKey(curve))?;
                let signature: p384::ecdsa::Signature =
                    key.try_sign(message).map_err(|_| CryptoError::InvalidSignature)?;

                signature.to_der().as_bytes().to_vec()
            }
        };

        Ok(signature)
    }

    fn ecdsa_verify(
        &self,
        curve: EcCurve,
        public: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let verified = match curve {
            EcCurve::P256 => {
                use p256::ecdsa::signature::Verifier;

                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public)
                    .map_err(|_| CryptoError::InvalidPublicPoint(curve))?;
                let signature =
                    p256::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidSignature)?;

                key.verify(message, &signature).is_ok()
            }
            EcCurve::P384 => {
                use p384::ecdsa::signature::Verifier;

                let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(public)
                    .map_err(|_| CryptoError::InvalidPublicPoint(curve))?;
                let signature =
                    p384::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidSignature)?;

                key.verify(message, &signature).is_ok()
            }
        };

        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use hex_literal::hex;
    use rstest::rstest;

    use super::*;

    const RFC4493_KEY: [u8; 16] = hex!("2b7e151628aed2a6abf7158809cf4f3c");

    #[rstest]
    #[case(&[] as &[u8], hex!("bb1d6929e95937287fa37d129b756746"))]
    #[case(&hex!("6bc1bee22e409f96e93d7e117393172a"), hex!("070a16b46b4d4144f79bdd9dd04a287c"))]
    fn test_aes_cmac_rfc4493(#[case] message: &[u8], #[case] expected: [u8; 16]) {
        assert_eq!(SoftwareCrypto.aes_cmac(&RFC4493_KEY, message), expected);
    }

    #[test]
    fn test_aes_ecb_fips197() {
        let block = hex!("6bc1bee22e409f96e93d7e117393172a");

        assert_eq!(
            SoftwareCrypto.aes_ecb_encrypt_block(&RFC4493_KEY, &block),
            hex!("3ad77bb40d7a3660a89ecaf32466ef97")
        );
    }

    #[test]
    fn test_aes_cbc_nist_sp800_38a() {
        let iv = hex!("000102030405060708090a0b0c0d0e0f");
        let plaintext = hex!("6bc1bee22e409f96e93d7e117393172a");
        let ciphertext = hex!("7649abac8119b246cee98e9b12e9197d");

        let encrypted = SoftwareCrypto.aes_cbc_encrypt(&RFC4493_KEY, &iv, &plaintext).unwrap();
        assert_eq!(encrypted, ciphertext);

        let decrypted = SoftwareCrypto.aes_cbc_decrypt(&RFC4493_KEY, &iv, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aes_cbc_rejects_unaligned_input() {
        let result = SoftwareCrypto.aes_cbc_encrypt(&RFC4493_KEY, &[0; 16], &[0; 15]);

        assert_matches!(result, Err(CryptoError::UnalignedInput(15)));
    }

    #[test]
    fn test_digests() {
        assert_eq!(SoftwareCrypto.sha1(b"abc"), hex!("a9993e364706816aba3e25717850c26c9cd0d89d"));
        assert_eq!(
            SoftwareCrypto.sha256(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231() {
        let tag = SoftwareCrypto.hmac_sha256(&[0x0b; 20], b"Hi There");

        assert_eq!(
            tag,
            hex!("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7")
        );
    }

    #[test]
    fn test_ct_eq() {
        assert!(SoftwareCrypto.ct_eq(&[1, 2, 3], &[1, 2, 3]));
        assert!(!SoftwareCrypto.ct_eq(&[1, 2, 3], &[1, 2, 4]));
        assert!(!SoftwareCrypto.ct_eq(&[1, 2, 3], &[1, 2]));
    }

    #[rstest]
    #[case(EcCurve::P256)]
    #[case(EcCurve::P384)]
    fn test_ecdh_shared_secret_agrees(#[case] curve: EcCurve) {
        let alice = SoftwareCrypto.generate_ec_key_pair(curve);
        let bob = SoftwareCrypto.generate_ec_key_pair(curve);

        assert_eq!(alice.public.len(), curve.point_size());
        assert_eq!(alice.private.len(), curve.field_size());

        let alice_shared = SoftwareCrypto.ecdh(&alice, &bob.public).unwrap();
        let bob_shared = SoftwareCrypto.ecdh(&bob, &alice.public).unwrap();

        assert_eq!(*alice_shared, *bob_shared);
        assert_eq!(alice_shared.len(), curve.field_size());
    }

    #[rstest]
    #[case(EcCurve::P256)]
    #[case(EcCurve::P384)]
    fn test_ecdsa_sign_verify(#[case] curve: EcCurve) {
        let key_pair = SoftwareCrypto.generate_ec_key_pair(curve);

        let signature = SoftwareCrypto.ecdsa_sign(&key_pair, b"attestation payload").unwrap();

        assert!(SoftwareCrypto
            .ecdsa_verify(curve, &key_pair.public, b"attestation payload", &signature)
            .unwrap());
        assert!(!SoftwareCrypto
            .ecdsa_verify(curve, &key_pair.public, b"attestation payloae", &signature)
            .unwrap());
    }

    #[test]
    fn test_ecdh_rejects_foreign_point() {
        let key_pair = SoftwareCrypto.generate_ec_key_pair(EcCurve::P256);
        let peer = SoftwareCrypto.generate_ec_key_pair(EcCurve::P384);

        assert_matches!(
            SoftwareCrypto.ecdh(&key_pair, &peer.public),
            Err(CryptoError::InvalidPublicPoint(EcCurve::P256))
        );
    }
}
