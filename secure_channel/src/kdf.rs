//! NIST SP 800-108 key derivation in counter mode.
//!
//! The fixed input layout is the SCP03 one: an 11-byte zero prefix and the
//! derivation constant, a zero separator, the output length in bits, the
//! block counter, then the context (the concatenated challenges for SCP03,
//! the key agreement transcript for SCP11).

use token_common::crypto::CryptoProvider;

fn kdf_input(constant: u8, output_bits: u16, counter: u8, context: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(16 + context.len());
    input.extend_from_slice(&[0x00; 11]);
    input.push(constant);
    input.push(0x00);
    input.extend_from_slice(&output_bits.to_be_bytes());
    input.push(counter);
    input.extend_from_slice(context);

    input
}

/// Counter-mode KDF with AES-CMAC as PRF, keyed by a 16-byte parent key.
pub fn derive_cmac(
    provider: &dyn CryptoProvider,
    key: &[u8; 16],
    constant: u8,
    context: &[u8],
    output_len: usize,
) -> Vec<u8> {
    let output_bits = (output_len * 8) as u16;
    let mut output = Vec::with_capacity(output_len.next_multiple_of(16));

    for counter in 1..=output_len.div_ceil(16) {
        let input = kdf_input(constant, output_bits, counter as u8, context);
        output.extend_from_slice(&provider.aes_cmac(key, &input));
    }
    output.truncate(output_len);

    output
}

/// Counter-mode KDF with HMAC-SHA-256 as PRF, keyed by an ECDH shared
/// secret of arbitrary length.
pub fn derive_hmac(
    provider: &dyn CryptoProvider,
    key: &[u8],
    constant: u8,
    context: &[u8],
    output_len: usize,
) -> Vec<u8> {
    let output_bits = (output_len * 8) as u16;
    let mut output = Vec::with_capacity(output_len.next_multiple_of(32));

    for counter in 1..=output_len.div_ceil(32) {
        let input = kdf_input(constant, output_bits, counter as u8, context);
        output.extend_from_slice(&provider.hmac_sha256(key, &input));
    }
    output.truncate(output_len);

    output
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use token_common::crypto::{CryptoProvider, SoftwareCrypto};

    use super::*;

    #[test]
    fn test_kdf_input_layout() {
        let input = kdf_input(0x04, 0x0080, 0x01, &hex!("aabbccdd"));

        assert_eq!(input, hex!("0000000000000000000000 04 00 0080 01 aabbccdd"));
    }

    #[test]
    fn test_derive_cmac_single_block_matches_direct_cmac() {
        let key = [0x40; 16];
        let context = hex!("00010203040506071011121314151617");

        let derived = derive_cmac(&SoftwareCrypto, &key, 0x06, &context, 16);
        let direct = SoftwareCrypto.aes_cmac(&key, &kdf_input(0x06, 128, 1, &context));

        assert_eq!(derived, direct);
    }

    #[test]
    fn test_derive_cmac_truncates_to_cryptogram_size() {
        let key = [0x40; 16];
        let context = hex!("0001020304050607");

        let derived = derive_cmac(&SoftwareCrypto, &key, 0x00, &context, 8);
        let block = SoftwareCrypto.aes_cmac(&key, &kdf_input(0x00, 64, 1, &context));

        assert_eq!(derived, block[..8]);
    }

    #[test]
    fn test_derive_hmac_multi_block() {
        let secret = hex!("0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20");
        let context = b"transcript";

        let derived = derive_hmac(&SoftwareCrypto, &secret, 0x11, context, 80);

        assert_eq!(derived.len(), 80);
        // Block boundaries hold the successive PRF outputs.
        let first = SoftwareCrypto.hmac_sha256(&secret, &kdf_input(0x11, 640, 1, context));
        let second = SoftwareCrypto.hmac_sha256(&secret, &kdf_input(0x11, 640, 2, context));
        assert_eq!(derived[..32], first);
        assert_eq!(derived[32..64], second);
    }
}
