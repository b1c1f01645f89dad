use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

pub const SIGN_PUBLIC_KEY_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_SECRET_KEY_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;
pub const EXCHANGE_KEY_SIZE: usize = libsodium_sys::crypto_scalarmult_BYTES as usize;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size will be
/// the plain text size plus the MAC size. The function will fail if the cipher slice is not
/// exactly that large.
///
/// The additional data, nonce and key must match those used during decryption, the decryption
/// will fail otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is equal
/// to the cipher text length minus the MAC size. The function will fail if the sizes do not
/// match or the message fails authentication.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Generates a fresh Ed25519 signing keypair.
#[inline]
pub fn sign_keypair() -> ([u8; SIGN_PUBLIC_KEY_SIZE], [u8; SIGN_SECRET_KEY_SIZE]) {
    let mut public = [0u8; SIGN_PUBLIC_KEY_SIZE];
    let mut secret = [0u8; SIGN_SECRET_KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_sign_keypair(public.as_mut_ptr(), secret.as_mut_ptr());
    }

    (public, secret)
}

/// Converts an Ed25519 public key into its Curve25519 counterpart for key exchange.
/// Returns `None` for public keys outside the valid group.
#[inline]
pub fn public_to_exchange(public: &[u8; SIGN_PUBLIC_KEY_SIZE]) -> Option<[u8; EXCHANGE_KEY_SIZE]> {
    let mut exchange = [0u8; EXCHANGE_KEY_SIZE];

    let result =
        unsafe { libsodium_sys::crypto_sign_ed25519_pk_to_curve25519(exchange.as_mut_ptr(), public.as_ptr()) };

    match result {
        0 => Some(exchange),
        _ => None,
    }
}

/// Converts an Ed25519 secret key into its Curve25519 counterpart for key exchange.
#[inline]
pub fn secret_to_exchange(secret: &[u8; SIGN_SECRET_KEY_SIZE]) -> Option<[u8; EXCHANGE_KEY_SIZE]> {
    let mut exchange = [0u8; EXCHANGE_KEY_SIZE];

    let result =
        unsafe { libsodium_sys::crypto_sign_ed25519_sk_to_curve25519(exchange.as_mut_ptr(), secret.as_ptr()) };

    match result {
        0 => Some(exchange),
        _ => None,
    }
}

/// X25519 shared secret between a local exchange secret and a peer exchange public key.
/// Returns `None` when the peer key is a low-order point.
#[inline]
pub fn shared_secret(
    secret: &[u8; EXCHANGE_KEY_SIZE],
    peer_public: &[u8; EXCHANGE_KEY_SIZE],
) -> Option<[u8; EXCHANGE_KEY_SIZE]> {
    let mut shared = [0u8; EXCHANGE_KEY_SIZE];

    let result = unsafe {
        libsodium_sys::crypto_scalarmult(shared.as_mut_ptr(), secret.as_ptr(), peer_public.as_ptr())
    };

    match result {
        0 => Some(shared),
        _ => None,
    }
}

/// Derives a symmetric key from a shared secret and arbitrary key material using keyed BLAKE2b.
#[inline]
pub fn derive_key(secret: &[u8; EXCHANGE_KEY_SIZE], material: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_generichash(
            key.as_mut_ptr(),
            key.len(),
            material.as_ptr(),
            material.len() as u64,
            secret.as_ptr(),
            secret.len(),
        );
    }

    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);

        let mut nonce = [0u8; NONCE_SIZE];
        random_bytes(&mut nonce);

        let plain = b"one ip frame worth of data";
        let ad = [7u8; 18];

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain[..], &ad, &nonce, &key));

        let mut decoded = vec![0u8; plain.len()];
        assert!(decrypt(&mut decoded, &cipher, &ad, &nonce, &key));

        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn test_decrypt_key_mismatch() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);

        let nonce = [3u8; NONCE_SIZE];
        let plain = [1u8; 64];

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain, &[], &nonce, &key));

        key[0] ^= 1;

        let mut decoded = vec![0u8; plain.len()];
        assert!(!decrypt(&mut decoded, &cipher, &[], &nonce, &key));
    }

    #[test]
    fn test_decrypt_additional_data_mismatch() {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);

        let nonce = [3u8; NONCE_SIZE];
        let plain = [1u8; 64];

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain, &[1], &nonce, &key));

        let mut decoded = vec![0u8; plain.len()];
        assert!(!decrypt(&mut decoded, &cipher, &[2], &nonce, &key));
    }

    #[test]
    fn test_exchange_shared_secret_agreement() {
        let (pub_a, sec_a) = sign_keypair();
        let (pub_b, sec_b) = sign_keypair();

        let exch_sec_a = secret_to_exchange(&sec_a).unwrap();
        let exch_sec_b = secret_to_exchange(&sec_b).unwrap();
        let exch_pub_a = public_to_exchange(&pub_a).unwrap();
        let exch_pub_b = public_to_exchange(&pub_b).unwrap();

        let shared_ab = shared_secret(&exch_sec_a, &exch_pub_b).unwrap();
        let shared_ba = shared_secret(&exch_sec_b, &exch_pub_a).unwrap();

        assert_eq!(shared_ab, shared_ba);
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let secret = [9u8; EXCHANGE_KEY_SIZE];

        let key_one = derive_key(&secret, b"material");
        let key_two = derive_key(&secret, b"material");
        let key_other = derive_key(&secret, b"other material");

        assert_eq!(key_one, key_two);
        assert_ne!(key_one, key_other);
    }
}
