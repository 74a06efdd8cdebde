//! Cryptographic and commitment primitives.
//!
//! Every protocol message is a keccak-256 hash of a canonically packed field
//! tuple, signed with the participant's long-term secp256k1 key. Packing
//! follows the EVM's `abi.encodePacked` discipline exactly: addresses are
//! 20 bytes, uint256 values are 32 bytes big-endian, bytes32 values are raw.
//! One byte of divergence makes the signature unverifiable on-chain.
//!
//! Signatures are 65-byte r‖s‖v records with v ∈ {27, 28}, produced and
//! recovered over the `\x19Ethereum Signed Message:\n32` prefix of the packed
//! digest, so on-chain `ecrecover`-based verifiers accept them as
//! wallet-signed data.

use ethers_core::types::{Address, Signature, H256, U256};
use ethers_core::utils::keccak256 as keccak256_raw;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

const ETH_SIGNED_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(bytes: impl AsRef<[u8]>) -> H256 {
    H256(keccak256_raw(bytes.as_ref()))
}

/// Expand a caller-provided seed into a 32-byte random value.
///
/// Deterministic for a non-empty seed (`keccak256(seed)`); an empty seed
/// draws 32 fresh bytes from the operating system CSPRNG.
pub fn expand_seed(seed: &[u8]) -> H256 {
    if seed.is_empty() {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        H256(bytes)
    } else {
        keccak256(seed)
    }
}

/// Incremental `abi.encodePacked` builder terminated by keccak-256.
///
/// Field widths are pinned by the on-chain contracts; tests hold this
/// against known Solidity vectors.
#[derive(Debug, Default)]
pub struct SolidityPacker {
    buf: Vec<u8>,
}

impl SolidityPacker {
    /// Start an empty packing buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a 20-byte address.
    pub fn address(mut self, value: Address) -> Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append a uint256 as 32 bytes big-endian.
    pub fn uint256(mut self, value: U256) -> Self {
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        self.buf.extend_from_slice(&bytes);
        self
    }

    /// Append a bytes32 value raw.
    pub fn bytes32(mut self, value: H256) -> Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append a byte run verbatim (e.g. a 65-byte signature echo).
    pub fn raw(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// The packed bytes, without hashing.
    pub fn bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Finish with keccak-256 over the packed bytes.
    pub fn hash(self) -> H256 {
        keccak256(self.buf)
    }
}

/// Errors from signing and recovery.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The private key bytes do not form a valid secp256k1 scalar.
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// The recovery byte is outside {27, 28}.
    #[error("invalid recovery id: v = {0}")]
    InvalidRecoveryId(u64),

    /// Signature parsing or public-key recovery failed.
    #[error("signature error: {0}")]
    Signature(#[from] k256::ecdsa::Error),
}

/// Holder of the local participant's long-term signing key.
///
/// The key never leaves this type; components ask it for signatures over
/// digests they assembled themselves.
pub struct Signer {
    key: SigningKey,
    address: Address,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Construct from raw 32-byte private key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    /// Construct from a fresh random key.
    pub fn random() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    /// The participant address derived from the verifying key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a packed digest, applying the eth-signed-message prefix.
    ///
    /// Returns r‖s‖v with v ∈ {27, 28}.
    pub fn sign_digest(&self, digest: H256) -> Signature {
        let prehash = eth_signed_digest(digest);
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(prehash.as_bytes())
            .expect("signing over a 32-byte prehash cannot fail");
        Signature {
            r: U256::from_big_endian(&sig.r().to_bytes()),
            s: U256::from_big_endian(&sig.s().to_bytes()),
            v: 27 + u64::from(recid.to_byte()),
        }
    }
}

/// Recover the signer address of a packed digest, prefix-consistent with
/// [`Signer::sign_digest`].
pub fn recover_signer(digest: H256, signature: &Signature) -> Result<Address, CryptoError> {
    let recid = match signature.v {
        27 | 28 => RecoveryId::try_from((signature.v - 27) as u8)
            .map_err(|_| CryptoError::InvalidRecoveryId(signature.v))?,
        v => return Err(CryptoError::InvalidRecoveryId(v)),
    };

    let mut rs = [0u8; 64];
    signature.r.to_big_endian(&mut rs[..32]);
    signature.s.to_big_endian(&mut rs[32..]);
    let sig = EcdsaSignature::from_slice(&rs)?;

    let prehash = eth_signed_digest(digest);
    let key = VerifyingKey::recover_from_prehash(prehash.as_bytes(), &sig, recid)?;
    Ok(address_of(&key))
}

/// `keccak256("\x19Ethereum Signed Message:\n32" ‖ digest)`, the digest an
/// EVM `ecrecover` verifier reconstructs for wallet-signed hashes.
pub fn eth_signed_digest(digest: H256) -> H256 {
    let mut buf = Vec::with_capacity(ETH_SIGNED_MESSAGE_PREFIX.len() + 32);
    buf.extend_from_slice(ETH_SIGNED_MESSAGE_PREFIX);
    buf.extend_from_slice(digest.as_bytes());
    keccak256(buf)
}

// The first byte of the uncompressed SEC1 encoding is the 0x04 tag, not part
// of the public key; the address is the low 20 bytes of the keccak of the rest.
fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256_raw(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}
