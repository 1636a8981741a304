use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand_core::OsRng;
use std::fmt;

/// Length of a compressed SEC1 public key.
pub const PUBLIC_KEY_LEN: usize = 33;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    InvalidHex(String),
    InvalidLength(usize),
    InvalidPoint,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::InvalidHex(e) => write!(f, "invalid hex: {}", e),
            KeyError::InvalidLength(len) => write!(
                f,
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN, len
            ),
            KeyError::InvalidPoint => write!(f, "not a valid curve point"),
        }
    }
}

impl std::error::Error for KeyError {}

/// A peer or relay identity as seen on the network.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        p256::PublicKey::from_sec1_bytes(&raw).map_err(|_| KeyError::InvalidPoint)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

pub struct Keypair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

pub fn generate_keypair() -> Keypair {
    let secret_key = SecretKey::random(&mut OsRng);
    let point = secret_key.public_key().to_encoded_point(true);
    let mut raw = [0u8; PUBLIC_KEY_LEN];
    raw.copy_from_slice(point.as_bytes());

    Keypair {
        secret_key,
        public_key: PublicKey(raw),
    }
}
