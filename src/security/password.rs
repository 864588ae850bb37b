use crate::error::LeafError;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const PBKDF2_NAME: &str = "PBKDF2WithHmacSHA256";
const SALT_BYTES: usize = 16;

pub const DEFAULT_ITERATIONS: u32 = 10_000;
pub const DEFAULT_KEY_BITS: u32 = 256;

/// PBKDF2-HMAC-SHA256 parameters, written as
/// `PBKDF2WithHmacSHA256:<iterations>:<key bits>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordAlgorithm {
    iterations: u32,
    key_bits: u32,
}

impl Default for PasswordAlgorithm {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

impl PasswordAlgorithm {
    pub fn new(iterations: u32, key_bits: u32) -> Result<Self, LeafError> {
        if iterations == 0 {
            return Err(LeafError::Password("iteration count must be positive".into()));
        }
        if key_bits == 0 || key_bits % 8 != 0 {
            return Err(LeafError::Password(format!(
                "key length {key_bits} must be a positive multiple of 8"
            )));
        }
        Ok(Self {
            iterations,
            key_bits,
        })
    }

    pub fn parse(text: &str) -> Result<Self, LeafError> {
        let mut parts = text.split(':');
        let (Some(name), Some(iterations), Some(bits), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(LeafError::Password(format!(
                "unparseable password algorithm '{text}'"
            )));
        };
        if name != PBKDF2_NAME {
            return Err(LeafError::Password(format!(
                "unsupported password algorithm '{name}'"
            )));
        }
        let iterations = iterations.parse::<u32>().map_err(|e| {
            LeafError::Password(format!("bad iteration count '{iterations}': {e}"))
        })?;
        let key_bits = bits
            .parse::<u32>()
            .map_err(|e| LeafError::Password(format!("bad key length '{bits}': {e}")))?;
        Self::new(iterations, key_bits)
    }

    pub fn identifier(&self) -> String {
        self.to_string()
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn derive(&self, plaintext: &str, salt: &[u8]) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(vec![0u8; (self.key_bits / 8) as usize]);
        pbkdf2::pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), salt, self.iterations, &mut out);
        out
    }

    /// Hashes `plaintext` under a fresh random salt.
    pub fn create_hashed(&self, plaintext: &str) -> Result<Password, LeafError> {
        let mut salt = [0u8; SALT_BYTES];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = self.derive(plaintext, &salt);
        Ok(Password {
            algorithm: *self,
            salt: hex::encode(salt),
            hash: hex::encode(hash.as_slice()),
        })
    }
}

impl fmt::Display for PasswordAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PBKDF2_NAME}:{}:{}", self.iterations, self.key_bits)
    }
}

/// A hashed credential. The plaintext is never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct Password {
    algorithm: PasswordAlgorithm,
    salt: String,
    hash: String,
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl Password {
    pub fn new(
        algorithm: PasswordAlgorithm,
        salt: impl Into<String>,
        hash: impl Into<String>,
    ) -> Result<Self, LeafError> {
        let salt = salt.into();
        let hash = hash.into();
        hex::decode(&salt).map_err(|e| LeafError::Password(format!("salt is not hex: {e}")))?;
        hex::decode(&hash).map_err(|e| LeafError::Password(format!("hash is not hex: {e}")))?;
        Ok(Self {
            algorithm,
            salt,
            hash,
        })
    }

    /// A credential that no plaintext satisfies.
    pub fn unusable() -> Self {
        Self {
            algorithm: PasswordAlgorithm::default(),
            salt: String::new(),
            hash: String::new(),
        }
    }

    pub fn algorithm(&self) -> PasswordAlgorithm {
        self.algorithm
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn check(&self, plaintext: &str) -> Result<bool, LeafError> {
        let expected = hex::decode(&self.hash)
            .map_err(|e| LeafError::Password(format!("hash is not hex: {e}")))?;
        if expected.is_empty() {
            return Ok(false);
        }
        let salt = hex::decode(&self.salt)
            .map_err(|e| LeafError::Password(format!("salt is not hex: {e}")))?;
        let actual = self.algorithm.derive(plaintext, &salt);
        Ok(expected.ct_eq(actual.as_slice()).into())
    }
}
