use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Content-derived identifier of a peer: truncated BLAKE3 hash of the
/// Ed25519 public key. The same key always derives the same id.
#[repr(transparent)]
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub struct PeerId([u8; PEER_ID_LEN]);
pub const PEER_ID_LEN: usize = 20;

pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 32;
const SEED_LEN: usize = 32;
const KEY_FILE_LEN: usize = SEED_LEN + PUBLIC_KEY_LEN;

impl PeerId {
    pub fn from_public_key(public: &VerifyingKey) -> PeerId {
        let hash = blake3::hash(public.as_bytes());
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..PEER_ID_LEN]);
        PeerId(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; PEER_ID_LEN]> for PeerId {
    fn from(value: [u8; PEER_ID_LEN]) -> Self {
        PeerId(value)
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = io::Error;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        match value.len() {
            PEER_ID_LEN => Ok(PeerId(value.try_into().unwrap())),
            _ => Err(io::Error::from(io::ErrorKind::InvalidData)),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = io::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != PEER_ID_LEN * 2 {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0])?;
            let lo = hex_val(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(PeerId(bytes))
    }
}

fn hex_val(c: u8) -> io::Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(io::Error::from(io::ErrorKind::InvalidData)),
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IdVisitor;
        impl<'de> serde::de::Visitor<'de> for IdVisitor {
            type Value = PeerId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{PEER_ID_LEN} bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<PeerId, E> {
                PeerId::try_from(v).map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<PeerId, A::Error> {
                let mut bytes = [0u8; PEER_ID_LEN];
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(PeerId(bytes))
            }
        }
        deserializer.deserialize_bytes(IdVisitor)
    }
}

/// The node's Ed25519 identity. Immutable once created; the derived
/// [`PeerId`] is a pure function of the public key.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Keypair {
        Keypair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.signing.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(msg).to_bytes()
    }

    /// Parses the marshalled form: 32-byte seed followed by the 32-byte
    /// public key. The public half must match the key re-derived from the
    /// seed, so truncation and bit rot are caught instead of silently
    /// producing a different identity.
    pub fn from_key_file_bytes(data: &[u8]) -> Result<Keypair> {
        if data.len() != KEY_FILE_LEN {
            return Err(Error::CorruptKeyFile(format!(
                "expected {KEY_FILE_LEN} bytes, found {}",
                data.len()
            )));
        }
        let seed: [u8; SEED_LEN] = data[..SEED_LEN].try_into().unwrap();
        let signing = SigningKey::from_bytes(&seed);
        if signing.verifying_key().to_bytes()[..] != data[SEED_LEN..] {
            return Err(Error::CorruptKeyFile(
                "public key does not match seed".to_string(),
            ));
        }
        Ok(Keypair { signing })
    }

    fn to_key_file_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut data = Zeroizing::new(Vec::with_capacity(KEY_FILE_LEN));
        data.extend_from_slice(self.signing.as_bytes());
        data.extend_from_slice(&self.public_bytes());
        data
    }
}

/// Verifies an identity signature made with [`Keypair::sign`].
pub fn verify_signature(public: &[u8; PUBLIC_KEY_LEN], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(public) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(sig) else {
        return false;
    };
    public.verify(msg, &sig).is_ok()
}

/// Loads the persisted identity, or generates and persists a fresh one if
/// the file does not exist. A present-but-unparseable file is an error: the
/// node must never mint a new identity over corrupt key material.
pub fn load_or_create(path: &Path) -> Result<Keypair> {
    match std::fs::read(path) {
        Ok(data) => Keypair::from_key_file_bytes(&data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            write_key_file(path, &keypair.to_key_file_bytes())?;
            log::info!("generated identity {} at {path:?}", keypair.peer_id());
            Ok(keypair)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(unix)]
fn write_key_file(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, data: &[u8]) -> io::Result<()> {
    std::fs::write(path, data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peer_id_is_pure_function_of_public_key() {
        let keypair = Keypair::generate();
        assert_eq!(keypair.peer_id(), PeerId::from_public_key(&keypair.public()));
        let text = keypair.peer_id().to_string();
        assert_eq!(text.parse::<PeerId>().unwrap(), keypair.peer_id());
    }

    #[test]
    fn reload_yields_identical_peer_id() {
        let dir = std::env::temp_dir().join(format!("relaypoint-id-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peer.key");
        _ = std::fs::remove_file(&path);

        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        assert!(matches!(
            Keypair::from_key_file_bytes(b"short"),
            Err(Error::CorruptKeyFile(_))
        ));
        let mut data = Keypair::generate().to_key_file_bytes().to_vec();
        data[40] ^= 0xff;
        assert!(matches!(
            Keypair::from_key_file_bytes(&data),
            Err(Error::CorruptKeyFile(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("relaypoint-perm-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peer.key");
        _ = std::fs::remove_file(&path);

        load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        _ = std::fs::remove_file(&path);
    }

    #[test]
    fn signature_round_trip() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"probe");
        assert!(verify_signature(&keypair.public_bytes(), b"probe", &sig));
        assert!(!verify_signature(&keypair.public_bytes(), b"other", &sig));
    }
}
